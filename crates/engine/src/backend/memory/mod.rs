//! In-process driver
//!
//! Behaves like the PostgreSQL driver over `migrations/0001_tenancy.sql` for
//! everything the coordinator depends on: pooled connection reuse,
//! transaction-local vs session settings, the row policy on `records`, the
//! `uuid` actor column on `audit_log`, and aborted transactions. Used by the
//! test suites and for local development without a database.
//!
//! Failures can be injected with [`MemoryBackend::inject_fault`]; each
//! injected fault fires once.

mod pool;
mod session;
mod tables;

pub use session::MemorySession;
pub use tables::{Record, TenantRecord};

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tenantry_core::{AuditLogEntry, Error, NewAuditEntry, Result, SessionKeys, ValueKind};
use tracing::debug;

use super::Driver;
use crate::config::PoolConfig;
use pool::ConnectionPool;
use tables::{parse_uuid, Tables};

/// A driver operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Opening the transaction fails as if the connection dropped
    Begin,
    /// The next setting assignment fails and aborts the transaction
    SetConfig,
    /// The next setting reset fails; the transaction stays usable
    ClearConfig,
    /// The next audit insert fails and aborts the transaction
    AuditInsert,
    /// The next commit fails and the transaction is lost
    Commit,
}

#[derive(Debug)]
pub(crate) struct MemoryEngine {
    pool: ConnectionPool,
    keys: SessionKeys,
    tables: Mutex<Tables>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryEngine {
    fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                faults.remove(pos);
                debug!(target: "tenantry::pool", ?fault, "Injected fault fired");
                true
            }
            None => false,
        }
    }
}

fn injected(fault: Fault) -> Error {
    Error::database("XX000", format!("injected {:?} failure", fault))
}

/// In-memory stand-in for a PostgreSQL database with row-level security
///
/// Cloning is cheap; clones share tables and pool.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    engine: Arc<MemoryEngine>,
}

impl MemoryBackend {
    /// Backend whose row policy reads the default setting names
    pub fn new(config: &PoolConfig) -> Self {
        Self::with_policy_keys(config, SessionKeys::default())
    }

    /// Backend whose row policy reads custom setting names
    ///
    /// [`Coordinator::new`](crate::Coordinator::new) picks these names up;
    /// `Coordinator::with_session_keys` refuses different ones.
    pub fn with_policy_keys(config: &PoolConfig, keys: SessionKeys) -> Self {
        Self {
            engine: Arc::new(MemoryEngine {
                pool: ConnectionPool::new(config),
                keys,
                tables: Mutex::new(Tables::default()),
                faults: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next occurrence of `fault` fail
    pub fn inject_fault(&self, fault: Fault) {
        self.engine.faults.lock().push(fault);
    }

    /// Connections currently parked in the pool
    pub fn idle_connections(&self) -> usize {
        self.engine.pool.idle_count()
    }

    /// Physical connections opened since creation
    pub fn connections_opened(&self) -> u64 {
        self.engine.pool.opened_count()
    }

    async fn checkout(&self) -> Result<MemorySession> {
        let checkout = self.engine.pool.checkout().await?;
        Ok(MemorySession::new(self.engine.clone(), checkout))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

#[async_trait]
impl Driver for MemoryBackend {
    type Transaction = MemorySession;
    type Connection = MemorySession;
    type Executor = MemorySession;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn policy_keys(&self) -> Option<&SessionKeys> {
        Some(&self.engine.keys)
    }

    async fn begin(&self) -> Result<Self::Transaction> {
        if self.engine.take_fault(Fault::Begin) {
            return Err(Error::Connection {
                reason: "injected Begin failure".to_string(),
            });
        }
        let mut session = self.checkout().await?;
        session.begin();
        Ok(session)
    }

    async fn acquire(&self) -> Result<Self::Connection> {
        self.checkout().await
    }

    async fn set_config(
        &self,
        txn: &mut Self::Transaction,
        key: &str,
        value: &str,
        kind: ValueKind,
    ) -> Result<()> {
        let fail = self.engine.take_fault(Fault::SetConfig);
        txn.statement(|s| {
            if fail {
                return Err(injected(Fault::SetConfig));
            }
            let value = match kind {
                ValueKind::Uuid => parse_uuid(value)?.to_string(),
                ValueKind::Text => value.to_string(),
            };
            s.assign(key, &value, true);
            Ok(())
        })
    }

    async fn clear_config(&self, txn: &mut Self::Transaction, key: &str) -> Result<()> {
        if txn.is_failed() {
            return Err(Error::TransactionAborted);
        }
        // Rolled back to the savepoint: the transaction stays healthy
        if self.engine.take_fault(Fault::ClearConfig) {
            return Err(injected(Fault::ClearConfig));
        }
        txn.assign(key, "", true);
        Ok(())
    }

    async fn insert_audit(
        &self,
        txn: &mut Self::Transaction,
        entry: &NewAuditEntry,
    ) -> Result<AuditLogEntry> {
        if self.engine.take_fault(Fault::AuditInsert) {
            return txn.statement(|_| Err(injected(Fault::AuditInsert)));
        }
        txn.write_audit(entry)
    }

    async fn commit(&self, mut txn: Self::Transaction) -> Result<()> {
        if self.engine.take_fault(Fault::Commit) {
            txn.rollback();
            return Err(Error::Connection {
                reason: "injected Commit failure".to_string(),
            });
        }
        txn.commit()
    }

    async fn rollback(&self, mut txn: Self::Transaction) -> Result<()> {
        txn.rollback();
        Ok(())
    }

    async fn close(&self) {
        self.engine.pool.close();
    }

    fn executor(txn: &mut Self::Transaction) -> &mut Self::Executor {
        txn
    }

    fn connection_executor(conn: &mut Self::Connection) -> &mut Self::Executor {
        conn
    }
}
