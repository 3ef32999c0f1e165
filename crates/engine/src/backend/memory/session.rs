//! Query surface of the in-memory driver
//!
//! A [`MemorySession`] is one checked-out connection, optionally inside a
//! transaction. Inside a transaction, writes are buffered and applied on
//! commit, and the first failed statement aborts the transaction: every later
//! statement fails with `TransactionAborted` until it ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tenantry_core::{AuditLogEntry, Error, NewAuditEntry, Result, TenantId};
use tracing::debug;
use uuid::Uuid;

use super::pool::{Checkout, PhysicalConnection};
use super::tables::{
    foreign_key_violation, not_null_violation, parse_uuid, unique_violation, PendingWrite,
    Record, RowPolicy, TenantRecord,
};
use super::MemoryEngine;

#[derive(Debug, Default)]
struct TxnState {
    /// `set_config(.., true)`; gone when the transaction ends
    local: HashMap<String, String>,
    /// `set_config(.., false)` issued inside the transaction; kept on commit
    session: HashMap<String, String>,
    writes: Vec<PendingWrite>,
    failed: bool,
}

/// A pooled connection of the in-memory driver
///
/// Handed to callbacks through the coordinator's scoped handles. Dropping it
/// rolls back any open transaction and returns the connection to the pool.
pub struct MemorySession {
    engine: Arc<MemoryEngine>,
    conn: PhysicalConnection,
    _permit: tokio::sync::OwnedSemaphorePermit,
    txn: Option<TxnState>,
}

impl MemorySession {
    pub(crate) fn new(engine: Arc<MemoryEngine>, checkout: Checkout) -> Self {
        Self {
            engine,
            conn: checkout.conn,
            _permit: checkout.permit,
            txn: None,
        }
    }

    pub(crate) fn begin(&mut self) {
        self.txn = Some(TxnState::default());
    }

    /// Apply buffered writes and session-level settings
    ///
    /// An aborted transaction is discarded and reported as `TransactionAborted`.
    pub(crate) fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        if txn.failed {
            return Err(Error::TransactionAborted);
        }
        self.conn.settings.extend(txn.session);
        self.engine.tables.lock().apply(txn.writes);
        Ok(())
    }

    pub(crate) fn rollback(&mut self) {
        if let Some(txn) = self.txn.take() {
            debug!(
                target: "tenantry::txn",
                connection = self.conn.id,
                discarded_writes = txn.writes.len(),
                "Memory transaction rolled back"
            );
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.txn.as_ref().is_some_and(|t| t.failed)
    }

    /// Run one statement under the aborted-transaction rule
    pub(crate) fn statement<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.is_failed() {
            return Err(Error::TransactionAborted);
        }
        let result = f(self);
        if result.is_err() {
            if let Some(txn) = self.txn.as_mut() {
                txn.failed = true;
            }
        }
        result
    }

    pub(crate) fn assign(&mut self, key: &str, value: &str, is_local: bool) {
        match (self.txn.as_mut(), is_local) {
            (Some(txn), true) => {
                txn.local.insert(key.to_string(), value.to_string());
            }
            (Some(txn), false) => {
                txn.local.remove(key);
                txn.session.insert(key.to_string(), value.to_string());
            }
            (None, false) => {
                self.conn.settings.insert(key.to_string(), value.to_string());
            }
            // The implicit single-statement transaction ends immediately
            (None, true) => {}
        }
    }

    pub(crate) fn write_audit(&mut self, entry: &NewAuditEntry) -> Result<AuditLogEntry> {
        self.statement(|s| {
            parse_uuid(&entry.actor_id)?;
            let row = AuditLogEntry::from_new(entry, Uuid::new_v4(), Utc::now());
            s.write(PendingWrite::Audit(row.clone()));
            Ok(row)
        })
    }

    fn write(&mut self, write: PendingWrite) {
        match self.txn.as_mut() {
            Some(txn) => txn.writes.push(write),
            None => self.engine.tables.lock().apply(vec![write]),
        }
    }

    fn pending(&self) -> impl Iterator<Item = &PendingWrite> {
        self.txn.iter().flat_map(|t| t.writes.iter())
    }

    fn policy(&self) -> Result<RowPolicy> {
        let keys = &self.engine.keys;
        RowPolicy::from_settings(
            self.current_setting(&keys.tenant_key).as_deref(),
            self.current_setting(&keys.bypass_key).as_deref(),
        )
    }

    fn tenant_rows(&self) -> Vec<TenantRecord> {
        let mut rows = self.engine.tables.lock().tenants.clone();
        rows.extend(self.pending().filter_map(|w| match w {
            PendingWrite::Tenant(t) => Some(t.clone()),
            _ => None,
        }));
        rows
    }

    fn record_rows(&self) -> Vec<Record> {
        let mut rows = self.engine.tables.lock().records.clone();
        rows.extend(self.pending().filter_map(|w| match w {
            PendingWrite::Record(r) => Some(r.clone()),
            _ => None,
        }));
        rows
    }

    fn insert_checked(
        &mut self,
        policy: RowPolicy,
        tenant: TenantId,
        body: serde_json::Value,
    ) -> Result<Record> {
        policy.check_insert(tenant)?;
        if !self.tenant_rows().iter().any(|t| t.id == tenant) {
            return Err(foreign_key_violation(tenant));
        }
        let record = Record {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            body,
            created_at: Utc::now(),
        };
        self.write(PendingWrite::Record(record.clone()));
        Ok(record)
    }

    /// Identifier of the physical connection behind this session
    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// `current_setting(key, true)`: `None` when never assigned
    pub fn current_setting(&self, key: &str) -> Option<String> {
        if let Some(txn) = &self.txn {
            if let Some(v) = txn.local.get(key).or_else(|| txn.session.get(key)) {
                return Some(v.clone());
            }
        }
        self.conn.settings.get(key).cloned()
    }

    /// `set_config(key, value, is_local)`
    ///
    /// Outside a transaction a local assignment has no lasting effect, while
    /// a session assignment sticks to the physical connection.
    pub fn set_config(&mut self, key: &str, value: &str, is_local: bool) -> Result<()> {
        self.statement(|s| {
            s.assign(key, value, is_local);
            Ok(())
        })
    }

    /// Insert into the tenant registry
    pub fn create_tenant(&mut self, name: &str) -> Result<TenantRecord> {
        self.statement(|s| {
            if name.trim().is_empty() {
                return Err(not_null_violation("name", "tenants"));
            }
            if s.tenant_rows().iter().any(|t| t.name == name) {
                return Err(unique_violation(name));
            }
            let tenant = TenantRecord {
                id: TenantId::new(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            s.write(PendingWrite::Tenant(tenant.clone()));
            Ok(tenant)
        })
    }

    /// Every registered tenant; the registry is not tenant-filtered
    pub fn list_tenants(&mut self) -> Result<Vec<TenantRecord>> {
        self.statement(|s| Ok(s.tenant_rows()))
    }

    /// Insert a record owned by the current tenant setting
    ///
    /// The tenant column defaults to the setting, so an unset tenant fails
    /// the NOT NULL constraint.
    pub fn insert_record(&mut self, body: serde_json::Value) -> Result<Record> {
        self.statement(|s| {
            let policy = s.policy()?;
            let tenant = policy
                .tenant()
                .ok_or_else(|| not_null_violation("tenant_id", "records"))?;
            s.insert_checked(policy, tenant, body)
        })
    }

    /// Insert a record with an explicit tenant, subject to `WITH CHECK`
    pub fn insert_record_for(
        &mut self,
        tenant: TenantId,
        body: serde_json::Value,
    ) -> Result<Record> {
        self.statement(|s| {
            let policy = s.policy()?;
            s.insert_checked(policy, tenant, body)
        })
    }

    /// Records visible under the current settings
    pub fn list_records(&mut self) -> Result<Vec<Record>> {
        self.statement(|s| {
            let policy = s.policy()?;
            let mut rows: Vec<Record> = s
                .record_rows()
                .into_iter()
                .filter(|r| policy.allows(r.tenant_id))
                .collect();
            rows.sort_by_key(|r| r.created_at);
            Ok(rows)
        })
    }

    /// Number of records visible under the current settings
    pub fn count_records(&mut self) -> Result<usize> {
        self.list_records().map(|rows| rows.len())
    }

    /// The whole audit table; it is not tenant-filtered
    pub fn audit_log(&mut self) -> Result<Vec<AuditLogEntry>> {
        self.statement(|s| {
            let mut rows = s.engine.tables.lock().audit_log.clone();
            rows.extend(s.pending().filter_map(|w| match w {
                PendingWrite::Audit(a) => Some(a.clone()),
                _ => None,
            }));
            Ok(rows)
        })
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("connection_id", &self.conn.id)
            .field("in_transaction", &self.txn.is_some())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.rollback();
        let conn = PhysicalConnection {
            id: self.conn.id,
            settings: std::mem::take(&mut self.conn.settings),
        };
        self.engine.pool.release(conn);
    }
}
