//! Scoped handles passed to coordinator callbacks
//!
//! A handle proves that the matching context was established on the
//! transaction it wraps. It lends out the driver's query surface through
//! `executor()` and nothing else: no commit, no rollback, no access to the
//! pool. The three handle types are distinct, so a tenant handle can never be
//! passed where a privileged one is expected or the other way round.

use std::fmt;

use tenantry_core::{AuditLogEntry, TenantId};

use crate::backend::Driver;

/// A transaction filtered to one tenant
pub struct TenantTransaction<B: Driver> {
    txn: B::Transaction,
    tenant: TenantId,
}

impl<B: Driver> TenantTransaction<B> {
    pub(crate) fn new(txn: B::Transaction, tenant: TenantId) -> Self {
        Self { txn, tenant }
    }

    pub(crate) fn into_inner(self) -> B::Transaction {
        self.txn
    }

    /// The tenant whose rows are visible
    pub fn tenant_id(&self) -> TenantId {
        self.tenant
    }

    /// Run queries inside the transaction
    pub fn executor(&mut self) -> &mut B::Executor {
        B::executor(&mut self.txn)
    }
}

impl<B: Driver> fmt::Debug for TenantTransaction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantTransaction")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

/// An audited transaction with tenant filtering bypassed
pub struct PrivilegedTransaction<B: Driver> {
    txn: B::Transaction,
    audit: AuditLogEntry,
}

impl<B: Driver> PrivilegedTransaction<B> {
    pub(crate) fn new(txn: B::Transaction, audit: AuditLogEntry) -> Self {
        Self { txn, audit }
    }

    pub(crate) fn into_inner(self) -> B::Transaction {
        self.txn
    }

    /// The audit row written for this access, uncommitted until the callback succeeds
    pub fn audit_entry(&self) -> &AuditLogEntry {
        &self.audit
    }

    /// Run queries inside the transaction
    pub fn executor(&mut self) -> &mut B::Executor {
        B::executor(&mut self.txn)
    }
}

impl<B: Driver> fmt::Debug for PrivilegedTransaction<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegedTransaction")
            .field("audit_id", &self.audit.id)
            .field("correlation_id", &self.audit.correlation_id)
            .finish_non_exhaustive()
    }
}

/// A connection with neither setting assigned and no transaction opened
///
/// Statements run in autocommit mode unless the callback issues its own
/// transaction control.
pub struct SystemConnection<B: Driver> {
    conn: B::Connection,
}

impl<B: Driver> SystemConnection<B> {
    pub(crate) fn new(conn: B::Connection) -> Self {
        Self { conn }
    }

    /// Run queries on the connection
    pub fn executor(&mut self) -> &mut B::Executor {
        B::connection_executor(&mut self.conn)
    }
}

impl<B: Driver> fmt::Debug for SystemConnection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemConnection").finish_non_exhaustive()
    }
}
