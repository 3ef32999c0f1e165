//! Drivers behind the coordinator
//!
//! A driver owns the connection pool and knows how to open transactions,
//! assign transaction-local settings and write audit rows. The trait is
//! sealed: it is declared in a private module, so code outside this crate can
//! name a driver type (to write `Coordinator<PgBackend>`) but can never call
//! `begin`, `acquire` or `set_config` on it. Database access is only handed
//! out by the coordinator's entry points, wrapped in a scoped handle.
//!
//! New data-access paths are added as coordinator methods, not as new driver
//! operations reachable from outside.

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub(crate) use private::Driver;

mod private {
    use async_trait::async_trait;
    use tenantry_core::{AuditLogEntry, NewAuditEntry, Result, SessionKeys, ValueKind};

    /// Operations the coordinator needs from a store
    #[async_trait]
    pub trait Driver: Send + Sync + 'static {
        /// An open transaction holding one pooled connection
        type Transaction: Send;
        /// A pooled connection outside any transaction
        type Connection: Send;
        /// What scoped handles expose for running queries
        type Executor: ?Sized + Send;

        /// Short driver name for logs
        fn name(&self) -> &'static str;

        /// Setting names the driver's own row policy reads, if it has one
        ///
        /// PostgreSQL policies live in the schema, so only the memory driver
        /// knows them.
        fn policy_keys(&self) -> Option<&SessionKeys> {
            None
        }

        /// Check out a connection and open a transaction on it
        async fn begin(&self) -> Result<Self::Transaction>;

        /// Check out a connection without opening a transaction
        async fn acquire(&self) -> Result<Self::Connection>;

        /// Assign a setting for the rest of this transaction only
        ///
        /// Must use the transaction-local form of assignment: pooled
        /// connections are reused, and a session-level value would survive
        /// into the next borrower's transaction.
        async fn set_config(
            &self,
            txn: &mut Self::Transaction,
            key: &str,
            value: &str,
            kind: ValueKind,
        ) -> Result<()>;

        /// Reset a setting to empty without poisoning the transaction on failure
        async fn clear_config(&self, txn: &mut Self::Transaction, key: &str) -> Result<()>;

        /// Insert one audit row inside the transaction
        async fn insert_audit(
            &self,
            txn: &mut Self::Transaction,
            entry: &NewAuditEntry,
        ) -> Result<AuditLogEntry>;

        /// Commit and return the connection to the pool
        async fn commit(&self, txn: Self::Transaction) -> Result<()>;

        /// Roll back and return the connection to the pool
        async fn rollback(&self, txn: Self::Transaction) -> Result<()>;

        /// Close the pool; pending and future checkouts fail
        async fn close(&self);

        /// Query surface of an open transaction
        fn executor(txn: &mut Self::Transaction) -> &mut Self::Executor;

        /// Query surface of a bare connection
        fn connection_executor(conn: &mut Self::Connection) -> &mut Self::Executor;
    }
}
