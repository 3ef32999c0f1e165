//! Transaction coordinator
//!
//! Every database operation goes through exactly one of three entry points:
//!
//! - [`Coordinator::with_tenant_context`]: one transaction, rows filtered to a tenant
//! - [`Coordinator::with_privileged_context`]: one transaction, filtering bypassed,
//!   paired with an audit row written before the callback runs
//! - [`Coordinator::with_system_context`]: a bare connection with no settings,
//!   for tables that sit above tenancy
//!
//! The scoped paths walk the same phases:
//!
//! ```text
//! Idle -> ContextSet -> CallbackRunning -> ContextCleared -> Committing | RollingBack -> Closed
//! ```
//!
//! Both settings are cleared on every exit path, including setup failures.
//! Clear failures are logged and counted, never returned. A callback error is
//! returned to the caller unchanged after rollback.
//!
//! A callback that returns `Ok` after swallowing a failed statement leaves an
//! aborted transaction behind. PostgreSQL would answer the COMMIT with a
//! silent ROLLBACK, so the coordinator rolls back and returns
//! `TransactionAborted` instead of reporting success.
//!
//! If the returned future is dropped or the callback panics, the open
//! transaction is dropped with it and the driver rolls it back.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tenantry_core::{Error, PrivilegedRequest, Result, SessionConfigState, SessionKeys, TenantId};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::AuditRecorder;
use crate::backend::Driver;
use crate::context::{Cleared, ContextSetter};
use crate::handle::{PrivilegedTransaction, SystemConnection, TenantTransaction};
use crate::metrics::{ActiveTxn, CoordinatorMetrics, MetricsSnapshot};

/// Phases of a scoped transaction, used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    /// Opening the transaction
    Idle,
    /// Settings assigned, audit row written for privileged access
    ContextSet,
    /// Caller's callback holds the handle
    CallbackRunning,
    /// Both settings reset
    ContextCleared,
    /// Commit issued
    Committing,
    /// Rollback issued
    RollingBack,
    /// Connection returned to the pool
    Closed,
}

impl fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnPhase::Idle => "idle",
            TxnPhase::ContextSet => "context_set",
            TxnPhase::CallbackRunning => "callback_running",
            TxnPhase::ContextCleared => "context_cleared",
            TxnPhase::Committing => "committing",
            TxnPhase::RollingBack => "rolling_back",
            TxnPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner<B: Driver> {
    backend: B,
    keys: SessionKeys,
    metrics: CoordinatorMetrics,
}

/// Entry point for all data access
///
/// Cheap to clone; clones share the driver and its pool.
pub struct Coordinator<B: Driver> {
    inner: Arc<Inner<B>>,
}

impl<B: Driver> Clone for Coordinator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Driver> fmt::Debug for Coordinator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("backend", &self.inner.backend.name())
            .field("keys", &self.inner.keys)
            .finish()
    }
}

#[cfg(feature = "postgres")]
impl Coordinator<crate::backend::postgres::PgBackend> {
    /// Open a PostgreSQL pool and wrap it
    ///
    /// # Errors
    /// `InvalidConfig` for a bad configuration, otherwise the connection error.
    pub async fn connect(config: &crate::config::TenantryConfig) -> Result<Self> {
        let backend = crate::backend::postgres::PgBackend::connect(config).await?;
        Self::with_session_keys(backend, config.session.clone())
    }
}

impl<B: Driver> Coordinator<B> {
    /// Coordinator using the setting names the backend's policy reads
    ///
    /// That is the in-process policy's names for the memory driver and the
    /// default names otherwise.
    pub fn new(backend: B) -> Self {
        let keys = backend.policy_keys().cloned().unwrap_or_default();
        Self::build(backend, keys)
    }

    /// Coordinator using custom setting names
    ///
    /// # Errors
    /// `InvalidConfig` if the names are not valid dotted setting names, or if
    /// the backend's own row policy reads different names.
    pub fn with_session_keys(backend: B, keys: SessionKeys) -> Result<Self> {
        keys.validate()?;
        if let Some(policy) = backend.policy_keys() {
            if *policy != keys {
                return Err(Error::invalid_config(format!(
                    "session keys {}/{} do not match the {} policy keys {}/{}",
                    keys.tenant_key,
                    keys.bypass_key,
                    backend.name(),
                    policy.tenant_key,
                    policy.bypass_key
                )));
            }
        }
        Ok(Self::build(backend, keys))
    }

    fn build(backend: B, keys: SessionKeys) -> Self {
        info!(target: "tenantry::txn", backend = backend.name(), tenant_key = %keys.tenant_key, "Coordinator ready");
        Self {
            inner: Arc::new(Inner {
                backend,
                keys,
                metrics: CoordinatorMetrics::default(),
            }),
        }
    }

    /// Setting names assigned by this coordinator
    pub fn session_keys(&self) -> &SessionKeys {
        &self.inner.keys
    }

    /// Snapshot of the coordinator counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Close the pool; later calls fail with `PoolClosed`
    pub async fn close(&self) {
        self.inner.backend.close().await;
        info!(target: "tenantry::txn", "Coordinator closed");
    }

    /// Run `f` in one transaction whose rows are filtered to `tenant`
    ///
    /// Commits when `f` returns `Ok`, rolls back and returns its error
    /// otherwise. No audit row is written.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let records = coordinator
    ///     .with_tenant_context(tenant, |tx| Box::pin(async move { tx.executor().list_records() }))
    ///     .await?;
    /// ```
    pub async fn with_tenant_context<F, T, E>(&self, tenant: TenantId, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut TenantTransaction<B>) -> BoxFuture<'t, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        let span = info_span!(target: "tenantry::txn", "tenant_txn", tenant = %tenant);
        self.inner.run_tenant(tenant, f).instrument(span).await
    }

    /// Run `f` in one transaction with tenant filtering bypassed
    ///
    /// The audit row for `request` is written first, in the same transaction.
    /// If it cannot be written the transaction is rolled back, `f` never runs
    /// and `AuditWriteFailed` is returned. When `f` fails, its error is
    /// returned and the audit row is rolled back along with everything else.
    pub async fn with_privileged_context<F, T, E>(
        &self,
        request: PrivilegedRequest,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut PrivilegedTransaction<B>) -> BoxFuture<'t, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        let span = info_span!(
            target: "tenantry::txn",
            "privileged_txn",
            actor_id = %request.actor_id(),
            correlation_id = %request.correlation_id(),
        );
        self.inner.run_privileged(request, f).instrument(span).await
    }

    /// Run `f` on a connection with neither setting assigned
    ///
    /// No transaction is opened and nothing is cleared afterwards. Tenant-scoped
    /// tables show no rows here.
    pub async fn with_system_context<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut SystemConnection<B>) -> BoxFuture<'c, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        let span = info_span!(target: "tenantry::txn", "system_call");
        self.inner.run_system(f).instrument(span).await
    }
}

impl<B: Driver> Inner<B> {
    fn setter(&self) -> ContextSetter<'_> {
        ContextSetter::new(&self.keys)
    }

    async fn run_tenant<F, T, E>(&self, tenant: TenantId, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut TenantTransaction<B>) -> BoxFuture<'t, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        let (mut txn, _active) = self.begin().await?;
        let state = SessionConfigState::Tenant(tenant);
        if let Err(e) = self.setter().apply(&self.backend, &mut txn, &state).await {
            warn!(target: "tenantry::txn", phase = %TxnPhase::ContextSet, error = %e, "Tenant context not established");
            self.abort(txn).await;
            return Err(e.into());
        }

        debug!(target: "tenantry::txn", phase = %TxnPhase::CallbackRunning, "Tenant context set");
        let mut handle = TenantTransaction::new(txn, tenant);
        let outcome = f(&mut handle).await;
        self.finish(handle.into_inner(), outcome).await
    }

    async fn run_privileged<F, T, E>(
        &self,
        request: PrivilegedRequest,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut PrivilegedTransaction<B>) -> BoxFuture<'t, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        let (mut txn, _active) = self.begin().await?;
        self.metrics.record_privileged();

        let setup = self.privileged_setup(&mut txn, &request).await;
        let audit = match setup {
            Ok(audit) => audit,
            Err(e) => {
                if matches!(e, Error::AuditWriteFailed { .. }) {
                    self.metrics.record_audit_failure();
                }
                warn!(target: "tenantry::txn", phase = %TxnPhase::ContextSet, error = %e, "Privileged context not established");
                self.abort(txn).await;
                return Err(e.into());
            }
        };

        debug!(target: "tenantry::txn", phase = %TxnPhase::CallbackRunning, audit_id = %audit.id, "Privileged context set");
        let mut handle = PrivilegedTransaction::new(txn, audit);
        let outcome = f(&mut handle).await;
        self.finish(handle.into_inner(), outcome).await
    }

    async fn privileged_setup(
        &self,
        txn: &mut B::Transaction,
        request: &PrivilegedRequest,
    ) -> Result<tenantry_core::AuditLogEntry> {
        self.setter()
            .apply(&self.backend, txn, &SessionConfigState::Privileged)
            .await?;
        AuditRecorder::record(&self.backend, txn, request).await
    }

    async fn run_system<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut SystemConnection<B>) -> BoxFuture<'c, std::result::Result<T, E>>
            + Send,
        T: Send,
        E: From<Error> + Send,
    {
        self.metrics.record_system_call();
        let conn = self.backend.acquire().await.map_err(|e| {
            warn!(target: "tenantry::txn", error = %e, "Could not acquire connection");
            e
        })?;
        let mut handle = SystemConnection::new(conn);
        f(&mut handle).await
    }

    async fn begin(&self) -> Result<(B::Transaction, ActiveTxn<'_>)> {
        let txn = self.backend.begin().await.map_err(|e| {
            warn!(target: "tenantry::txn", phase = %TxnPhase::Idle, error = %e, "Could not open transaction");
            e
        })?;
        Ok((txn, self.metrics.record_start()))
    }

    async fn clear(&self, txn: &mut B::Transaction) -> Cleared {
        let cleared = self.setter().clear_all(&self.backend, txn).await;
        self.metrics.record_cleanup_failures(cleared.failures);
        debug!(
            target: "tenantry::txn",
            phase = %TxnPhase::ContextCleared,
            failures = cleared.failures,
            aborted = cleared.aborted,
            "Context cleared"
        );
        cleared
    }

    /// Clear, then commit or roll back according to the callback's outcome
    async fn finish<T, E>(
        &self,
        mut txn: B::Transaction,
        outcome: std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let cleared = self.clear(&mut txn).await;
        match outcome {
            Ok(_) if cleared.aborted => {
                warn!(target: "tenantry::txn", phase = %TxnPhase::RollingBack, "Callback returned Ok on an aborted transaction");
                self.rollback(txn).await;
                Err(Error::TransactionAborted.into())
            }
            Ok(value) => match self.backend.commit(txn).await {
                Ok(()) => {
                    self.metrics.record_commit();
                    debug!(target: "tenantry::txn", phase = %TxnPhase::Closed, "Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    self.metrics.record_rollback();
                    warn!(target: "tenantry::txn", phase = %TxnPhase::Committing, error = %e, "Commit failed");
                    Err(e.into())
                }
            },
            Err(err) => {
                debug!(target: "tenantry::txn", phase = %TxnPhase::RollingBack, "Callback failed");
                self.rollback(txn).await;
                Err(err)
            }
        }
    }

    /// Tear down a transaction whose setup failed
    async fn abort(&self, mut txn: B::Transaction) {
        self.clear(&mut txn).await;
        self.rollback(txn).await;
    }

    async fn rollback(&self, txn: B::Transaction) {
        if let Err(e) = self.backend.rollback(txn).await {
            warn!(target: "tenantry::txn", phase = %TxnPhase::RollingBack, error = %e, "Rollback failed");
        }
        self.metrics.record_rollback();
    }
}
