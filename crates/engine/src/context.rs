//! Session context setter
//!
//! Applies and clears the transaction-local settings read by the row
//! policies. Only the coordinator uses it.

use tenantry_core::{sqlstate, Error, Result, SessionConfigState, SessionKeys, SessionVar, ValueKind};
use tracing::{debug, warn};

use crate::backend::Driver;

pub(crate) struct ContextSetter<'a> {
    keys: &'a SessionKeys,
}

impl<'a> ContextSetter<'a> {
    pub(crate) fn new(keys: &'a SessionKeys) -> Self {
        Self { keys }
    }

    /// Assign whatever `state` requires; `System` assigns nothing
    pub(crate) async fn apply<B: Driver>(
        &self,
        backend: &B,
        txn: &mut B::Transaction,
        state: &SessionConfigState,
    ) -> Result<()> {
        debug!(target: "tenantry::context", context = state.label(), "Applying session context");
        match state.assignments() {
            Some((var, value)) => self.set_scoped(backend, txn, var, &value).await,
            None => Ok(()),
        }
    }

    /// Assign one setting for the rest of the transaction
    ///
    /// The tenant value is cast to `uuid` by the store; a value that cannot
    /// be represented fails the assignment, and with it the transaction, as
    /// `InvalidTenantId`.
    pub(crate) async fn set_scoped<B: Driver>(
        &self,
        backend: &B,
        txn: &mut B::Transaction,
        var: SessionVar,
        value: &str,
    ) -> Result<()> {
        let key = self.keys.name(var);
        debug!(target: "tenantry::context", key, "Setting transaction-local context");
        let result = backend.set_config(txn, key, value, var.kind()).await;
        match result {
            Err(e)
                if var.kind() == ValueKind::Uuid
                    && e.sqlstate() == Some(sqlstate::INVALID_TEXT_REPRESENTATION) =>
            {
                Err(Error::InvalidTenantId {
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            }
            other => other,
        }
    }

    /// Reset one setting to empty
    ///
    /// Failures are logged here and only reported back so the caller can
    /// count them.
    pub(crate) async fn clear<B: Driver>(
        &self,
        backend: &B,
        txn: &mut B::Transaction,
        var: SessionVar,
    ) -> Result<()> {
        let key = self.keys.name(var);
        backend.clear_config(txn, key).await.map_err(|e| {
            warn!(target: "tenantry::context", key, error = %e, "Failed to clear session setting");
            e
        })
    }

    /// Reset both settings regardless of which one was assigned
    pub(crate) async fn clear_all<B: Driver>(&self, backend: &B, txn: &mut B::Transaction) -> Cleared {
        let mut cleared = Cleared::default();
        for var in SessionVar::ALL {
            if let Err(e) = self.clear(backend, txn, var).await {
                cleared.failures += 1;
                cleared.aborted |= matches!(e, Error::TransactionAborted);
            }
        }
        cleared
    }
}

/// What a two-step clear ran into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cleared {
    /// Settings that could not be reset
    pub(crate) failures: u64,
    /// The store reported the transaction as already aborted
    pub(crate) aborted: bool,
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::{Fault, MemoryBackend};
    use crate::config::PoolConfig;
    use tenantry_core::TenantId;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(&PoolConfig::default())
    }

    #[tokio::test]
    async fn test_apply_tenant_sets_only_tenant_key() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);
        let tenant = TenantId::new();

        let mut txn = backend.begin().await.unwrap();
        setter
            .apply(&backend, &mut txn, &SessionConfigState::Tenant(tenant))
            .await
            .unwrap();
        assert_eq!(
            txn.current_setting("app.current_tenant_id"),
            Some(tenant.to_string())
        );
        assert_eq!(txn.current_setting("app.bypass_rls"), None);
    }

    #[tokio::test]
    async fn test_apply_system_sets_nothing() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);

        let mut txn = backend.begin().await.unwrap();
        setter
            .apply(&backend, &mut txn, &SessionConfigState::System)
            .await
            .unwrap();
        assert_eq!(txn.current_setting("app.current_tenant_id"), None);
        assert_eq!(txn.current_setting("app.bypass_rls"), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_tenant_is_invalid_tenant_id() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);

        let mut txn = backend.begin().await.unwrap();
        let err = setter
            .set_scoped(&backend, &mut txn, SessionVar::TenantId, "tenant-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTenantId { ref value, .. } if value == "tenant-a"));
        assert!(backend.commit(txn).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_all_resets_both_settings() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);

        let mut txn = backend.begin().await.unwrap();
        txn.set_config("app.current_tenant_id", &TenantId::new().to_string(), true)
            .unwrap();
        txn.set_config("app.bypass_rls", "on", true).unwrap();

        assert_eq!(setter.clear_all(&backend, &mut txn).await, Cleared::default());
        assert_eq!(txn.current_setting("app.current_tenant_id").as_deref(), Some(""));
        assert_eq!(txn.current_setting("app.bypass_rls").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_clear_failure_is_counted_not_raised() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);
        backend.inject_fault(Fault::ClearConfig);

        let mut txn = backend.begin().await.unwrap();
        txn.set_config("app.bypass_rls", "on", true).unwrap();
        let cleared = setter.clear_all(&backend, &mut txn).await;
        assert_eq!(cleared.failures, 1);
        assert!(!cleared.aborted);
        // The second clear still ran
        assert_eq!(txn.current_setting("app.bypass_rls").as_deref(), Some(""));
        backend.commit(txn).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_keys_are_used() {
        let keys = SessionKeys {
            tenant_key: "acme.tenant".into(),
            bypass_key: "acme.bypass".into(),
        };
        let backend = MemoryBackend::with_policy_keys(&PoolConfig::default(), keys.clone());
        let setter = ContextSetter::new(&keys);

        let mut txn = backend.begin().await.unwrap();
        setter
            .apply(&backend, &mut txn, &SessionConfigState::Privileged)
            .await
            .unwrap();
        assert_eq!(txn.current_setting("acme.bypass").as_deref(), Some("on"));
        assert_eq!(txn.current_setting("app.bypass_rls"), None);
    }

    #[tokio::test]
    async fn test_clear_all_reports_aborted_transaction() {
        let backend = backend();
        let keys = SessionKeys::default();
        let setter = ContextSetter::new(&keys);
        let tenant = TenantId::new();

        let mut txn = backend.begin().await.unwrap();
        setter
            .apply(&backend, &mut txn, &SessionConfigState::Tenant(tenant))
            .await
            .unwrap();
        // Writing for another tenant trips WITH CHECK and aborts the transaction
        assert!(txn.insert_record_for(TenantId::new(), serde_json::json!({})).is_err());

        let cleared = setter.clear_all(&backend, &mut txn).await;
        assert_eq!(cleared.failures, 2);
        assert!(cleared.aborted);
        backend.rollback(txn).await.unwrap();
    }
}
