//! Context Cleanup Tests
//!
//! Pooled connections are reused, so nothing one call sets may be observable
//! by the next call on the same physical connection. These tests pin the
//! pool to a single connection to force that reuse.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenantry_core::{Error, PrivilegedRequest, TenantId};
use tenantry_engine::{Coordinator, Fault, MemoryBackend, PoolConfig};
use tracing_subscriber::EnvFilter;

const TENANT_KEY: &str = "app.current_tenant_id";
const BYPASS_KEY: &str = "app.bypass_rls";
const ACTOR: &str = "3d6f0a8e-0c1b-4f2e-9a7d-5b4c3e2f1a00";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tenantry=debug"))
        .with_test_writer()
        .try_init();
}

fn single_connection(acquire_timeout_ms: u64) -> (Coordinator<MemoryBackend>, MemoryBackend) {
    init_tracing();
    let backend = MemoryBackend::new(&PoolConfig {
        max_connections: 1,
        acquire_timeout_ms,
        ..PoolConfig::default()
    });
    (Coordinator::new(backend.clone()), backend)
}

async fn seed_tenant(coordinator: &Coordinator<MemoryBackend>, name: &str) -> TenantId {
    let name = name.to_string();
    coordinator
        .with_system_context(move |conn| Box::pin(async move { conn.executor().create_tenant(&name) }))
        .await
        .unwrap()
        .id
}

/// What a tenant call observes about its connection and settings
#[derive(Debug)]
struct Observed {
    connection_id: u64,
    in_transaction: bool,
    tenant: Option<String>,
    bypass: Option<String>,
    visible: usize,
}

async fn observe(coordinator: &Coordinator<MemoryBackend>, tenant: TenantId) -> Observed {
    coordinator
        .with_tenant_context(tenant, |tx| {
            Box::pin(async move {
                let conn = tx.executor();
                Ok::<_, Error>(Observed {
                    connection_id: conn.connection_id(),
                    in_transaction: conn.in_transaction(),
                    tenant: conn.current_setting(TENANT_KEY),
                    bypass: conn.current_setting(BYPASS_KEY),
                    visible: conn.count_records()?,
                })
            })
        })
        .await
        .unwrap()
}

/// After a privileged call, the next tenant call on the same connection
/// carries no bypass flag and sees only its own rows
#[tokio::test]
async fn test_no_bypass_residue_after_privileged_call() {
    let (coordinator, backend) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;
    let b = seed_tenant(&coordinator, "tenant-b").await;
    coordinator
        .with_tenant_context(a, |tx| Box::pin(async move { tx.executor().insert_record(json!({})) }))
        .await
        .unwrap();

    let privileged_conn = coordinator
        .with_privileged_context(
            PrivilegedRequest::new(ACTOR, "a@x.com", "corr-1", "billing").unwrap(),
            |tx| Box::pin(async move { Ok::<_, Error>(tx.executor().connection_id()) }),
        )
        .await
        .unwrap();

    let seen = observe(&coordinator, b).await;
    assert_eq!(seen.connection_id, privileged_conn);
    assert!(seen.in_transaction);
    assert_eq!(seen.tenant, Some(b.to_string()));
    assert_ne!(seen.bypass.as_deref(), Some("on"));
    assert_eq!(seen.visible, 0);
    assert_eq!(backend.connections_opened(), 1);
}

/// After a failed tenant call, the next call for another tenant starts clean
#[tokio::test]
async fn test_no_tenant_residue_after_failed_call() {
    let (coordinator, _) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;
    let b = seed_tenant(&coordinator, "tenant-b").await;

    let failed_conn = Arc::new(AtomicU64::new(0));
    let slot = failed_conn.clone();
    coordinator
        .with_tenant_context(a, move |tx| {
            Box::pin(async move {
                slot.store(tx.executor().connection_id(), Ordering::SeqCst);
                tx.executor().insert_record(json!({}))?;
                Err::<(), _>(Error::internal("handler failed"))
            })
        })
        .await
        .unwrap_err();

    let seen = observe(&coordinator, b).await;
    assert_eq!(seen.connection_id, failed_conn.load(Ordering::SeqCst));
    assert_eq!(seen.tenant, Some(b.to_string()));
    assert_eq!(seen.visible, 0);
}

/// A system call after a tenant call sees neither setting and runs in
/// autocommit mode
#[tokio::test]
async fn test_system_call_after_tenant_call_has_no_context() {
    let (coordinator, _) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;
    coordinator
        .with_tenant_context(a, |tx| Box::pin(async move { tx.executor().insert_record(json!({})) }))
        .await
        .unwrap();

    let (in_transaction, tenant, bypass, visible) = coordinator
        .with_system_context(|conn| {
            Box::pin(async move {
                let conn = conn.executor();
                Ok::<_, Error>((
                    conn.in_transaction(),
                    conn.current_setting(TENANT_KEY),
                    conn.current_setting(BYPASS_KEY),
                    conn.count_records()?,
                ))
            })
        })
        .await
        .unwrap();
    assert!(!in_transaction);
    assert_eq!(tenant, None);
    assert_eq!(bypass, None);
    assert_eq!(visible, 0);
}

/// A session-level assignment outlives the transaction and shows up on the
/// next checkout. The coordinator only ever assigns transaction-local values.
#[tokio::test]
async fn test_session_level_assignment_survives_checkout() {
    let (coordinator, _) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;
    let leaked = a.to_string();

    coordinator
        .with_tenant_context(a, move |tx| {
            Box::pin(async move { tx.executor().set_config(TENANT_KEY, &leaked, false) })
        })
        .await
        .unwrap();

    let residue = coordinator
        .with_system_context(|conn| {
            Box::pin(async move { Ok::<_, Error>(conn.executor().current_setting(TENANT_KEY)) })
        })
        .await
        .unwrap();
    assert_eq!(residue, Some(a.to_string()));
}

/// A failed clear is logged and counted; the transaction still commits
#[tokio::test]
async fn test_cleanup_failure_is_swallowed() {
    let (coordinator, backend) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;
    backend.inject_fault(Fault::ClearConfig);

    coordinator
        .with_tenant_context(a, |tx| Box::pin(async move { tx.executor().insert_record(json!({})) }))
        .await
        .unwrap();

    let snap = coordinator.metrics();
    assert_eq!(snap.cleanup_failures, 1);
    assert_eq!(snap.committed, 1);
    assert_eq!(observe(&coordinator, a).await.visible, 1);
}

/// Failing to open the transaction is a hard error; the callback never runs
#[tokio::test]
async fn test_begin_failure_propagates() {
    let (coordinator, backend) = single_connection(200);
    backend.inject_fault(Fault::Begin);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let err = coordinator
        .with_tenant_context(TenantId::new(), move |_tx| {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(coordinator.metrics().started, 0);
}

/// Waiting on a pool that never frees up fails with `PoolExhausted`
#[tokio::test]
async fn test_pool_exhaustion_is_reported() {
    let (coordinator, backend) = single_connection(50);
    let a = seed_tenant(&coordinator, "tenant-a").await;

    let nested = coordinator.clone();
    let err = coordinator
        .with_tenant_context(a, move |_tx| {
            Box::pin(async move {
                nested
                    .with_system_context(|_conn| Box::pin(async move { Ok::<_, Error>(()) }))
                    .await
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err, Error::PoolExhausted);
    assert_eq!(coordinator.metrics().rolled_back, 1);
    assert_eq!(backend.idle_connections(), 1);
}

/// Abandoning the future mid-callback drops the transaction and its writes
/// and releases its slot in the `active` gauge
#[tokio::test]
async fn test_dropped_future_rolls_back() {
    let (coordinator, backend) = single_connection(200);
    let a = seed_tenant(&coordinator, "tenant-a").await;

    let call = coordinator.with_tenant_context(a, |tx| {
        Box::pin(async move {
            tx.executor().insert_record(json!({}))?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Error>(())
        })
    });
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

    assert_eq!(backend.idle_connections(), 1);
    let snap = coordinator.metrics();
    assert_eq!(snap.active, 0);
    assert_eq!(snap.started, 1);
    assert_eq!(snap.total_completed(), 0);
    assert_eq!(observe(&coordinator, a).await.visible, 0);
}

/// A closed coordinator refuses every entry point
#[tokio::test]
async fn test_closed_coordinator_refuses_calls() {
    let (coordinator, _) = single_connection(200);
    coordinator.close().await;

    let err = coordinator
        .with_tenant_context(TenantId::new(), |_tx| Box::pin(async move { Ok::<_, Error>(()) }))
        .await
        .unwrap_err();
    assert_eq!(err, Error::PoolClosed);
}
