//! Privileged Access Audit Tests
//!
//! Every privileged transaction is paired with exactly one audit row written
//! in the same transaction. No audit row means no privileged query, and a
//! rolled-back privileged query leaves no audit row.

use serde_json::json;
use tenantry_core::{AuditLogEntry, Error, PrivilegedRequest, TenantId};
use tenantry_engine::{Coordinator, Fault, MemoryBackend, PoolConfig, Record};

const ACTOR: &str = "3d6f0a8e-0c1b-4f2e-9a7d-5b4c3e2f1a00";

fn setup() -> (Coordinator<MemoryBackend>, MemoryBackend) {
    let backend = MemoryBackend::new(&PoolConfig {
        max_connections: 4,
        acquire_timeout_ms: 500,
        ..PoolConfig::default()
    });
    (Coordinator::new(backend.clone()), backend)
}

fn request(actor_id: &str, correlation_id: &str) -> PrivilegedRequest {
    PrivilegedRequest::new(actor_id, "a@x.com", correlation_id, "billing").unwrap()
}

async fn seed_tenant_with_record(coordinator: &Coordinator<MemoryBackend>, name: &str) -> TenantId {
    let name = name.to_string();
    let tenant = coordinator
        .with_system_context(move |conn| Box::pin(async move { conn.executor().create_tenant(&name) }))
        .await
        .unwrap()
        .id;
    coordinator
        .with_tenant_context(tenant, |tx| {
            Box::pin(async move { tx.executor().insert_record(json!({ "owner": "seed" })) })
        })
        .await
        .unwrap();
    tenant
}

async fn audit_rows(coordinator: &Coordinator<MemoryBackend>) -> Vec<AuditLogEntry> {
    coordinator
        .with_system_context(|conn| Box::pin(async move { conn.executor().audit_log() }))
        .await
        .unwrap()
}

async fn list_all(
    coordinator: &Coordinator<MemoryBackend>,
    request: PrivilegedRequest,
) -> Result<Vec<Record>, Error> {
    coordinator
        .with_privileged_context(request, |tx| {
            Box::pin(async move { tx.executor().list_records() })
        })
        .await
}

/// Privileged read returns both tenants' records and one audit row
#[tokio::test]
async fn test_privileged_read_spans_tenants_with_one_audit_row() {
    let (coordinator, _) = setup();
    let a = seed_tenant_with_record(&coordinator, "tenant-a").await;
    let b = seed_tenant_with_record(&coordinator, "tenant-b").await;

    let records = list_all(&coordinator, request(ACTOR, "corr-1")).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.tenant_id == a));
    assert!(records.iter().any(|r| r.tenant_id == b));

    let rows = audit_rows(&coordinator).await;
    let matching: Vec<_> = rows.iter().filter(|r| r.correlation_id == "corr-1").collect();
    assert_eq!(matching.len(), 1);

    let row = matching[0];
    assert_eq!(row.actor_id, ACTOR);
    assert_eq!(row.actor_email, "a@x.com");
    assert_eq!(row.reason, "billing");
    assert_eq!(row.action, "privileged_cross_tenant_access");
    assert_eq!(row.metadata["scope"], "all_tenants");
    assert!(row.metadata["timestamp"].is_string());

    let snap = coordinator.metrics();
    assert_eq!(snap.privileged, 1);
    assert_eq!(snap.audit_failures, 0);
}

/// A malformed actor id fails the audit insert, so nothing runs and nothing is logged
#[tokio::test]
async fn test_malformed_actor_fails_without_audit_row() {
    let (coordinator, _) = setup();
    seed_tenant_with_record(&coordinator, "tenant-a").await;

    let err = list_all(&coordinator, request("not-a-uuid", "corr-bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuditWriteFailed { .. }));
    assert!(audit_rows(&coordinator).await.is_empty());

    let snap = coordinator.metrics();
    assert_eq!(snap.audit_failures, 1);
    assert_eq!(snap.rolled_back, 1);
}

/// The callback never runs when the audit row cannot be written
#[tokio::test]
async fn test_audit_failure_skips_callback() {
    let (coordinator, backend) = setup();
    let tenant = seed_tenant_with_record(&coordinator, "tenant-a").await;
    backend.inject_fault(Fault::AuditInsert);

    let err = coordinator
        .with_privileged_context(request(ACTOR, "corr-2"), move |tx| {
            Box::pin(async move {
                tx.executor().insert_record_for(tenant, json!({ "owner": "ops" }))?;
                Ok::<_, Error>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuditWriteFailed { .. }));

    let count = coordinator
        .with_tenant_context(tenant, |tx| Box::pin(async move { tx.executor().count_records() }))
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(audit_rows(&coordinator).await.is_empty());
}

/// A failing privileged callback rolls back its audit row too
#[tokio::test]
async fn test_failed_callback_rolls_back_audit_row() {
    let (coordinator, _) = setup();
    let tenant = seed_tenant_with_record(&coordinator, "tenant-a").await;

    let err = coordinator
        .with_privileged_context(request(ACTOR, "corr-3"), move |tx| {
            Box::pin(async move {
                tx.executor().insert_record_for(tenant, json!({ "owner": "ops" }))?;
                Err::<(), _>(Error::internal("report generation failed"))
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err, Error::internal("report generation failed"));

    assert!(audit_rows(&coordinator).await.is_empty());
    let count = coordinator
        .with_tenant_context(tenant, |tx| Box::pin(async move { tx.executor().count_records() }))
        .await
        .unwrap();
    assert_eq!(count, 1);
}

/// A failed commit loses the audit row and the query effects together
#[tokio::test]
async fn test_commit_failure_loses_audit_row_and_effects() {
    let (coordinator, backend) = setup();
    let tenant = seed_tenant_with_record(&coordinator, "tenant-a").await;
    backend.inject_fault(Fault::Commit);

    coordinator
        .with_privileged_context(request(ACTOR, "corr-4"), move |tx| {
            Box::pin(async move { tx.executor().insert_record_for(tenant, json!({})) })
        })
        .await
        .unwrap_err();

    assert!(audit_rows(&coordinator).await.is_empty());
    let count = coordinator
        .with_tenant_context(tenant, |tx| Box::pin(async move { tx.executor().count_records() }))
        .await
        .unwrap();
    assert_eq!(count, 1);
}

/// The callback sees the uncommitted audit row through its own handle
#[tokio::test]
async fn test_audit_row_written_before_callback() {
    let (coordinator, _) = setup();

    let (entry_id, visible) = coordinator
        .with_privileged_context(request(ACTOR, "corr-5"), |tx| {
            Box::pin(async move {
                let entry_id = tx.audit_entry().id;
                let visible = tx.executor().audit_log()?;
                Ok::<_, Error>((entry_id, visible))
            })
        })
        .await
        .unwrap();

    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, entry_id);
    assert_eq!(audit_rows(&coordinator).await[0].id, entry_id);
}

/// Concurrent privileged calls each get their own transaction and audit row
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_privileged_calls_each_audited() {
    let (coordinator, _) = setup();
    seed_tenant_with_record(&coordinator, "tenant-a").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            list_all(&coordinator, request(ACTOR, &format!("corr-c{i}"))).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 1);
    }

    let rows = audit_rows(&coordinator).await;
    assert_eq!(rows.len(), 8);
    for i in 0..8 {
        let corr = format!("corr-c{i}");
        assert_eq!(rows.iter().filter(|r| r.correlation_id == corr).count(), 1);
    }
}

/// Missing audit fields are rejected before any transaction opens
#[test]
fn test_request_requires_all_fields() {
    let err = PrivilegedRequest::new(ACTOR, "a@x.com", "corr-6", "  ").unwrap_err();
    assert_eq!(err, Error::MissingField { field: "reason" });
}
