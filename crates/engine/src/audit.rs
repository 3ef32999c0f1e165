//! Audit recorder for privileged access
//!
//! Writes exactly one `audit_log` row inside the privileged transaction,
//! before the caller's callback runs. The row commits or rolls back together
//! with whatever the callback did.

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tenantry_core::{AuditAction, AuditLogEntry, Error, NewAuditEntry, PrivilegedRequest, Result};
use tracing::{debug, error, info};

use crate::backend::Driver;

/// Value of `metadata.scope` for bypass reads
pub(crate) const SCOPE_ALL_TENANTS: &str = "all_tenants";

pub(crate) struct AuditRecorder;

impl AuditRecorder {
    /// The row to write for `request`
    pub(crate) fn entry_for(request: &PrivilegedRequest) -> NewAuditEntry {
        NewAuditEntry {
            actor_id: request.actor_id().to_string(),
            actor_email: request.actor_email().to_string(),
            action: AuditAction::PrivilegedAccess,
            correlation_id: request.correlation_id().to_string(),
            reason: request.reason().to_string(),
            metadata: json!({
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "scope": SCOPE_ALL_TENANTS,
            }),
        }
    }

    /// Insert the audit row
    ///
    /// # Errors
    /// Any failure is returned as `AuditWriteFailed`; the caller must roll back.
    pub(crate) async fn record<B: Driver>(
        backend: &B,
        txn: &mut B::Transaction,
        request: &PrivilegedRequest,
    ) -> Result<AuditLogEntry> {
        let entry = Self::entry_for(request);
        debug!(target: "tenantry::audit", reason = %entry.reason, "Writing audit row");
        match backend.insert_audit(txn, &entry).await {
            Ok(row) => {
                info!(
                    target: "tenantry::audit",
                    audit_id = %row.id,
                    actor_id = %row.actor_id,
                    correlation_id = %row.correlation_id,
                    "Privileged access recorded"
                );
                Ok(row)
            }
            Err(e) => {
                error!(
                    target: "tenantry::audit",
                    actor_id = %entry.actor_id,
                    correlation_id = %entry.correlation_id,
                    error = %e,
                    "Audit write failed; privileged access refused"
                );
                Err(Error::AuditWriteFailed {
                    reason: e.to_string(),
                })
            }
        }
    }
}
