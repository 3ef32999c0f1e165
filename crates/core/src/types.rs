//! Domain types for tenant isolation
//!
//! This module defines:
//! - TenantId: validated identifier written into the tenant session variable
//! - PrivilegedRequest: the four mandatory facts behind a cross-tenant read
//! - NewAuditEntry / AuditLogEntry: the audit row written for that read
//! - AuditAction: the fixed action literals stored in `audit_log.action`

use crate::error::{Error, Result};
use crate::limits::Limits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a tenant
///
/// A TenantId is a wrapper around a non-nil UUID. Values are validated at the
/// request boundary with [`TenantId::parse`] or [`TenantId::require`], so
/// the coordinator only ever receives well-formed identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Create a new random TenantId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a TenantId from its string representation
    ///
    /// # Errors
    /// Returns `InvalidTenantId` if the string is not a UUID or is the nil UUID.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let uuid = Uuid::parse_str(trimmed).map_err(|e| Error::InvalidTenantId {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        if uuid.is_nil() {
            return Err(Error::InvalidTenantId {
                value: s.to_string(),
                reason: "nil uuid is reserved".to_string(),
            });
        }
        Ok(Self(uuid))
    }

    /// Resolve the tenant for a request that must carry one
    ///
    /// Requests without tenant context are rejected here, before they reach
    /// the coordinator. The row policies also fail closed when the variable is
    /// unset; both layers are kept.
    ///
    /// # Errors
    /// `MissingTenantContext` for `None` or blank input, otherwise as [`TenantId::parse`].
    pub fn require(value: Option<&str>) -> Result<Self> {
        match value {
            Some(v) if !v.trim().is_empty() => Self::parse(v),
            _ => Err(Error::MissingTenantContext),
        }
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed action literals stored in `audit_log.action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// A read that bypassed tenant row filtering
    PrivilegedAccess,
}

impl AuditAction {
    /// The literal persisted in the audit table
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PrivilegedAccess => "privileged_cross_tenant_access",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One specific, justified, cross-tenant access
///
/// All four fields are mandatory. `actor_id` is carried verbatim: its format
/// is enforced by the audit table's column type, so a malformed actor id fails
/// the audit write (and with it the whole privileged transaction) rather than
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedRequest {
    actor_id: String,
    actor_email: String,
    correlation_id: String,
    reason: String,
}

impl PrivilegedRequest {
    /// Build a request, checking every field against the default [`Limits`]
    ///
    /// # Errors
    /// `MissingField` for a blank field, `FieldTooLong` when over the limit.
    pub fn new(
        actor_id: impl Into<String>,
        actor_email: impl Into<String>,
        correlation_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self> {
        Self::with_limits(
            &Limits::default(),
            actor_id,
            actor_email,
            correlation_id,
            reason,
        )
    }

    /// Build a request against custom limits
    pub fn with_limits(
        limits: &Limits,
        actor_id: impl Into<String>,
        actor_email: impl Into<String>,
        correlation_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self> {
        let request = Self {
            actor_id: actor_id.into(),
            actor_email: actor_email.into(),
            correlation_id: correlation_id.into(),
            reason: reason.into(),
        };
        limits.check_field("actor_id", &request.actor_id, limits.max_actor_id_bytes)?;
        limits.check_field("actor_email", &request.actor_email, limits.max_email_bytes)?;
        limits.check_field(
            "correlation_id",
            &request.correlation_id,
            limits.max_correlation_id_bytes,
        )?;
        limits.check_field("reason", &request.reason, limits.max_reason_bytes)?;
        Ok(request)
    }

    /// Identity of the operator performing the access
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Contact address of the operator
    pub fn actor_email(&self) -> &str {
        &self.actor_email
    }

    /// Request correlation id, used to join the audit row with request logs
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Business justification for the access
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// An audit row about to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub actor_id: String,
    pub actor_email: String,
    pub action: AuditAction,
    pub correlation_id: String,
    pub reason: String,
    /// Free-form payload; always carries at least a `timestamp`
    pub metadata: serde_json::Value,
}

/// A persisted audit row
///
/// Immutable once written; this crate never updates or deletes audit rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor_id: String,
    pub actor_email: String,
    pub action: String,
    pub correlation_id: String,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Materialize a persisted row from what was written plus store-assigned columns
    pub fn from_new(entry: &NewAuditEntry, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            actor_id: entry.actor_id.clone(),
            actor_email: entry.actor_email.clone(),
            action: entry.action.as_str().to_string(),
            correlation_id: entry.correlation_id.clone(),
            reason: entry.reason.clone(),
            metadata: entry.metadata.clone(),
            created_at,
        }
    }
}
