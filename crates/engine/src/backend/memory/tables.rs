//! Committed rows and the row policy on `records`
//!
//! Mirrors `migrations/0001_tenancy.sql`: `tenants` and `audit_log` are
//! unfiltered, `records` is filtered by
//!
//! ```text
//! USING / WITH CHECK:
//!   tenant_id = NULLIF(current_setting(tenant_key, true), '')::uuid
//!   OR current_setting(bypass_key, true) = 'on'
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenantry_core::{sqlstate, AuditLogEntry, Error, Result, TenantId, BYPASS_ON};
use uuid::Uuid;

/// A row of the tenant registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Primary key
    pub id: TenantId,
    /// Unique display name
    pub name: String,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

/// A row of the tenant-scoped `records` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key
    pub id: Uuid,
    /// Owning tenant; the column the row policy compares
    pub tenant_id: TenantId,
    /// Payload
    pub body: serde_json::Value,
    /// Insert time
    pub created_at: DateTime<Utc>,
}

/// A write buffered by an open transaction
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Tenant(TenantRecord),
    Record(Record),
    Audit(AuditLogEntry),
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) tenants: Vec<TenantRecord>,
    pub(crate) records: Vec<Record>,
    pub(crate) audit_log: Vec<AuditLogEntry>,
}

impl Tables {
    pub(crate) fn apply(&mut self, writes: Vec<PendingWrite>) {
        for write in writes {
            match write {
                PendingWrite::Tenant(t) => self.tenants.push(t),
                PendingWrite::Record(r) => self.records.push(r),
                PendingWrite::Audit(a) => self.audit_log.push(a),
            }
        }
    }
}

/// The policy inputs read from one transaction's settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowPolicy {
    tenant: Option<TenantId>,
    bypass: bool,
}

impl RowPolicy {
    /// Evaluate the settings the way the policy expression does
    ///
    /// An unset or empty tenant setting is NULL, which matches no row. A
    /// non-empty value that is not a uuid fails the cast and the statement.
    pub(crate) fn from_settings(tenant: Option<&str>, bypass: Option<&str>) -> Result<Self> {
        let tenant = match tenant {
            None | Some("") => None,
            Some(raw) => Some(parse_uuid(raw)?.into()),
        };
        Ok(Self {
            tenant,
            bypass: bypass == Some(BYPASS_ON),
        })
    }

    pub(crate) fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub(crate) fn allows(&self, row_tenant: TenantId) -> bool {
        self.bypass || self.tenant == Some(row_tenant)
    }

    /// `WITH CHECK` for a new row
    pub(crate) fn check_insert(&self, row_tenant: TenantId) -> Result<()> {
        if self.allows(row_tenant) {
            Ok(())
        } else {
            Err(Error::PolicyViolation {
                reason: "new row violates row-level security policy for table \"records\""
                    .to_string(),
            })
        }
    }
}

/// Cast text to `uuid` with the store's error for malformed input
pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| {
        Error::database(
            sqlstate::INVALID_TEXT_REPRESENTATION,
            format!("invalid input syntax for type uuid: \"{}\"", raw),
        )
    })
}

pub(crate) fn not_null_violation(column: &str, table: &str) -> Error {
    Error::database(
        sqlstate::NOT_NULL_VIOLATION,
        format!(
            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
            column, table
        ),
    )
}

pub(crate) fn foreign_key_violation(tenant: TenantId) -> Error {
    Error::database(
        sqlstate::FOREIGN_KEY_VIOLATION,
        format!(
            "insert or update on table \"records\" violates foreign key constraint \
             \"records_tenant_id_fkey\": Key (tenant_id)=({}) is not present in table \"tenants\"",
            tenant
        ),
    )
}

pub(crate) fn unique_violation(name: &str) -> Error {
    Error::database(
        sqlstate::UNIQUE_VIOLATION,
        format!(
            "duplicate key value violates unique constraint \"tenants_name_key\": Key (name)=({}) already exists",
            name
        ),
    )
}
