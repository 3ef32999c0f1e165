//! Tenantry - per-request tenant isolation for shared-schema PostgreSQL
//!
//! Every tenant's rows live in the same tables. Isolation is enforced by
//! row-level security policies that read transaction-scoped settings, and
//! every database operation goes through exactly one of three entry points
//! on the [`Coordinator`]:
//!
//! - [`Coordinator::with_tenant_context`]: tenant-scoped work
//! - [`Coordinator::with_system_context`]: tables that sit above tenancy
//! - [`Coordinator::with_privileged_context`]: audited cross-tenant reads
//!
//! # Quick Start
//!
//! ```ignore
//! use tenantry::{Coordinator, TenantId, TenantryConfig};
//!
//! let config = TenantryConfig::from_file("tenantry.toml".as_ref())?;
//! let coordinator = Coordinator::connect(&config).await?;
//!
//! let tenant = TenantId::parse(header_value)?;
//! let count: i64 = coordinator
//!     .with_tenant_context(tenant, |tx| {
//!         Box::pin(async move {
//!             let row: (i64,) = sqlx::query_as("SELECT count(*) FROM records")
//!                 .fetch_one(tx.executor())
//!                 .await?;
//!             Ok(row.0)
//!         })
//!     })
//!     .await?;
//! ```
//!
//! The connection pool and raw transactions are not part of the public API;
//! only the coordinator's entry points hand out database access.

pub use tenantry_core::{
    AuditAction, AuditLogEntry, Error, Limits, PrivilegedRequest, Result, SessionConfigState,
    SessionKeys, SessionVar, TenantId,
};
pub use tenantry_engine::*;
