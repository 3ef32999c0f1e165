//! Core types for tenantry
//!
//! This crate defines the foundational types used throughout the system:
//! - TenantId: validated tenant identifier
//! - PrivilegedRequest / AuditLogEntry: audited cross-tenant access
//! - SessionVar / SessionKeys / SessionConfigState: the transaction-scoped
//!   settings the row policies read
//! - Limits: bounds on audited request fields
//! - Error: error type hierarchy

#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod session;
pub mod types;

pub use error::{sqlstate, Error, Result};
pub use limits::Limits;
pub use session::{SessionConfigState, SessionKeys, SessionVar, ValueKind, BYPASS_ON};
pub use types::{AuditAction, AuditLogEntry, NewAuditEntry, PrivilegedRequest, TenantId};
