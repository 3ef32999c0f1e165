//! Transaction coordination for tenant isolation
//!
//! This crate owns every path to the database:
//! - Coordinator: the three entry points and the per-transaction protocol
//! - Context setter: transaction-local settings read by row policies
//! - Audit recorder: the audit row paired with each privileged transaction
//! - Drivers: PostgreSQL (sqlx) and an in-memory stand-in, behind a sealed trait
//! - Scoped handles: the only query surface handed to callers
//!
//! Nothing here exposes the pool or an unscoped transaction.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod audit;
pub mod backend;
pub mod config;
mod context;
pub mod coordinator;
pub mod handle;
pub mod metrics;

pub use config::{PoolConfig, TenantryConfig, CONFIG_FILE_NAME};
pub use coordinator::{Coordinator, TxnPhase};
pub use handle::{PrivilegedTransaction, SystemConnection, TenantTransaction};
pub use metrics::MetricsSnapshot;

#[cfg(feature = "memory")]
pub use backend::memory::{Fault, MemoryBackend, MemorySession, Record, TenantRecord};
#[cfg(feature = "postgres")]
pub use backend::postgres::PgBackend;
