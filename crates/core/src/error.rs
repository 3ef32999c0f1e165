//! Error types for tenantry
//!
//! All failures surfaced by the coordinator and its drivers are represented
//! by the [`Error`] enum. We use `thiserror` for `Display` and `Error`.
//!
//! # Categories
//!
//! | Category | Variants | Description |
//! |----------|----------|-------------|
//! | Boundary | `InvalidTenantId`, `MissingTenantContext`, `MissingField`, `FieldTooLong` | Rejected before a transaction opens |
//! | Audit | `AuditWriteFailed` | Privileged path could not record its audit row |
//! | Pool | `PoolExhausted`, `PoolClosed`, `Connection` | No connection could be used |
//! | Statement | `PolicyViolation`, `StatementTimeout`, `TransactionAborted`, `Database` | The store rejected a statement |
//! | System | `InvalidConfig`, `Internal` | Configuration and invariant failures |

use thiserror::Error;

/// Result type alias for tenantry operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes the coordinator and drivers care about.
pub mod sqlstate {
    /// `invalid_text_representation`, e.g. a malformed uuid literal
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    /// `not_null_violation`
    pub const NOT_NULL_VIOLATION: &str = "23502";
    /// `foreign_key_violation`
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    /// `unique_violation`
    pub const UNIQUE_VIOLATION: &str = "23505";
    /// `in_failed_sql_transaction`
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    /// `insufficient_privilege`, raised for row-level security violations
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    /// `query_canceled`, raised when `statement_timeout` fires
    pub const QUERY_CANCELED: &str = "57014";
}

/// Errors produced by tenantry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // ==================== Boundary ====================
    /// The tenant identifier is not a well-formed, non-nil UUID
    #[error("invalid tenant id '{value}': {reason}")]
    InvalidTenantId { value: String, reason: String },

    /// No tenant identifier was supplied for a tenant-scoped request
    #[error("missing tenant context")]
    MissingTenantContext,

    /// A mandatory field was empty
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    /// A field exceeded its configured limit
    #[error("field {field} too long: {len} bytes exceeds limit of {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    // ==================== Audit ====================
    /// The audit row for a privileged request could not be written
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },

    // ==================== Pool ====================
    /// Timed out waiting for a pooled connection
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed
    #[error("connection pool closed")]
    PoolClosed,

    /// Network or protocol failure talking to the store
    #[error("connection error: {reason}")]
    Connection { reason: String },

    // ==================== Statement ====================
    /// A row-level security policy rejected the statement
    #[error("row-level security policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// The pool-wide statement timeout fired
    #[error("statement timed out")]
    StatementTimeout,

    /// A statement was issued after an earlier failure in the same transaction
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    TransactionAborted,

    /// Any other error reported by the store
    #[error("database error{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Database {
        code: Option<String>,
        message: String,
    },

    // ==================== System ====================
    /// The configuration is invalid
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Internal invariant failure
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    /// Create a database error carrying a SQLSTATE code
    pub fn database(code: &str, message: impl Into<String>) -> Self {
        Error::Database {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// The SQLSTATE associated with this error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Database { code, .. } => code.as_deref(),
            Error::PolicyViolation { .. } => Some(sqlstate::INSUFFICIENT_PRIVILEGE),
            Error::TransactionAborted => Some(sqlstate::IN_FAILED_SQL_TRANSACTION),
            Error::StatementTimeout => Some(sqlstate::QUERY_CANCELED),
            _ => None,
        }
    }

    /// Whether a row-level security policy rejected the statement
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Error::PolicyViolation { .. })
    }

    /// Whether the error came from the connection pool rather than a statement
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted | Error::PoolClosed | Error::Connection { .. }
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Error::PoolExhausted,
            sqlx::Error::PoolClosed => Error::PoolClosed,
            sqlx::Error::Io(io) => Error::Connection {
                reason: io.to_string(),
            },
            sqlx::Error::Tls(tls) => Error::Connection {
                reason: tls.to_string(),
            },
            sqlx::Error::Protocol(reason) => Error::Connection { reason },
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(sqlstate::INSUFFICIENT_PRIVILEGE) => {
                        Error::PolicyViolation { reason: message }
                    }
                    Some(sqlstate::IN_FAILED_SQL_TRANSACTION) => Error::TransactionAborted,
                    Some(sqlstate::QUERY_CANCELED) => Error::StatementTimeout,
                    code => Error::Database {
                        code: code.map(|c| c.to_string()),
                        message,
                    },
                }
            }
            other => Error::Database {
                code: None,
                message: other.to_string(),
            },
        }
    }
}
