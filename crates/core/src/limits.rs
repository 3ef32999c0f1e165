//! Size limits for privileged request fields
//!
//! Violations result in `FieldTooLong` errors; blank values in `MissingField`.
//! Limits are checked before any transaction is opened.

use crate::error::{Error, Result};

/// Size limits for the audited fields of a privileged request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum actor id length in bytes (default: 128)
    pub max_actor_id_bytes: usize,

    /// Maximum actor email length in bytes (default: 320, the RFC 5321 bound)
    pub max_email_bytes: usize,

    /// Maximum correlation id length in bytes (default: 128)
    pub max_correlation_id_bytes: usize,

    /// Maximum justification length in bytes (default: 1024)
    pub max_reason_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_actor_id_bytes: 128,
            max_email_bytes: 320,
            max_correlation_id_bytes: 128,
            max_reason_bytes: 1024,
        }
    }
}

impl Limits {
    /// Check that a field is present and within `max` bytes
    pub fn check_field(&self, field: &'static str, value: &str, max: usize) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Error::MissingField { field });
        }
        if value.len() > max {
            return Err(Error::FieldTooLong {
                field,
                len: value.len(),
                max,
            });
        }
        Ok(())
    }
}
