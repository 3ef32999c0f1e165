//! Transaction-scoped session settings read by the row policies
//!
//! The store's row-level security policies compare each row's tenant column
//! against one setting and short-circuit on another:
//!
//! ```text
//! tenant_id = NULLIF(current_setting('app.current_tenant_id', true), '')::uuid
//!     OR current_setting('app.bypass_rls', true) = 'on'
//! ```
//!
//! [`SessionConfigState`] describes which of those settings a transaction
//! carries. At most one is ever assigned: the tenant and privileged modes are
//! separate variants, never combined.

use crate::error::{Error, Result};
use crate::types::TenantId;
use serde::{Deserialize, Serialize};

/// Value assigned to the bypass setting in privileged mode
pub const BYPASS_ON: &str = "on";

/// Default name of the tenant setting
pub const DEFAULT_TENANT_KEY: &str = "app.current_tenant_id";

/// Default name of the privileged-bypass setting
pub const DEFAULT_BYPASS_KEY: &str = "app.bypass_rls";

/// The two settings the coordinator manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionVar {
    /// Tenant whose rows are visible
    TenantId,
    /// Flag that disables tenant filtering for audited reads
    PrivilegedBypass,
}

impl SessionVar {
    /// Every managed setting, in the order they are cleared
    pub const ALL: [SessionVar; 2] = [SessionVar::TenantId, SessionVar::PrivilegedBypass];

    /// How the store should interpret the assigned value
    pub fn kind(&self) -> ValueKind {
        match self {
            SessionVar::TenantId => ValueKind::Uuid,
            SessionVar::PrivilegedBypass => ValueKind::Text,
        }
    }
}

/// Type the store casts an assigned value to before storing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Cast through `uuid`; malformed input fails the assignment
    Uuid,
    /// Stored as-is
    Text,
}

/// Names of the managed settings
///
/// Custom settings must be dotted (`prefix.name`) to be accepted by
/// PostgreSQL's `set_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    /// Name of the tenant setting
    #[serde(default = "default_tenant_key")]
    pub tenant_key: String,
    /// Name of the bypass setting
    #[serde(default = "default_bypass_key")]
    pub bypass_key: String,
}

fn default_tenant_key() -> String {
    DEFAULT_TENANT_KEY.to_string()
}

fn default_bypass_key() -> String {
    DEFAULT_BYPASS_KEY.to_string()
}

impl Default for SessionKeys {
    fn default() -> Self {
        Self {
            tenant_key: default_tenant_key(),
            bypass_key: default_bypass_key(),
        }
    }
}

impl SessionKeys {
    /// The configured name for a setting
    pub fn name(&self, var: SessionVar) -> &str {
        match var {
            SessionVar::TenantId => &self.tenant_key,
            SessionVar::PrivilegedBypass => &self.bypass_key,
        }
    }

    /// Check that both names are valid, dotted and distinct
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first offending name.
    pub fn validate(&self) -> Result<()> {
        validate_key(&self.tenant_key)?;
        validate_key(&self.bypass_key)?;
        if self.tenant_key == self.bypass_key {
            return Err(Error::invalid_config(format!(
                "tenant and bypass settings share the name '{}'",
                self.tenant_key
            )));
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    let mut parts = key.split('.');
    let (prefix, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(name), None) => (prefix, name),
        _ => {
            return Err(Error::invalid_config(format!(
                "setting '{}' must have the form prefix.name",
                key
            )))
        }
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    if !valid_part(prefix) || !valid_part(name) {
        return Err(Error::invalid_config(format!(
            "setting '{}' may only contain [a-z0-9_]",
            key
        )));
    }
    Ok(())
}

/// Settings carried by one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConfigState {
    /// Rows are filtered to one tenant
    Tenant(TenantId),
    /// Tenant filtering is bypassed; always paired with an audit row
    Privileged,
    /// Neither setting is assigned
    System,
}

impl SessionConfigState {
    /// The assignments to apply at transaction start
    ///
    /// Yields at most one assignment; `System` yields none.
    pub fn assignments(&self) -> Option<(SessionVar, String)> {
        match self {
            SessionConfigState::Tenant(tenant) => Some((SessionVar::TenantId, tenant.to_string())),
            SessionConfigState::Privileged => {
                Some((SessionVar::PrivilegedBypass, BYPASS_ON.to_string()))
            }
            SessionConfigState::System => None,
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            SessionConfigState::Tenant(_) => "tenant",
            SessionConfigState::Privileged => "privileged",
            SessionConfigState::System => "system",
        }
    }
}
