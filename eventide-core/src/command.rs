//! Commands and idempotency tokens.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque idempotency token.
///
/// `Etag::default()` generates a fresh random token, so commands that derive
/// `Default` get one automatically when the caller does not supply it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    /// Generate a new random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Etag {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<&str> for Etag {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Etag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rule a command or target state failed to satisfy.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{rule}")]
pub struct RuleViolation {
    pub rule: String,
}

impl RuleViolation {
    pub fn new(rule: impl Into<String>) -> Self {
        Self { rule: rule.into() }
    }
}

/// Value object requesting a change to a target.
///
/// ```ignore
/// #[derive(Clone, Debug, Default)]
/// struct Deposit {
///     amount: u64,
///     etag: Etag,
/// }
///
/// impl Command for Deposit {
///     fn kind(&self) -> &'static str {
///         "deposit"
///     }
///
///     fn etag(&self) -> &str {
///         self.etag.as_str()
///     }
///
///     fn validate(&self) -> Result<(), RuleViolation> {
///         if self.amount == 0 {
///             return Err(RuleViolation::new("amount must be positive"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Command {
    /// Type discriminator used for handler lookup and authorization.
    fn kind(&self) -> &'static str;

    /// Idempotency token. Reapplying a command with a token the target has
    /// already recorded is a no-op.
    fn etag(&self) -> &str;

    /// Version the command was issued against, if it cares.
    ///
    /// This is checked when the command is applied and is independent of the
    /// store's own concurrency check on save.
    fn applies_to_version(&self) -> Option<u64> {
        None
    }

    /// Self-validation that needs no target state.
    ///
    /// # Errors
    ///
    /// Returns the violated rule.
    fn validate(&self) -> Result<(), RuleViolation> {
        Ok(())
    }
}
