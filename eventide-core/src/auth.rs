//! Principals and the authorization check consulted before enactment.
//!
//! Policy declaration is left to the application. The engine only asks an
//! [`Authorizer`] whether a principal may issue a command against a
//! resource.

use std::fmt;

/// The identity a command is issued on behalf of.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal {
    name: Option<String>,
    roles: Vec<String>,
}

impl Principal {
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            name: None,
            roles: Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub const fn is_anonymous(&self) -> bool {
        self.name.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<anonymous>"))
    }
}

/// The target a command is authorized against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resource<'a> {
    pub kind: &'a str,
    pub id: &'a str,
}

/// Decides whether `principal` may issue `command` against `resource`.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, principal: &Principal, command: &str, resource: &Resource<'_>) -> bool;
}

/// Permits everything. The default when no authorizer is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _: &Principal, _: &str, _: &Resource<'_>) -> bool {
        true
    }
}

impl<F> Authorizer for F
where
    F: Fn(&Principal, &str, &Resource<'_>) -> bool + Send + Sync,
{
    fn is_authorized(&self, principal: &Principal, command: &str, resource: &Resource<'_>) -> bool {
        self(principal, command, resource)
    }
}
