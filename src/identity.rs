//! Caller identity struct and authorization scopes (spec §6).
//!
//! Credential *validation* (JWKS, signature checks, etc.) lives outside
//! this crate; the engine only enforces that the already-validated
//! identity authorizes the operation being attempted.

use std::collections::HashSet;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Enqueue,
    Claim,
    Heartbeat,
    Result,
    Nack,
    Subscribe,
    Admin,
}

#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub subject: String,
    pub tenant_id: String,
    pub allowed_event_types: HashSet<String>,
    pub scopes: HashSet<Scope>,
    pub worker_group: Option<String>,
}

impl CallerIdentity {
    pub fn unscoped(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            tenant_id: String::new(),
            allowed_event_types: HashSet::new(),
            scopes: HashSet::new(),
            worker_group: None,
        }
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = Scope>) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    pub fn with_allowed_event_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        self.allowed_event_types = types.into_iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// `allowed_event_types` empty means "no restriction" only for
    /// identities that were never given an allow-list at all (e.g. an
    /// admin/producer identity); worker-side calls always carry a
    /// concrete, non-empty allow-list upstream of this crate.
    pub fn allows_command(&self, command: &str) -> bool {
        self.allowed_event_types.is_empty()
            || self
                .allowed_event_types
                .contains(&command.to_ascii_lowercase())
    }

    pub fn require_scope(&self, scope: Scope) -> Result<(), Error> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(Error::Validation {
                field: "scopes",
                reason: format!("caller `{}` lacks required scope {:?}", self.subject, scope),
            })
        }
    }

    pub fn require_command_allowed(&self, command: &str) -> Result<(), Error> {
        if self.allows_command(command) {
            Ok(())
        } else {
            Err(Error::Validation {
                field: "command",
                reason: format!(
                    "caller `{}` is not authorized for command `{}`",
                    self.subject, command
                ),
            })
        }
    }
}
