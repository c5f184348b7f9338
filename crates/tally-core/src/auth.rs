//! Tenant membership checks.
//!
//! Identity itself is established elsewhere; the ledger only asks whether an
//! already-authenticated caller belongs to a tenant.

use std::collections::{HashMap, HashSet};

use crate::error::{LedgerError, Result};

/// Yes/no membership decision.
pub trait Authorizer {
    fn is_member(&self, caller_id: &str, tenant_id: &str) -> bool;
}

/// Grants everything. Used by the CLI, where the operator owns the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_member(&self, _caller_id: &str, _tenant_id: &str) -> bool {
        true
    }
}

/// Fixed membership table.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    tenants: HashMap<String, HashSet<String>>,
}

impl StaticMembership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_member(mut self, tenant_id: &str, caller_id: &str) -> Self {
        self.grant(tenant_id, caller_id);
        self
    }

    pub fn grant(&mut self, tenant_id: &str, caller_id: &str) {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .insert(caller_id.to_string());
    }

    pub fn revoke(&mut self, tenant_id: &str, caller_id: &str) {
        if let Some(members) = self.tenants.get_mut(tenant_id) {
            members.remove(caller_id);
        }
    }
}

impl Authorizer for StaticMembership {
    fn is_member(&self, caller_id: &str, tenant_id: &str) -> bool {
        self.tenants
            .get(tenant_id)
            .is_some_and(|members| members.contains(caller_id))
    }
}

/// Fail with [`LedgerError::Unauthorized`] unless `caller_id` is a member.
///
/// # Errors
///
/// Returns [`LedgerError::Unauthorized`] on a negative decision.
pub fn require_member(authorizer: &dyn Authorizer, caller_id: &str, tenant_id: &str) -> Result<()> {
    if authorizer.is_member(caller_id, tenant_id) {
        return Ok(());
    }
    tracing::warn!(caller_id, tenant_id, "membership check denied");
    Err(LedgerError::Unauthorized {
        caller_id: caller_id.to_string(),
        tenant_id: tenant_id.to_string(),
    })
}
