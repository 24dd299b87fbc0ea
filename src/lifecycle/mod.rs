//! Resource lifecycle rules: soft vs hard delete, locked states, scoped
//! uniqueness and referential blocking.
//!
//! Every check here runs before the store call, and the store call repeats the
//! state predicates in its own `WHERE` clause. When the pre-check passed but
//! the conditional write matched nothing, the state moved underneath us; the
//! row is re-read to report why.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{GuardError, GuardResult};
use crate::guard::{AuthorizationDecision, DenialKind};
use crate::policy::{PolicyRegistry, ResourcePolicy};
use crate::resource::{Resource, ResourceChanges};
use crate::store::{ResourceStore, Visibility};
use crate::types::Operation;

#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn ResourceStore>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<PolicyRegistry>, store: Arc<dyn ResourceStore>) -> Self {
        Self { registry, store }
    }

    pub fn check_mutable(&self, policy: &ResourcePolicy, resource: &Resource, operation: Operation) -> AuthorizationDecision {
        if !operation.is_mutation() {
            return AuthorizationDecision::allow("read");
        }
        if resource.is_deleted() {
            return AuthorizationDecision::deny(
                DenialKind::InvalidState,
                format!("{} is already deleted", policy.resource_type),
            );
        }
        if let Some(locked) = policy.locked_state(&resource.status) {
            return AuthorizationDecision::deny(DenialKind::InvalidState, locked.message.clone());
        }
        AuthorizationDecision::allow("mutable")
    }

    pub fn ensure_mutable(&self, policy: &ResourcePolicy, resource: &Resource, operation: Operation) -> GuardResult<()> {
        let decision = self.check_mutable(policy, resource, operation);
        if !decision.allow {
            tracing::warn!(
                "Blocked {} on {} {}: {}",
                operation,
                policy.resource_type,
                resource.id,
                decision.reason.as_deref().unwrap_or("")
            );
        }
        decision.enforce(policy)
    }

    /// Every unique key of the policy must be free among live rows
    pub async fn ensure_unique(&self, policy: &ResourcePolicy, resource: &Resource) -> GuardResult<()> {
        for key in &policy.unique_keys {
            let mut fields: Vec<(String, Value)> = Vec::with_capacity(key.len());
            for field in key {
                match resource.field_value(policy, field) {
                    Some(value) if !value.is_null() => fields.push((field.clone(), value)),
                    _ => break,
                }
            }
            // A tuple with an unset column never collides
            if fields.len() != key.len() {
                continue;
            }
            if let Some(existing) = self.store.find_by_fields(policy, &fields).await? {
                if existing.id != resource.id {
                    return Err(duplicate(policy, key));
                }
            }
        }
        Ok(())
    }

    /// Deny deletion while live rows of another type still point here
    pub async fn ensure_unreferenced(&self, policy: &ResourcePolicy, resource: &Resource) -> GuardResult<()> {
        for reference in &policy.referenced_by {
            let referencing = self.registry.get(&reference.resource_type)?;
            let count = self
                .store
                .count_references(referencing, &reference.field, resource.id)
                .await?;
            if count > 0 {
                tracing::warn!(
                    "Refusing to delete {} {}: {} live {} rows reference it",
                    policy.resource_type,
                    resource.id,
                    count,
                    reference.resource_type
                );
                return Err(GuardError::conflict(format!(
                    "{} is still referenced by {} {}",
                    policy.resource_type, count, reference.resource_type
                )));
            }
        }
        Ok(())
    }

    pub async fn create(&self, policy: &ResourcePolicy, resource: Resource) -> GuardResult<Resource> {
        self.ensure_unique(policy, &resource).await?;
        match self.store.insert(policy, resource).await? {
            Some(created) => Ok(created),
            None => Err(GuardError::conflict(format!(
                "{} with the same unique fields already exists",
                policy.resource_type
            ))),
        }
    }

    pub async fn update(
        &self,
        policy: &ResourcePolicy,
        resource: &Resource,
        changes: &ResourceChanges,
    ) -> GuardResult<Resource> {
        self.ensure_mutable(policy, resource, Operation::Update)?;

        let touches_key = policy
            .unique_keys
            .iter()
            .flatten()
            .any(|f| changes.attributes.contains_key(f));
        if touches_key {
            let mut merged = resource.clone();
            changes.apply_to(&mut merged);
            self.ensure_unique(policy, &merged).await?;
        }

        match self.store.update(policy, resource.id, changes).await? {
            Some(updated) => Ok(updated),
            None => Err(self.lost_race(policy, resource, Operation::Update).await),
        }
    }

    /// Soft-delete where the type keeps a retention column, hard-delete otherwise
    pub async fn delete(&self, policy: &ResourcePolicy, resource: &Resource) -> GuardResult<Resource> {
        self.ensure_mutable(policy, resource, Operation::Delete)?;
        self.ensure_unreferenced(policy, resource).await?;

        if policy.has_retention() {
            match self.store.soft_delete(policy, resource.id).await? {
                Some(deleted) => Ok(deleted),
                None => Err(self.lost_race(policy, resource, Operation::Delete).await),
            }
        } else if self.store.hard_delete(policy, resource.id).await? {
            Ok(resource.clone())
        } else {
            Err(self.lost_race(policy, resource, Operation::Delete).await)
        }
    }

    pub async fn restore(&self, policy: &ResourcePolicy, resource: &Resource) -> GuardResult<Resource> {
        if !policy.has_retention() {
            return Err(GuardError::validation(format!(
                "{} cannot be restored",
                policy.resource_type
            )));
        }
        if !resource.is_deleted() {
            return Err(GuardError::conflict(format!("{} is not deleted", policy.resource_type)));
        }
        match self.store.restore(policy, resource.id).await? {
            Some(restored) => Ok(restored),
            None => Err(GuardError::conflict(format!("{} is not deleted", policy.resource_type))),
        }
    }

    async fn lost_race(&self, policy: &ResourcePolicy, resource: &Resource, operation: Operation) -> GuardError {
        let current = match self.store.fetch(policy, resource.id, Visibility::IncludeDeleted).await {
            Ok(current) => current,
            Err(e) => return e.into(),
        };
        match current {
            None => GuardError::not_found(format!("{} not found", policy.resource_type)),
            Some(current) => match self.check_mutable(policy, &current, operation).enforce(policy) {
                Err(e) => e,
                Ok(()) => GuardError::conflict(format!(
                    "{} was modified concurrently",
                    policy.resource_type
                )),
            },
        }
    }
}

fn duplicate(policy: &ResourcePolicy, key: &[String]) -> GuardError {
    GuardError::conflict(format!(
        "{} with the same ({}) already exists",
        policy.resource_type,
        key.join(", ")
    ))
}
