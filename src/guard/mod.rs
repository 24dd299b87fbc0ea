//! Ownership guard.
//!
//! One guard serves every resource type. What it checks for a given type comes
//! from that type's [`ResourcePolicy`]: the roles allowed in, whether admins
//! bypass, the owner column, the participation join and the parent chain.
//!
//! Precedence, first match wins:
//!
//! 0. role gate (denies)
//! 1. admin override
//! 2. direct ownership
//! 3. participation
//! 4. chain ownership, hop by hop
//!
//! A lookup miss anywhere on the chain is a `Missing` denial and always
//! surfaces as `NotFound`.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::actor::Actor;
use crate::error::{GuardError, GuardResult};
use crate::policy::{DenialMode, ListScope, PolicyRegistry, ResourcePolicy};
use crate::query::{ListParams, ScopeFilter};
use crate::resource::Resource;
use crate::store::{ResourceStore, Visibility};
use crate::types::Operation;

/// Why access was refused; picks the caller-visible error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    /// Target or an ancestor does not exist (or is deleted)
    Missing,
    /// Exists, but the actor has no relation to it
    NotEntitled,
    /// The actor's role may not touch this resource type at all
    RoleNotPermitted,
    /// Lifecycle state forbids the operation
    InvalidState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationDecision {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialKind>,
}

impl AuthorizationDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: Some(reason.into()),
            denial: None,
        }
    }

    pub fn deny(kind: DenialKind, reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            denial: Some(kind),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    /// Turn a denial into the caller-visible error for this resource type
    pub fn enforce(&self, policy: &ResourcePolicy) -> GuardResult<()> {
        if self.is_allowed() {
            return Ok(());
        }
        let reason = self.reason.as_deref().unwrap_or("denied");
        let not_found = || GuardError::not_found(format!("{} not found", policy.resource_type));
        match self.denial.unwrap_or(DenialKind::NotEntitled) {
            DenialKind::Missing => Err(not_found()),
            DenialKind::RoleNotPermitted => Err(GuardError::forbidden(reason)),
            DenialKind::InvalidState => Err(GuardError::conflict(reason)),
            DenialKind::NotEntitled => match policy.denial {
                DenialMode::MaskAsNotFound => Err(not_found()),
                DenialMode::RevealForbidden => Err(GuardError::forbidden(format!(
                    "Access denied to {}",
                    policy.resource_type
                ))),
            },
        }
    }
}

#[derive(Clone)]
pub struct OwnershipGuard {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn ResourceStore>,
}

impl OwnershipGuard {
    pub fn new(registry: Arc<PolicyRegistry>, store: Arc<dyn ResourceStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub async fn authorize(
        &self,
        actor: &Actor,
        policy: &ResourcePolicy,
        resource: &Resource,
        operation: Operation,
    ) -> GuardResult<AuthorizationDecision> {
        let decision = self.decide(actor, policy, resource, operation).await?;
        if decision.allow {
            tracing::debug!(
                "Allowed {} on {} {} for {} {}: {}",
                operation,
                policy.resource_type,
                resource.id,
                actor.role,
                actor.id,
                decision.reason.as_deref().unwrap_or("")
            );
        } else {
            tracing::warn!(
                "Denied {} on {} {} for {} {}: {}",
                operation,
                policy.resource_type,
                resource.id,
                actor.role,
                actor.id,
                decision.reason.as_deref().unwrap_or("")
            );
        }
        Ok(decision)
    }

    async fn decide(
        &self,
        actor: &Actor,
        policy: &ResourcePolicy,
        resource: &Resource,
        operation: Operation,
    ) -> GuardResult<AuthorizationDecision> {
        if !policy.allows_role(actor.role) {
            return Ok(AuthorizationDecision::deny(
                DenialKind::RoleNotPermitted,
                format!("Role {} may not access {}", actor.role, policy.resource_type),
            ));
        }

        if actor.is_admin() && policy.admin_bypass {
            return Ok(AuthorizationDecision::allow("admin override"));
        }

        // Lookup tables read by id the same way they list
        if operation == Operation::Read && policy.list_scope == ListScope::Unscoped {
            return Ok(AuthorizationDecision::allow("unscoped read"));
        }

        if resource.owner_ref == Some(actor.id) {
            return Ok(AuthorizationDecision::allow("owner"));
        }

        if self.participates(actor, policy, resource).await? {
            return Ok(AuthorizationDecision::allow("participant"));
        }

        let mut current = resource.clone();
        for hop in &policy.chain {
            let Some(parent_id) = current.parent(hop) else {
                return Ok(AuthorizationDecision::deny(
                    DenialKind::Missing,
                    format!("{} {} has no {} parent", current.resource_type, current.id, hop),
                ));
            };
            let Ok(hop_policy) = self.registry.get(hop) else {
                return Ok(AuthorizationDecision::deny(
                    DenialKind::Missing,
                    format!("no policy for chain hop {}", hop),
                ));
            };
            let Some(ancestor) = self.store.fetch(hop_policy, parent_id, Visibility::LiveOnly).await? else {
                return Ok(AuthorizationDecision::deny(
                    DenialKind::Missing,
                    format!("{} {} not found", hop, parent_id),
                ));
            };

            if ancestor.owner_ref == Some(actor.id) {
                return Ok(AuthorizationDecision::allow(format!("owner of {} {}", hop, ancestor.id)));
            }
            if self.participates(actor, hop_policy, &ancestor).await? {
                return Ok(AuthorizationDecision::allow(format!("participant in {} {}", hop, ancestor.id)));
            }
            current = ancestor;
        }

        Ok(AuthorizationDecision::deny(
            DenialKind::NotEntitled,
            format!("{} {} is not related to {} {}", actor.role, actor.id, policy.resource_type, resource.id),
        ))
    }

    async fn participates(&self, actor: &Actor, policy: &ResourcePolicy, resource: &Resource) -> GuardResult<bool> {
        let Some(participation) = &policy.participation else {
            return Ok(false);
        };
        let local = match &participation.via_parent {
            Some(parent) => resource.parent(parent),
            None => Some(resource.id),
        };
        match local {
            Some(local) => Ok(self.store.is_participant(participation, local, actor.id).await?),
            None => Ok(false),
        }
    }

    /// Load by id, then authorize. A missing row is a `Missing` denial.
    pub async fn authorize_ref(
        &self,
        actor: &Actor,
        policy: &ResourcePolicy,
        id: Uuid,
        operation: Operation,
    ) -> GuardResult<AuthorizationDecision> {
        match self.store.fetch(policy, id, Visibility::LiveOnly).await? {
            Some(resource) => self.authorize(actor, policy, &resource, operation).await,
            None => Ok(AuthorizationDecision::deny(
                DenialKind::Missing,
                format!("{} {} not found", policy.resource_type, id),
            )),
        }
    }

    /// Load, authorize and enforce in one step, returning the loaded resource
    pub async fn load_authorized(
        &self,
        actor: &Actor,
        policy: &ResourcePolicy,
        id: Uuid,
        operation: Operation,
        visibility: Visibility,
    ) -> GuardResult<Resource> {
        let Some(resource) = self.store.fetch(policy, id, visibility).await? else {
            tracing::debug!("{} {} not found for {} {}", policy.resource_type, id, actor.role, actor.id);
            return Err(GuardError::not_found(format!("{} not found", policy.resource_type)));
        };
        self.authorize(actor, policy, &resource, operation)
            .await?
            .enforce(policy)?;
        Ok(resource)
    }

    /// Scope filters a list query must carry for this actor
    pub async fn list_scope(
        &self,
        actor: &Actor,
        policy: &ResourcePolicy,
        params: &ListParams,
    ) -> GuardResult<Vec<ScopeFilter>> {
        if !policy.allows_role(actor.role) {
            tracing::warn!("Role {} may not list {}", actor.role, policy.resource_type);
            return Err(GuardError::forbidden(format!(
                "Role {} may not access {}",
                actor.role, policy.resource_type
            )));
        }

        // Parent scope narrows even admins to the named parent
        if let ListScope::Parent(parent_type) = &policy.list_scope {
            let field = policy
                .parent_field(parent_type)
                .ok_or_else(|| GuardError::internal("Inconsistent list scope"))?;
            let raw = params.filters.get(field).ok_or_else(|| {
                GuardError::validation(format!(
                    "Listing {} requires a '{}' filter",
                    policy.resource_type, field
                ))
            })?;
            let parent_id = Uuid::parse_str(raw)
                .map_err(|_| GuardError::validation(format!("'{}' must be a UUID", field)))?;
            let parent_policy = self.registry.get(parent_type)?;
            self.load_authorized(actor, parent_policy, parent_id, Operation::Read, Visibility::LiveOnly)
                .await?;
            return Ok(vec![ScopeFilter::FieldEquals {
                field: field.to_string(),
                value: parent_id,
            }]);
        }

        if actor.is_admin() && policy.admin_bypass {
            return Ok(Vec::new());
        }

        match &policy.list_scope {
            ListScope::Owner => {
                let field = policy
                    .owner_field
                    .clone()
                    .ok_or_else(|| GuardError::internal("Inconsistent list scope"))?;
                Ok(vec![ScopeFilter::FieldEquals { field, value: actor.id }])
            }
            ListScope::Participant => Ok(vec![ScopeFilter::ParticipatedBy { actor_id: actor.id }]),
            ListScope::Unscoped | ListScope::Parent(_) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Role;
    use crate::policy::Participation;
    use crate::resource::NewResource;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::from_policies([
            ResourcePolicy::new("job_postings").owned_by("recruiter_id"),
            ResourcePolicy::new("applications")
                .owned_by("member_id")
                .with_parent("job_postings", "job_posting_id")
                .with_chain(["job_postings"])
                .with_denial(DenialMode::RevealForbidden),
            ResourcePolicy::new("interviews")
                .with_parent("applications", "application_id")
                .with_participation(Participation {
                    table: "interview_panel".into(),
                    resource_field: "interview_id".into(),
                    actor_field: "doctor_id".into(),
                    via_parent: None,
                })
                .with_chain(["applications", "job_postings"])
                .list_scope(ListScope::Participant),
            ResourcePolicy::new("patient_files").owned_by("patient_id").for_roles([Role::Patient]),
        ])
        .unwrap()
    }

    async fn create(store: &MemoryStore, policy: &ResourcePolicy, owner: Option<Uuid>, parents: &[(&str, Uuid)]) -> Resource {
        let input = NewResource {
            parent_refs: parents.iter().map(|(t, id)| (t.to_string(), *id)).collect::<BTreeMap<_, _>>(),
            ..Default::default()
        };
        let resource = input.into_resource(policy, owner).unwrap();
        store.seed(resource.clone()).await;
        resource
    }

    #[tokio::test]
    async fn walks_chain_to_owning_recruiter() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());

        let recruiter = Actor::new(Uuid::new_v4(), Role::Recruiter);
        let stranger = Actor::new(Uuid::new_v4(), Role::Recruiter);
        let posting = create(&store, registry.get("job_postings").unwrap(), Some(recruiter.id), &[]).await;
        let application = create(
            &store,
            registry.get("applications").unwrap(),
            Some(Uuid::new_v4()),
            &[("job_postings", posting.id)],
        )
        .await;
        let interview = create(
            &store,
            registry.get("interviews").unwrap(),
            None,
            &[("applications", application.id)],
        )
        .await;

        let policy = registry.get("interviews").unwrap();
        let allowed = guard.authorize(&recruiter, policy, &interview, Operation::Read).await.unwrap();
        assert!(allowed.allow);

        let denied = guard.authorize(&stranger, policy, &interview, Operation::Read).await.unwrap();
        assert_eq!(denied.denial, Some(DenialKind::NotEntitled));
        assert!(matches!(denied.enforce(policy), Err(GuardError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_ancestor_is_not_found_even_when_revealing() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());

        let policy = registry.get("applications").unwrap();
        let orphan = create(&store, policy, Some(Uuid::new_v4()), &[("job_postings", Uuid::new_v4())]).await;
        let actor = Actor::new(Uuid::new_v4(), Role::Recruiter);

        let decision = guard.authorize(&actor, policy, &orphan, Operation::Read).await.unwrap();
        assert_eq!(decision.denial, Some(DenialKind::Missing));
        assert!(matches!(decision.enforce(policy), Err(GuardError::NotFound(_))));
    }

    #[tokio::test]
    async fn reveal_mode_surfaces_forbidden() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());

        let posting = create(&store, registry.get("job_postings").unwrap(), Some(Uuid::new_v4()), &[]).await;
        let policy = registry.get("applications").unwrap();
        let application = create(&store, policy, Some(Uuid::new_v4()), &[("job_postings", posting.id)]).await;

        let member = Actor::new(Uuid::new_v4(), Role::Member);
        let decision = guard.authorize(&member, policy, &application, Operation::Update).await.unwrap();
        assert!(matches!(decision.enforce(policy), Err(GuardError::Forbidden(_))));
    }

    #[tokio::test]
    async fn participant_and_admin_are_allowed() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());

        let policy = registry.get("interviews").unwrap();
        let interview = create(&store, policy, None, &[("applications", Uuid::new_v4())]).await;
        let panelist = Actor::new(Uuid::new_v4(), Role::Doctor);
        store.add_participant("interview_panel", interview.id, panelist.id).await;

        let decision = guard.authorize(&panelist, policy, &interview, Operation::Read).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some("participant"));

        let admin = Actor::new(Uuid::new_v4(), Role::SystemAdmin);
        let decision = guard.authorize(&admin, policy, &interview, Operation::Delete).await.unwrap();
        assert_eq!(decision.reason.as_deref(), Some("admin override"));
    }

    #[tokio::test]
    async fn role_gate_comes_before_admin_override() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());

        let policy = registry.get("patient_files").unwrap();
        let file = create(&store, policy, Some(Uuid::new_v4()), &[]).await;
        let admin = Actor::new(Uuid::new_v4(), Role::SystemAdmin);

        let decision = guard.authorize(&admin, policy, &file, Operation::Read).await.unwrap();
        assert_eq!(decision.denial, Some(DenialKind::RoleNotPermitted));
        assert!(matches!(decision.enforce(policy), Err(GuardError::Forbidden(_))));
    }

    #[tokio::test]
    async fn list_scope_per_policy() {
        let registry = Arc::new(registry());
        let store = Arc::new(MemoryStore::new());
        let guard = OwnershipGuard::new(registry.clone(), store.clone());
        let recruiter = Actor::new(Uuid::new_v4(), Role::Recruiter);

        let scope = guard
            .list_scope(&recruiter, registry.get("job_postings").unwrap(), &ListParams::default())
            .await
            .unwrap();
        assert_eq!(scope, vec![ScopeFilter::FieldEquals { field: "recruiter_id".into(), value: recruiter.id }]);

        let scope = guard
            .list_scope(&recruiter, registry.get("interviews").unwrap(), &ListParams::default())
            .await
            .unwrap();
        assert_eq!(scope, vec![ScopeFilter::ParticipatedBy { actor_id: recruiter.id }]);

        let admin = Actor::new(Uuid::new_v4(), Role::SystemAdmin);
        let scope = guard
            .list_scope(&admin, registry.get("job_postings").unwrap(), &ListParams::default())
            .await
            .unwrap();
        assert!(scope.is_empty());
    }
}
