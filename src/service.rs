//! The one path every guarded operation takes.
//!
//! guard -> lifecycle (mutations) -> store -> audit -> result. Nothing is
//! written before the guard has allowed the operation, and an audit failure
//! never changes the result.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{AuditEntry, AuditRecorder};
use crate::config::QueryConfig;
use crate::error::{GuardError, GuardResult};
use crate::guard::OwnershipGuard;
use crate::lifecycle::LifecycleManager;
use crate::policy::{PolicyRegistry, ResourcePolicy};
use crate::query::{ListParams, Paginated, QueryBuilder};
use crate::resource::{NewResource, Resource, ResourceChanges};
use crate::store::{ResourceStore, Visibility};
use crate::types::Operation;

#[derive(Clone)]
pub struct ResourceService {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn ResourceStore>,
    guard: OwnershipGuard,
    lifecycle: LifecycleManager,
    audit: AuditRecorder,
    queries: Arc<QueryBuilder>,
}

impl ResourceService {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        store: Arc<dyn ResourceStore>,
        audit: AuditRecorder,
        query_config: QueryConfig,
    ) -> Self {
        Self {
            guard: OwnershipGuard::new(registry.clone(), store.clone()),
            lifecycle: LifecycleManager::new(registry.clone(), store.clone()),
            queries: Arc::new(QueryBuilder::new(query_config)),
            registry,
            store,
            audit,
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn policy(&self, resource_type: &str) -> GuardResult<&ResourcePolicy> {
        self.registry.get(resource_type)
    }

    pub fn guard(&self) -> &OwnershipGuard {
        &self.guard
    }

    pub async fn get(&self, actor: &Actor, resource_type: &str, id: Uuid) -> GuardResult<Resource> {
        let policy = self.registry.get(resource_type)?;
        let resource = self
            .guard
            .load_authorized(actor, policy, id, Operation::Read, Visibility::LiveOnly)
            .await?;

        if policy.audit_reads {
            self.audit
                .record_detached(AuditEntry::new(actor, Operation::Read, resource_type, Some(id)));
        }
        Ok(resource)
    }

    pub async fn list(
        &self,
        actor: &Actor,
        resource_type: &str,
        mut params: ListParams,
    ) -> GuardResult<Paginated<Resource>> {
        let policy = self.registry.get(resource_type)?;

        if params.include_deleted && !actor.is_admin() {
            tracing::debug!("Ignoring include_deleted for non-admin {}", actor.id);
            params.include_deleted = false;
        }

        let scope = self.guard.list_scope(actor, policy, &params).await?;
        let query = self.queries.build(policy, params, scope)?;
        let (rows, total) = self.store.list(policy, &query).await?;

        if policy.audit_reads {
            let entry = AuditEntry::new(actor, Operation::Read, resource_type, None).with_detail(json!({
                "page": query.page,
                "limit": query.limit,
                "records": total,
            }));
            self.audit.record_detached(entry);
        }
        Ok(Paginated::new(&query, total, rows))
    }

    /// Owner defaults to the actor; only admins may create on behalf of
    /// someone else. Every named parent must exist and be live.
    pub async fn create(&self, actor: &Actor, resource_type: &str, input: NewResource) -> GuardResult<Resource> {
        let policy = self.registry.get(resource_type)?;

        let owner = match &policy.owner_field {
            Some(_) => {
                let owner = input.owner_ref.unwrap_or(actor.id);
                if owner != actor.id && !actor.is_admin() {
                    tracing::warn!(
                        "{} {} tried to create {} owned by {}",
                        actor.role, actor.id, resource_type, owner
                    );
                    return Err(GuardError::forbidden(format!(
                        "Cannot create {} for another owner",
                        resource_type
                    )));
                }
                Some(owner)
            }
            None => None,
        };

        for (parent_type, parent_id) in &input.parent_refs {
            let parent_policy = self.registry.get(parent_type)?;
            if self.store.fetch(parent_policy, *parent_id, Visibility::LiveOnly).await?.is_none() {
                return Err(GuardError::not_found(format!("{} not found", parent_type)));
            }
        }

        let candidate = input.into_resource(policy, owner)?;
        self.guard
            .authorize(actor, policy, &candidate, Operation::Create)
            .await?
            .enforce(policy)?;

        let created = self.lifecycle.create(policy, candidate).await?;
        self.audit
            .record(AuditEntry::new(actor, Operation::Create, resource_type, Some(created.id)))
            .await;
        Ok(created)
    }

    pub async fn update(&self, actor: &Actor, resource_type: &str, id: Uuid, payload: Value) -> GuardResult<Resource> {
        let policy = self.registry.get(resource_type)?;
        let resource = self
            .guard
            .load_authorized(actor, policy, id, Operation::Update, Visibility::IncludeDeleted)
            .await?;
        let changes = ResourceChanges::from_json(policy, payload)?;

        let updated = self.lifecycle.update(policy, &resource, &changes).await?;
        let fields: Vec<String> = changes.to_row(policy).keys().cloned().collect();
        let entry = AuditEntry::new(actor, Operation::Update, resource_type, Some(id))
            .with_detail(json!({ "fields": fields }));
        self.audit.record(entry).await;
        Ok(updated)
    }

    pub async fn delete(&self, actor: &Actor, resource_type: &str, id: Uuid) -> GuardResult<Resource> {
        let policy = self.registry.get(resource_type)?;
        let resource = self
            .guard
            .load_authorized(actor, policy, id, Operation::Delete, Visibility::IncludeDeleted)
            .await?;

        let deleted = self.lifecycle.delete(policy, &resource).await?;
        let entry = AuditEntry::new(actor, Operation::Delete, resource_type, Some(id))
            .with_detail(json!({ "soft": policy.has_retention() }));
        self.audit.record(entry).await;
        Ok(deleted)
    }

    pub async fn restore(&self, actor: &Actor, resource_type: &str, id: Uuid) -> GuardResult<Resource> {
        let policy = self.registry.get(resource_type)?;
        let resource = self
            .guard
            .load_authorized(actor, policy, id, Operation::Update, Visibility::IncludeDeleted)
            .await?;

        let restored = self.lifecycle.restore(policy, &resource).await?;
        let entry = AuditEntry::new(actor, Operation::Update, resource_type, Some(id))
            .with_detail(json!({ "restored": true }));
        self.audit.record(entry).await;
        Ok(restored)
    }
}
