// In-process store used by tests and local runs without a database
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AccountStore, AuditSink, ResourceStore, StoreError, Visibility};
use crate::actor::Role;
use crate::audit::AuditEntry;
use crate::policy::{Participation, ResourcePolicy, SortDirection};
use crate::query::{BoundedQuery, ScopeFilter};
use crate::resource::{Resource, ResourceChanges};

#[derive(Debug, Clone, Copy)]
struct AccountRecord {
    active: bool,
    deleted: bool,
}

/// Implements every store trait over in-memory maps
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<(Uuid, Role), AccountRecord>>,
    rows: RwLock<HashMap<String, BTreeMap<Uuid, Resource>>>,
    participants: RwLock<HashSet<(String, Uuid, Uuid)>>,
    audit: RwLock<Vec<AuditEntry>>,
    fail_audit: AtomicBool,
    mutations: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, id: Uuid, role: Role) {
        self.accounts.write().await.insert(
            (id, role),
            AccountRecord {
                active: true,
                deleted: false,
            },
        );
    }

    /// Clear the `is_active` flag; roles without the flag are unaffected
    pub async fn deactivate_account(&self, id: Uuid, role: Role) {
        if let Some(account) = self.accounts.write().await.get_mut(&(id, role)) {
            account.active = false;
        }
    }

    /// Soft-delete the account row
    pub async fn remove_account(&self, id: Uuid, role: Role) {
        if let Some(account) = self.accounts.write().await.get_mut(&(id, role)) {
            account.deleted = true;
        }
    }

    /// Place a row directly, bypassing unique checks and the mutation counter
    pub async fn seed(&self, resource: Resource) {
        self.rows
            .write()
            .await
            .entry(resource.resource_type.clone())
            .or_default()
            .insert(resource.id, resource);
    }

    pub async fn add_participant(&self, table: &str, resource_id: Uuid, actor_id: Uuid) {
        self.participants
            .write()
            .await
            .insert((table.to_string(), resource_id, actor_id));
    }

    /// Stored row regardless of deletion state
    pub async fn get_raw(&self, resource_type: &str, id: Uuid) -> Option<Resource> {
        self.rows.read().await.get(resource_type).and_then(|t| t.get(&id)).cloned()
    }

    /// Number of stored rows of a type, deleted ones included
    pub async fn count(&self, resource_type: &str) -> usize {
        self.rows.read().await.get(resource_type).map_or(0, BTreeMap::len)
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }

    /// Make every subsequent audit append fail
    pub fn fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, AtomicOrdering::SeqCst);
    }

    /// Calls made to mutating resource methods, successful or not
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(AtomicOrdering::SeqCst)
    }

    fn count_mutation(&self) {
        self.mutations.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

fn is_live(policy: &ResourcePolicy, resource: &Resource) -> bool {
    !policy.has_retention() || !resource.is_deleted()
}

fn is_locked(policy: &ResourcePolicy, resource: &Resource) -> bool {
    policy.locked_state(&resource.status).is_some()
}

/// Column value as Postgres would render it through `::text`
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// Order two column values; nulls sort last as in Postgres ascending order
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (timestamp_of(a), timestamp_of(b)) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            text_of(a).cmp(&text_of(b))
        }
    }
}

impl MemoryStore {
    async fn matches_scope(
        &self,
        policy: &ResourcePolicy,
        resource: &Resource,
        scope: &ScopeFilter,
    ) -> bool {
        match scope {
            ScopeFilter::FieldEquals { field, value } => resource
                .field_value(policy, field)
                .and_then(|v| text_of(&v))
                .is_some_and(|v| v == value.to_string()),
            ScopeFilter::ParticipatedBy { actor_id } => {
                let Some(participation) = &policy.participation else {
                    return false;
                };
                let local = match &participation.via_parent {
                    Some(parent) => resource.parent(parent),
                    None => Some(resource.id),
                };
                match local {
                    Some(local) => self
                        .participants
                        .read()
                        .await
                        .contains(&(participation.table.clone(), local, *actor_id)),
                    None => false,
                }
            }
        }
    }

    async fn matches(&self, policy: &ResourcePolicy, query: &BoundedQuery, resource: &Resource) -> bool {
        if query.live_only && resource.is_deleted() {
            return false;
        }
        for scope in &query.scope {
            if !self.matches_scope(policy, resource, scope).await {
                return false;
            }
        }
        for filter in &query.filters {
            let value = resource.field_value(policy, &filter.field).and_then(|v| text_of(&v));
            if value.as_deref() != Some(filter.value.as_str()) {
                return false;
            }
        }
        if let Some(range) = &query.date_range {
            let Some(at) = resource.field_value(policy, &range.field).and_then(|v| timestamp_of(&v)) else {
                return false;
            };
            if range.gte.is_some_and(|gte| at < gte) || range.lte.is_some_and(|lte| at > lte) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_active_account(&self, id: Uuid, role: Role) -> Result<bool, StoreError> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .get(&(id, role))
            .is_some_and(|a| !a.deleted && (a.active || !role.has_active_flag())))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn fetch(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Resource>, StoreError> {
        let rows = self.rows.read().await;
        let found = rows.get(&policy.resource_type).and_then(|t| t.get(&id));
        Ok(found
            .filter(|r| visibility == Visibility::IncludeDeleted || is_live(policy, r))
            .cloned())
    }

    async fn list(
        &self,
        policy: &ResourcePolicy,
        query: &BoundedQuery,
    ) -> Result<(Vec<Resource>, i64), StoreError> {
        let candidates: Vec<Resource> = self
            .rows
            .read()
            .await
            .get(&policy.resource_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();

        let mut matched = Vec::new();
        for resource in candidates {
            if self.matches(policy, query, &resource).await {
                matched.push(resource);
            }
        }

        let field = &query.sort.field;
        matched.sort_by(|a, b| {
            let ordering = compare_values(
                a.field_value(policy, field).as_ref(),
                b.field_value(policy, field).as_ref(),
            );
            let ordering = match query.sort.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.id.cmp(&b.id))
        });

        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(query.offset().max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn is_participant(
        &self,
        participation: &Participation,
        resource_id: Uuid,
        actor_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .participants
            .read()
            .await
            .contains(&(participation.table.clone(), resource_id, actor_id)))
    }

    async fn find_by_fields(
        &self,
        policy: &ResourcePolicy,
        fields: &[(String, Value)],
    ) -> Result<Option<Resource>, StoreError> {
        let rows = self.rows.read().await;
        let found = rows.get(&policy.resource_type).and_then(|t| {
            t.values().find(|r| {
                is_live(policy, r)
                    && fields
                        .iter()
                        .all(|(field, value)| r.field_value(policy, field).as_ref() == Some(value))
            })
        });
        Ok(found.cloned())
    }

    async fn count_references(
        &self,
        referencing: &ResourcePolicy,
        field: &str,
        target_id: Uuid,
    ) -> Result<i64, StoreError> {
        let target = Value::String(target_id.to_string());
        let rows = self.rows.read().await;
        let count = rows.get(&referencing.resource_type).map_or(0, |t| {
            t.values()
                .filter(|r| is_live(referencing, r))
                .filter(|r| r.field_value(referencing, field).as_ref() == Some(&target))
                .count()
        });
        Ok(count as i64)
    }

    async fn insert(&self, policy: &ResourcePolicy, resource: Resource) -> Result<Option<Resource>, StoreError> {
        self.count_mutation();
        let mut rows = self.rows.write().await;
        let table = rows.entry(policy.resource_type.clone()).or_default();

        // Checked under the write lock, like a unique index
        for key in &policy.unique_keys {
            let values: Vec<Option<Value>> = key.iter().map(|f| resource.field_value(policy, f)).collect();
            if values.iter().any(Option::is_none) {
                continue;
            }
            let taken = table.values().any(|existing| {
                is_live(policy, existing)
                    && key
                        .iter()
                        .zip(&values)
                        .all(|(f, v)| &existing.field_value(policy, f) == v)
            });
            if taken {
                return Ok(None);
            }
        }

        if table.contains_key(&resource.id) {
            return Ok(None);
        }
        table.insert(resource.id, resource.clone());
        Ok(Some(resource))
    }

    async fn update(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        changes: &ResourceChanges,
    ) -> Result<Option<Resource>, StoreError> {
        self.count_mutation();
        let mut rows = self.rows.write().await;
        let Some(resource) = rows.get_mut(&policy.resource_type).and_then(|t| t.get_mut(&id)) else {
            return Ok(None);
        };
        if !is_live(policy, resource) || is_locked(policy, resource) {
            return Ok(None);
        }
        changes.apply_to(resource);
        Ok(Some(resource.clone()))
    }

    async fn soft_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError> {
        self.count_mutation();
        let mut rows = self.rows.write().await;
        let Some(resource) = rows.get_mut(&policy.resource_type).and_then(|t| t.get_mut(&id)) else {
            return Ok(None);
        };
        if resource.is_deleted() || is_locked(policy, resource) {
            return Ok(None);
        }
        let now = Utc::now();
        resource.deleted_at = Some(now);
        resource.updated_at = now;
        Ok(Some(resource.clone()))
    }

    async fn hard_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<bool, StoreError> {
        self.count_mutation();
        let mut rows = self.rows.write().await;
        let Some(table) = rows.get_mut(&policy.resource_type) else {
            return Ok(false);
        };
        let removable = table.get(&id).is_some_and(|r| !is_locked(policy, r));
        if removable {
            table.remove(&id);
        }
        Ok(removable)
    }

    async fn restore(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError> {
        self.count_mutation();
        let mut rows = self.rows.write().await;
        let Some(resource) = rows.get_mut(&policy.resource_type).and_then(|t| t.get_mut(&id)) else {
            return Ok(None);
        };
        if !resource.is_deleted() {
            return Ok(None);
        }
        resource.deleted_at = None;
        resource.updated_at = Utc::now();
        Ok(Some(resource.clone()))
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        if self.fail_audit.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("audit sink rejected the entry".to_string()));
        }
        self.audit.write().await.push(entry.clone());
        Ok(())
    }
}
