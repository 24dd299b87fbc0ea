//! Storage seams.
//!
//! The core never talks to a database directly. Account, resource and audit
//! storage are injected as trait objects; [`postgres::PgStore`] backs them with
//! a `sqlx` pool and [`memory::MemoryStore`] keeps everything in process.
//!
//! Mutating methods are conditional: they re-check the lifecycle predicates in
//! the write itself and return `None`/`false` when nothing matched.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::actor::Role;
use crate::audit::AuditEntry;
use crate::policy::{Participation, ResourcePolicy};
use crate::query::BoundedQuery;
use crate::resource::{Resource, ResourceChanges};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Whether a fetch may return soft-deleted rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    LiveOnly,
    IncludeDeleted,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// True when a live account of `role` exists for `id`
    async fn find_active_account(&self, id: Uuid, role: Role) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn fetch(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Resource>, StoreError>;

    /// One page of rows plus the total matching the same conditions
    async fn list(
        &self,
        policy: &ResourcePolicy,
        query: &BoundedQuery,
    ) -> Result<(Vec<Resource>, i64), StoreError>;

    async fn is_participant(
        &self,
        participation: &Participation,
        resource_id: Uuid,
        actor_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// First live row whose columns equal every given value
    async fn find_by_fields(
        &self,
        policy: &ResourcePolicy,
        fields: &[(String, Value)],
    ) -> Result<Option<Resource>, StoreError>;

    /// Live rows of `referencing` whose `field` points at `target_id`
    async fn count_references(
        &self,
        referencing: &ResourcePolicy,
        field: &str,
        target_id: Uuid,
    ) -> Result<i64, StoreError>;

    /// `None` when a unique key already holds the same values
    async fn insert(&self, policy: &ResourcePolicy, resource: Resource) -> Result<Option<Resource>, StoreError>;

    /// Applies only to a live row whose status is not locked
    async fn update(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        changes: &ResourceChanges,
    ) -> Result<Option<Resource>, StoreError>;

    /// Sets `deleted_at` on a live row whose status is not locked
    async fn soft_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError>;

    /// Removes a row whose status is not locked
    async fn hard_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<bool, StoreError>;

    /// Clears `deleted_at` on a deleted row
    async fn restore(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}
