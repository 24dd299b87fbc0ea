//! Best-effort audit trail.
//!
//! Recording never changes the outcome of the operation being audited. Sink
//! failures are logged and dropped here, in one place, instead of at every
//! call site.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::actor::{Actor, Role};
use crate::store::AuditSink;
use crate::types::Operation;

/// Append-only record of who did what to which resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub actor_role: Role,
    pub operation: Operation,
    pub target_type: String,
    /// `None` for operations over a collection
    pub target_id: Option<Uuid>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: &Actor, operation: Operation, target_type: impl Into<String>, target_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor.id,
            actor_role: actor.role,
            operation,
            target_type: target_type.into(),
            target_id,
            detail: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    enabled: bool,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>, enabled: bool) -> Self {
        Self { sink, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Write and wait. Used after mutations, once the business write succeeded.
    pub async fn record(&self, entry: AuditEntry) {
        if !self.is_enabled() {
            return;
        }
        write_entry(self.sink.as_ref(), &entry).await;
    }

    /// Write on a spawned task and return at once. Used for reads.
    pub fn record_detached(&self, entry: AuditEntry) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let sink = Arc::clone(&self.sink);
        Some(tokio::spawn(async move {
            write_entry(sink.as_ref(), &entry).await;
        }))
    }
}

async fn write_entry(sink: &dyn AuditSink, entry: &AuditEntry) {
    match sink.append(entry).await {
        Ok(()) => tracing::debug!(
            "Audit {} {} {:?} by {}",
            entry.operation, entry.target_type, entry.target_id, entry.actor_id
        ),
        Err(e) => tracing::warn!(
            "Audit write failed for {} {} {:?} by {}: {}",
            entry.operation, entry.target_type, entry.target_id, entry.actor_id, e
        ),
    }
}
