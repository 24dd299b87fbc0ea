#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use tenant_guard::actor::{Actor, ActorResolver, JwtVerifier, Role};
use tenant_guard::audit::AuditRecorder;
use tenant_guard::config::QueryConfig;
use tenant_guard::handlers::AppState;
use tenant_guard::policy::{DenialMode, ListScope, Participation, PolicyRegistry, ResourcePolicy, SortDirection};
use tenant_guard::resource::{NewResource, Resource};
use tenant_guard::service::ResourceService;
use tenant_guard::store::MemoryStore;
use tenant_guard::GuardResult;

pub const SECRET: &str = "integration-test-secret";

/// The policy table the integration tests run against
pub fn policies() -> Vec<ResourcePolicy> {
    vec![
        ResourcePolicy::new("appointments")
            .owned_by("patient_id")
            .with_participation(Participation {
                table: "appointment_doctors".into(),
                resource_field: "appointment_id".into(),
                actor_field: "doctor_id".into(),
                via_parent: None,
            })
            .for_roles([Role::Patient, Role::Doctor, Role::SystemAdmin])
            .locked_in("completed", "Completed appointments cannot be changed")
            .locked_in("cancelled", "Cancelled appointments cannot be changed")
            .sortable(["starts_at"])
            .filterable(["status"])
            .audit_reads(),
        ResourcePolicy::new("job_posting_states")
            .without_status()
            .list_scope(ListScope::Unscoped)
            .referenced_by("job_postings", "state_id"),
        ResourcePolicy::new("job_postings")
            .owned_by("recruiter_id")
            .with_parent("job_posting_states", "state_id")
            .for_roles([Role::Recruiter, Role::Member, Role::SystemAdmin])
            .sortable(["title"])
            .filterable(["status"]),
        ResourcePolicy::new("applications")
            .owned_by("candidate_id")
            .with_parent("job_postings", "job_posting_id")
            .with_chain(["job_postings"])
            .with_denial(DenialMode::RevealForbidden)
            .list_scope(ListScope::Parent("job_postings".into()))
            .locked_in("withdrawn", "Application has been withdrawn"),
        ResourcePolicy::new("interviews")
            .with_parent("applications", "application_id")
            .with_participation(Participation {
                table: "interview_participants".into(),
                resource_field: "interview_id".into(),
                actor_field: "recruiter_id".into(),
                via_parent: None,
            })
            .with_chain(["applications", "job_postings"])
            .list_scope(ListScope::Participant),
        ResourcePolicy::new("dashboard_preferences")
            .owned_by("user_id")
            .without_status()
            .unique_on(["dashboard_id", "user_id"])
            .hard_delete()
            .filterable(["dashboard_id"])
            .default_sort("updated_at", SortDirection::Desc),
    ]
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<PolicyRegistry>,
    pub verifier: Arc<JwtVerifier>,
    pub resolver: ActorResolver,
    pub service: ResourceService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_audit(true)
    }

    pub fn with_audit(enabled: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PolicyRegistry::from_policies(policies()).expect("fixture policies are valid"));
        let verifier = Arc::new(JwtVerifier::new(SECRET).expect("secret is set"));
        let resolver = ActorResolver::new(verifier.clone(), store.clone());
        let service = ResourceService::new(
            registry.clone(),
            store.clone(),
            AuditRecorder::new(store.clone(), enabled),
            QueryConfig::default(),
        );
        Self {
            store,
            registry,
            verifier,
            resolver,
            service,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            resolver: self.resolver.clone(),
            service: self.service.clone(),
        }
    }

    /// A fresh actor with a live account
    pub async fn actor(&self, role: Role) -> Actor {
        let actor = Actor::new(Uuid::new_v4(), role);
        self.store.add_account(actor.id, role).await;
        actor
    }

    pub fn token(&self, actor: &Actor) -> Result<String> {
        Ok(self
            .verifier
            .issue_for(actor.id, actor.role, chrono::Duration::hours(1))?)
    }

    /// Create through the service from the JSON shape the HTTP adapter accepts
    pub async fn create(&self, actor: &Actor, resource_type: &str, body: Value) -> GuardResult<Resource> {
        let input: NewResource = serde_json::from_value(body).expect("valid create body");
        self.service.create(actor, resource_type, input).await
    }

    /// Open posting owned by `recruiter`, with its state row
    pub async fn posting(&self, admin: &Actor, recruiter: &Actor) -> Result<(Resource, Resource)> {
        let state = self
            .create(admin, "job_posting_states", serde_json::json!({"attributes": {"name": "open"}}))
            .await?;
        let posting = self
            .create(
                recruiter,
                "job_postings",
                serde_json::json!({
                    "parent_refs": {"job_posting_states": state.id},
                    "status": "open",
                    "attributes": {"title": "Nurse"}
                }),
            )
            .await?;
        Ok((state, posting))
    }
}
