//! Per-resource-type policy table.
//!
//! One [`ResourcePolicy`] row describes everything the guard, the lifecycle
//! checks and the query builder need to know about a resource type: where its
//! owner lives, how to walk to its ancestors, which states lock it, which field
//! tuples are unique and what callers may sort and filter on. Rows are built in
//! code or loaded from YAML and checked once by [`PolicyRegistry::validate`].

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actor::Role;
use crate::error::{GuardError, GuardResult};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid identifier in policy '{resource_type}': {name}")]
    InvalidIdentifier { resource_type: String, name: String },

    #[error("Duplicate policy for resource type: {0}")]
    Duplicate(String),

    #[error("Policy '{resource_type}' references unknown resource type '{target}'")]
    UnknownResourceType { resource_type: String, target: String },

    #[error("Policy '{resource_type}' is inconsistent: {message}")]
    Inconsistent { resource_type: String, message: String },

    #[error("Failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse policy file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// What the caller sees when an ownership check fails on a record that exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialMode {
    /// Hide existence: answer exactly like a missing record
    #[default]
    MaskAsNotFound,
    /// The actor knows the record exists ("your own profile only")
    RevealForbidden,
}

/// How a delete is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Table has a `deleted_at` column; deletes set it
    #[default]
    SoftDelete,
    /// No retention column; deletes remove the row
    HardDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    /// Lenient parse: anything that is not asc/desc yields `None`
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("asc") {
            Some(SortDirection::Asc)
        } else if value.eq_ignore_ascii_case("desc") {
            Some(SortDirection::Desc)
        } else {
            None
        }
    }
}

/// Column on this resource pointing at a parent of the given type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub resource_type: String,
    pub field: String,
}

/// Join table listing actors participating in a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub table: String,
    pub resource_field: String,
    pub actor_field: String,
    /// Parent type whose participants count for this resource; `None` means
    /// the join is keyed by this resource's own id.
    #[serde(default)]
    pub via_parent: Option<String>,
}

/// Another resource type holding a column that points at this one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_type: String,
    pub field: String,
}

/// A status that blocks further mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedState {
    pub status: String,
    pub message: String,
}

/// Which rows a non-admin actor sees in list queries.
///
/// List scopes are narrower than single-record access: rows the actor reaches
/// only through the parent chain are readable by id but not listed under
/// `Owner` or `Participant`. Use `Parent` to list children of an owned ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parent", rename_all = "snake_case")]
pub enum ListScope {
    /// Rows whose owner field equals the actor
    #[default]
    Owner,
    /// Rows the actor participates in through the participation join
    Participant,
    /// Rows under one parent of the named type; the caller names the parent in
    /// the filters and the parent itself must be readable by the actor
    Parent(String),
    /// No row scoping beyond the role gate (lookup tables)
    Unscoped,
}

fn default_status_field() -> Option<String> {
    Some("status".to_string())
}

fn default_date_field() -> String {
    "created_at".to_string()
}

fn default_sort_fields() -> Vec<String> {
    vec!["created_at".to_string(), "updated_at".to_string()]
}

fn default_true() -> bool {
    true
}

/// One row of the policy table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Resource type name, also the backing table name
    pub resource_type: String,
    #[serde(default)]
    pub owner_field: Option<String>,
    #[serde(default = "default_status_field")]
    pub status_field: Option<String>,
    #[serde(default)]
    pub parents: Vec<ParentLink>,
    #[serde(default)]
    pub participation: Option<Participation>,
    /// Parent types walked in order, nearest first, when resolving chain ownership
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default = "default_true")]
    pub admin_bypass: bool,
    #[serde(default)]
    pub denial: DenialMode,
    /// Roles allowed to touch this type at all; empty means every role
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub locked_states: Vec<LockedState>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
    #[serde(default)]
    pub referenced_by: Vec<Reference>,
    #[serde(default = "default_sort_fields")]
    pub sort_fields: Vec<String>,
    #[serde(default = "default_date_field")]
    pub default_sort: String,
    #[serde(default)]
    pub default_direction: SortDirection,
    #[serde(default)]
    pub filter_fields: Vec<String>,
    #[serde(default = "default_date_field")]
    pub date_field: String,
    #[serde(default)]
    pub list_scope: ListScope,
    /// Record an audit entry for every successful single-record read
    #[serde(default)]
    pub audit_reads: bool,
}

impl ResourcePolicy {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            owner_field: None,
            status_field: default_status_field(),
            parents: Vec::new(),
            participation: None,
            chain: Vec::new(),
            admin_bypass: true,
            denial: DenialMode::default(),
            roles: Vec::new(),
            retention: Retention::default(),
            locked_states: Vec::new(),
            unique_keys: Vec::new(),
            referenced_by: Vec::new(),
            sort_fields: default_sort_fields(),
            default_sort: default_date_field(),
            default_direction: SortDirection::default(),
            filter_fields: Vec::new(),
            date_field: default_date_field(),
            list_scope: ListScope::default(),
            audit_reads: false,
        }
    }

    pub fn owned_by(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    pub fn without_status(mut self) -> Self {
        self.status_field = None;
        self
    }

    pub fn with_parent(mut self, resource_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.parents.push(ParentLink {
            resource_type: resource_type.into(),
            field: field.into(),
        });
        self
    }

    pub fn with_participation(mut self, participation: Participation) -> Self {
        self.participation = Some(participation);
        self
    }

    pub fn with_chain<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain = chain.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_admin_bypass(mut self) -> Self {
        self.admin_bypass = false;
        self
    }

    pub fn with_denial(mut self, denial: DenialMode) -> Self {
        self.denial = denial;
        self
    }

    pub fn for_roles<I: IntoIterator<Item = Role>>(mut self, roles: I) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn hard_delete(mut self) -> Self {
        self.retention = Retention::HardDelete;
        self
    }

    pub fn locked_in(mut self, status: impl Into<String>, message: impl Into<String>) -> Self {
        self.locked_states.push(LockedState {
            status: status.into(),
            message: message.into(),
        });
        self
    }

    pub fn unique_on<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys.push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn referenced_by(mut self, resource_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.referenced_by.push(Reference {
            resource_type: resource_type.into(),
            field: field.into(),
        });
        self
    }

    pub fn sortable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.sort_fields.contains(&field) {
                self.sort_fields.push(field);
            }
        }
        self
    }

    pub fn default_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.default_sort = field.into();
        self.default_direction = direction;
        self
    }

    pub fn filterable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn dated_by(mut self, field: impl Into<String>) -> Self {
        self.date_field = field.into();
        self
    }

    pub fn list_scope(mut self, scope: ListScope) -> Self {
        self.list_scope = scope;
        self
    }

    pub fn audit_reads(mut self) -> Self {
        self.audit_reads = true;
        self
    }

    pub fn has_retention(&self) -> bool {
        self.retention == Retention::SoftDelete
    }

    pub fn allows_role(&self, role: Role) -> bool {
        self.roles.is_empty() || self.roles.contains(&role)
    }

    /// Column on this resource pointing at a parent of `resource_type`
    pub fn parent_field(&self, resource_type: &str) -> Option<&str> {
        self.parents
            .iter()
            .find(|p| p.resource_type == resource_type)
            .map(|p| p.field.as_str())
    }

    pub fn locked_state(&self, status: &str) -> Option<&LockedState> {
        self.locked_states.iter().find(|s| s.status == status)
    }

    pub fn locked_statuses(&self) -> Vec<String> {
        self.locked_states.iter().map(|s| s.status.clone()).collect()
    }

    /// Every column name the policy mentions, for identifier validation
    fn identifiers(&self) -> Vec<&str> {
        let mut names = vec![self.resource_type.as_str(), self.default_sort.as_str(), self.date_field.as_str()];
        names.extend(self.owner_field.as_deref());
        names.extend(self.status_field.as_deref());
        names.extend(self.parents.iter().flat_map(|p| [p.resource_type.as_str(), p.field.as_str()]));
        if let Some(p) = &self.participation {
            names.extend([p.table.as_str(), p.resource_field.as_str(), p.actor_field.as_str()]);
        }
        names.extend(self.unique_keys.iter().flatten().map(String::as_str));
        names.extend(self.referenced_by.iter().flat_map(|r| [r.resource_type.as_str(), r.field.as_str()]));
        names.extend(self.sort_fields.iter().map(String::as_str));
        names.extend(self.filter_fields.iter().map(String::as_str));
        names
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    resources: Vec<ResourcePolicy>,
}

/// Lookup of policies by resource type
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, ResourcePolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry from policy rows
    pub fn from_policies<I: IntoIterator<Item = ResourcePolicy>>(policies: I) -> Result<Self, PolicyError> {
        let mut registry = Self::new();
        for policy in policies {
            registry.insert(policy)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = serde_yaml::from_str(yaml)?;
        Self::from_policies(file.resources)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn insert(&mut self, policy: ResourcePolicy) -> Result<(), PolicyError> {
        if self.policies.contains_key(&policy.resource_type) {
            return Err(PolicyError::Duplicate(policy.resource_type));
        }
        self.policies.insert(policy.resource_type.clone(), policy);
        Ok(())
    }

    /// Policy for a resource type; unknown types answer like a missing record
    pub fn get(&self, resource_type: &str) -> GuardResult<&ResourcePolicy> {
        self.policies
            .get(resource_type)
            .ok_or_else(|| GuardError::not_found(format!("Unknown resource type '{}'", resource_type)))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Check identifiers and cross-references between rows
    pub fn validate(&self) -> Result<(), PolicyError> {
        for policy in self.policies.values() {
            let rt = &policy.resource_type;
            let inconsistent = |message: String| PolicyError::Inconsistent {
                resource_type: rt.clone(),
                message,
            };

            if let Some(bad) = policy.identifiers().into_iter().find(|n| !is_valid_identifier(n)) {
                return Err(PolicyError::InvalidIdentifier {
                    resource_type: rt.clone(),
                    name: bad.to_string(),
                });
            }

            for parent in &policy.parents {
                self.require(rt, &parent.resource_type)?;
            }

            // Each hop must be reachable from the previous one
            let mut current = policy;
            for hop in &policy.chain {
                if current.parent_field(hop).is_none() {
                    return Err(inconsistent(format!(
                        "chain hop '{}' is not a parent of '{}'",
                        hop, current.resource_type
                    )));
                }
                current = self.require(rt, hop)?;
            }

            if let Some(participation) = &policy.participation {
                if let Some(parent) = &participation.via_parent {
                    if policy.parent_field(parent).is_none() {
                        return Err(inconsistent(format!(
                            "participation via '{}' which is not a parent",
                            parent
                        )));
                    }
                }
            }

            for reference in &policy.referenced_by {
                self.require(rt, &reference.resource_type)?;
            }

            match &policy.list_scope {
                ListScope::Owner if policy.owner_field.is_none() => {
                    return Err(inconsistent("owner list scope without an owner field".to_string()));
                }
                ListScope::Participant if policy.participation.is_none() => {
                    return Err(inconsistent("participant list scope without a participation join".to_string()));
                }
                ListScope::Parent(parent) if policy.parent_field(parent).is_none() => {
                    return Err(inconsistent(format!("parent list scope on unknown parent '{}'", parent)));
                }
                _ => {}
            }

            if !policy.sort_fields.contains(&policy.default_sort) {
                return Err(inconsistent(format!(
                    "default sort '{}' is not a sortable field",
                    policy.default_sort
                )));
            }
        }
        Ok(())
    }

    fn require(&self, from: &str, target: &str) -> Result<&ResourcePolicy, PolicyError> {
        self.policies
            .get(target)
            .ok_or_else(|| PolicyError::UnknownResourceType {
                resource_type: from.to_string(),
                target: target.to_string(),
            })
    }
}
