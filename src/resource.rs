use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{GuardError, GuardResult};
use crate::policy::ResourcePolicy;
use crate::store::StoreError;

/// Columns only the core may write
const SYSTEM_FIELDS: &[&str] = &["id", "created_at", "updated_at", "deleted_at"];

/// A stored domain entity, viewed through its policy's column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub resource_type: String,
    pub owner_ref: Option<Uuid>,
    /// Parent ids keyed by parent resource type
    pub parent_refs: BTreeMap<String, Uuid>,
    pub status: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Remaining business columns, untouched by the core
    pub attributes: Map<String, Value>,
}

impl Resource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn parent(&self, resource_type: &str) -> Option<Uuid> {
        self.parent_refs.get(resource_type).copied()
    }

    /// Value of a named column, resolving the policy's owner, parent and status
    /// columns back onto the typed fields.
    pub fn field_value(&self, policy: &ResourcePolicy, name: &str) -> Option<Value> {
        match name {
            "id" => return Some(Value::String(self.id.to_string())),
            "created_at" => return Some(Value::String(self.created_at.to_rfc3339())),
            "updated_at" => return Some(Value::String(self.updated_at.to_rfc3339())),
            "deleted_at" => return self.deleted_at.map(|d| Value::String(d.to_rfc3339())),
            _ => {}
        }
        if policy.owner_field.as_deref() == Some(name) {
            return self.owner_ref.map(|id| Value::String(id.to_string()));
        }
        if policy.status_field.as_deref() == Some(name) {
            return Some(Value::String(self.status.clone()));
        }
        if let Some(link) = policy.parents.iter().find(|p| p.field == name) {
            return self.parent(&link.resource_type).map(|id| Value::String(id.to_string()));
        }
        self.attributes.get(name).cloned()
    }

    /// Map a `row_to_json` object onto a resource using the policy's columns
    pub fn from_row(policy: &ResourcePolicy, mut row: Map<String, Value>) -> Result<Self, StoreError> {
        let id = take_uuid(&mut row, "id")?
            .ok_or_else(|| StoreError::Decode("row without id".to_string()))?;

        let owner_ref = match &policy.owner_field {
            Some(field) => take_uuid(&mut row, field)?,
            None => None,
        };

        let mut parent_refs = BTreeMap::new();
        for link in &policy.parents {
            if let Some(parent_id) = take_uuid(&mut row, &link.field)? {
                parent_refs.insert(link.resource_type.clone(), parent_id);
            }
        }

        let status = match &policy.status_field {
            Some(field) => match row.remove(field) {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            None => String::new(),
        };

        let created_at = take_timestamp(&mut row, "created_at")?
            .ok_or_else(|| StoreError::Decode("row without created_at".to_string()))?;
        let updated_at = take_timestamp(&mut row, "updated_at")?.unwrap_or(created_at);
        let deleted_at = take_timestamp(&mut row, "deleted_at")?;

        Ok(Self {
            id,
            resource_type: policy.resource_type.clone(),
            owner_ref,
            parent_refs,
            status,
            deleted_at,
            created_at,
            updated_at,
            attributes: row,
        })
    }

    /// Flatten back into column form for inserts
    pub fn to_row(&self, policy: &ResourcePolicy) -> Map<String, Value> {
        let mut row = self.attributes.clone();
        row.insert("id".into(), Value::String(self.id.to_string()));
        if let (Some(field), Some(owner)) = (&policy.owner_field, self.owner_ref) {
            row.insert(field.clone(), Value::String(owner.to_string()));
        }
        for link in &policy.parents {
            if let Some(parent_id) = self.parent(&link.resource_type) {
                row.insert(link.field.clone(), Value::String(parent_id.to_string()));
            }
        }
        if let Some(field) = &policy.status_field {
            row.insert(field.clone(), Value::String(self.status.clone()));
        }
        row.insert("created_at".into(), Value::String(self.created_at.to_rfc3339()));
        row.insert("updated_at".into(), Value::String(self.updated_at.to_rfc3339()));
        if policy.has_retention() {
            row.insert(
                "deleted_at".into(),
                self.deleted_at.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null),
            );
        }
        row
    }
}

fn take_uuid(row: &mut Map<String, Value>, field: &str) -> Result<Option<Uuid>, StoreError> {
    match row.remove(field) {
        Some(Value::String(s)) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|_| StoreError::Decode(format!("column '{}' is not a uuid", field))),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(StoreError::Decode(format!("column '{}' is not a uuid", field))),
    }
}

fn take_timestamp(row: &mut Map<String, Value>, field: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    match row.remove(field) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| StoreError::Decode(format!("column '{}' is not a timestamp", field))),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(StoreError::Decode(format!("column '{}' is not a timestamp", field))),
    }
}

/// Caller input for a create
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewResource {
    #[serde(default)]
    pub owner_ref: Option<Uuid>,
    #[serde(default)]
    pub parent_refs: BTreeMap<String, Uuid>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl NewResource {
    /// Materialize into a resource stamped with a fresh id and timestamps
    pub fn into_resource(self, policy: &ResourcePolicy, owner_ref: Option<Uuid>) -> GuardResult<Resource> {
        reject_reserved(policy, self.attributes.keys())?;
        for parent_type in self.parent_refs.keys() {
            if policy.parent_field(parent_type).is_none() {
                return Err(GuardError::validation(format!(
                    "'{}' is not a parent of '{}'",
                    parent_type, policy.resource_type
                )));
            }
        }
        let now = Utc::now();
        Ok(Resource {
            id: Uuid::new_v4(),
            resource_type: policy.resource_type.clone(),
            owner_ref,
            parent_refs: self.parent_refs,
            status: self.status.unwrap_or_default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
            attributes: self.attributes,
        })
    }
}

/// Validated column changes for an update. Status moves through the policy's
/// status column; ownership and parent links cannot be rewritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceChanges {
    pub status: Option<String>,
    pub attributes: Map<String, Value>,
}

impl ResourceChanges {
    pub fn from_json(policy: &ResourcePolicy, payload: Value) -> GuardResult<Self> {
        let Value::Object(mut map) = payload else {
            return Err(GuardError::validation("Expected JSON object"));
        };

        let status = match policy.status_field.as_deref().and_then(|f| map.remove(f)) {
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(GuardError::validation("Status must be a string")),
            None => None,
        };

        reject_reserved(policy, map.keys())?;
        if status.is_none() && map.is_empty() {
            return Err(GuardError::validation("No changes supplied"));
        }
        Ok(Self { status, attributes: map })
    }

    /// Column form of the changes, as written by the store
    pub fn to_row(&self, policy: &ResourcePolicy) -> Map<String, Value> {
        let mut row = self.attributes.clone();
        if let (Some(field), Some(status)) = (&policy.status_field, &self.status) {
            row.insert(field.clone(), Value::String(status.clone()));
        }
        row
    }

    pub fn apply_to(&self, resource: &mut Resource) {
        if let Some(status) = &self.status {
            resource.status = status.clone();
        }
        for (key, value) in &self.attributes {
            resource.attributes.insert(key.clone(), value.clone());
        }
        resource.updated_at = Utc::now();
    }
}

fn reject_reserved<'a>(policy: &ResourcePolicy, keys: impl Iterator<Item = &'a String>) -> GuardResult<()> {
    for key in keys {
        let reserved = SYSTEM_FIELDS.contains(&key.as_str())
            || policy.owner_field.as_deref() == Some(key.as_str())
            || policy.status_field.as_deref() == Some(key.as_str())
            || policy.parents.iter().any(|p| &p.field == key);
        if reserved {
            return Err(GuardError::validation(format!(
                "Field '{}' cannot be set directly",
                key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn appointments() -> ResourcePolicy {
        ResourcePolicy::new("appointments")
            .owned_by("patient_id")
            .with_parent("doctors", "doctor_id")
    }

    #[test]
    fn maps_row_columns_onto_typed_fields() {
        let policy = appointments();
        let id = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        let row = json!({
            "id": id,
            "patient_id": patient,
            "doctor_id": doctor,
            "status": "scheduled",
            "notes": "bring x-rays",
            "created_at": "2024-03-01T10:00:00.123456+00:00",
            "updated_at": "2024-03-02T10:00:00+00:00",
            "deleted_at": null
        });
        let Value::Object(map) = row else { unreachable!() };

        let resource = Resource::from_row(&policy, map).unwrap();
        assert_eq!(resource.id, id);
        assert_eq!(resource.owner_ref, Some(patient));
        assert_eq!(resource.parent("doctors"), Some(doctor));
        assert_eq!(resource.status, "scheduled");
        assert!(!resource.is_deleted());
        assert_eq!(resource.attributes.get("notes"), Some(&json!("bring x-rays")));
        assert!(!resource.attributes.contains_key("patient_id"));

        assert_eq!(resource.field_value(&policy, "patient_id"), Some(json!(patient.to_string())));
        assert_eq!(resource.field_value(&policy, "doctor_id"), Some(json!(doctor.to_string())));
        assert_eq!(resource.field_value(&policy, "status"), Some(json!("scheduled")));

        let back = resource.to_row(&policy);
        assert_eq!(back.get("patient_id"), Some(&json!(patient.to_string())));
        assert_eq!(back.get("deleted_at"), Some(&Value::Null));
    }

    #[test]
    fn rejects_non_uuid_owner() {
        let policy = appointments();
        let Value::Object(map) = json!({
            "id": Uuid::new_v4(),
            "patient_id": 42,
            "created_at": "2024-03-01T10:00:00Z"
        }) else { unreachable!() };
        assert!(matches!(Resource::from_row(&policy, map), Err(StoreError::Decode(_))));
    }

    #[test]
    fn changes_split_status_and_reject_system_fields() {
        let policy = appointments();
        let changes = ResourceChanges::from_json(&policy, json!({"status": "confirmed", "notes": "x"})).unwrap();
        assert_eq!(changes.status.as_deref(), Some("confirmed"));
        assert!(changes.attributes.contains_key("notes"));

        for field in ["id", "deleted_at", "patient_id", "doctor_id"] {
            let err = ResourceChanges::from_json(&policy, json!({ field: "x" })).unwrap_err();
            assert!(matches!(err, GuardError::Validation(_)), "{} accepted", field);
        }
        assert!(ResourceChanges::from_json(&policy, json!({})).is_err());
        assert!(ResourceChanges::from_json(&policy, json!([1, 2])).is_err());
    }

    #[test]
    fn new_resource_rejects_unknown_parent() {
        let policy = appointments();
        let input = NewResource {
            parent_refs: BTreeMap::from([("clinics".to_string(), Uuid::new_v4())]),
            ..Default::default()
        };
        assert!(matches!(input.into_resource(&policy, None), Err(GuardError::Validation(_))));
    }
}
