use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::policy::ResourcePolicy;
use crate::resource::Resource;

/// RFC 3339, UTC, millisecond precision
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Re-render any RFC 3339 string in UTC milliseconds; other values pass through
fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(at) => Value::String(format_timestamp(&at.with_timezone(&Utc))),
            Err(_) => value.clone(),
        },
        other => other.clone(),
    }
}

/// Convert a resource into the public wire format
/// { id, type, attributes, meta, links }
pub fn resource_to_api_value(policy: &ResourcePolicy, resource: &Resource) -> Value {
    let mut attributes = Map::new();
    for (key, value) in &resource.attributes {
        attributes.insert(key.clone(), normalize_value(value));
    }
    if let (Some(field), Some(owner)) = (&policy.owner_field, resource.owner_ref) {
        attributes.insert(field.clone(), Value::String(owner.to_string()));
    }
    for link in &policy.parents {
        if let Some(parent_id) = resource.parent(&link.resource_type) {
            attributes.insert(link.field.clone(), Value::String(parent_id.to_string()));
        }
    }
    if let Some(field) = &policy.status_field {
        attributes.insert(field.clone(), Value::String(resource.status.clone()));
    }

    json!({
        "id": resource.id,
        "type": resource.resource_type,
        "attributes": attributes,
        "meta": {
            "created_at": format_timestamp(&resource.created_at),
            "updated_at": format_timestamp(&resource.updated_at),
            "deleted_at": resource.deleted_at.as_ref().map(format_timestamp),
        },
        "links": {
            "self": format!("/api/{}/{}", resource.resource_type, resource.id)
        }
    })
}

/// Convert a list of resources to API values
pub fn resources_to_api_values(policy: &ResourcePolicy, resources: &[Resource]) -> Vec<Value> {
    resources
        .iter()
        .map(|r| resource_to_api_value(policy, r))
        .collect()
}
