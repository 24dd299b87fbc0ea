use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use super::{AccountStore, AuditSink, ResourceStore, StoreError, Visibility};
use crate::actor::Role;
use crate::audit::AuditEntry;
use crate::policy::{is_valid_identifier, Participation, ResourcePolicy};
use crate::query::sql::quote;
use crate::query::{BoundedQuery, SqlParam};
use crate::resource::{Resource, ResourceChanges};

/// PostgreSQL-backed implementation of every store trait.
///
/// Rows travel as `row_to_json` objects so one code path serves every
/// resource type in the policy table. Writes go through
/// `jsonb_populate_record`, which lets Postgres coerce each JSON field to the
/// column's own type.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pings the pool to ensure connectivity
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn ident(name: &str) -> Result<String, StoreError> {
    if is_valid_identifier(name) {
        Ok(quote(name))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation(db.constraint().unwrap_or("unknown").to_string());
        }
    }
    StoreError::Sqlx(err)
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Uuid(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Timestamp(v) => query.bind(*v),
            SqlParam::BigInt(v) => query.bind(*v),
        };
    }
    query
}

fn decode_row(policy: &ResourcePolicy, row: &PgRow) -> Result<Resource, StoreError> {
    let value: Value = row.try_get("row")?;
    match value {
        Value::Object(map) => Resource::from_row(policy, map),
        other => Err(StoreError::Decode(format!("expected row object, got {}", other))),
    }
}

/// ` AND target."status" <> ALL($n)` when the policy locks any status
fn unlocked_clause(policy: &ResourcePolicy, next_param: usize) -> Result<Option<String>, StoreError> {
    match &policy.status_field {
        Some(field) if !policy.locked_states.is_empty() => Ok(Some(format!(
            " AND (target.{col} IS NULL OR target.{col} <> ALL(${n}))",
            col = ident(field)?,
            n = next_param
        ))),
        _ => Ok(None),
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn find_active_account(&self, id: Uuid, role: Role) -> Result<bool, StoreError> {
        let active = if role.has_active_flag() { " AND is_active = true" } else { "" };
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1 AND deleted_at IS NULL{}) AS found",
            ident(role.account_table())?,
            active
        );
        let row = sqlx::query(&query).bind(id).fetch_one(&self.pool).await?;
        Ok(row.try_get("found")?)
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn fetch(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Resource>, StoreError> {
        let live = if visibility == Visibility::LiveOnly && policy.has_retention() {
            " AND t.\"deleted_at\" IS NULL"
        } else {
            ""
        };
        let query = format!(
            "SELECT row_to_json(t) AS row FROM {} t WHERE t.\"id\" = $1{}",
            ident(&policy.resource_type)?,
            live
        );
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| decode_row(policy, r)).transpose()
    }

    async fn list(
        &self,
        policy: &ResourcePolicy,
        query: &BoundedQuery,
    ) -> Result<(Vec<Resource>, i64), StoreError> {
        let page = query.to_sql(policy);
        let count = query.to_count_sql(policy);
        tracing::debug!("List SQL: {}", page.query);

        let rows = bind_all(sqlx::query(&page.query), &page.params)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = bind_all(sqlx::query(&count.query), &count.params)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let resources = rows
            .iter()
            .map(|row| decode_row(policy, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((resources, total))
    }

    async fn is_participant(
        &self,
        participation: &Participation,
        resource_id: Uuid,
        actor_id: Uuid,
    ) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = $1 AND {} = $2) AS found",
            ident(&participation.table)?,
            ident(&participation.resource_field)?,
            ident(&participation.actor_field)?
        );
        let row = sqlx::query(&query)
            .bind(resource_id)
            .bind(actor_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn find_by_fields(
        &self,
        policy: &ResourcePolicy,
        fields: &[(String, Value)],
    ) -> Result<Option<Resource>, StoreError> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for (field, value) in fields {
            let column = ident(field)?;
            match value {
                Value::Null => conditions.push(format!("t.{} IS NULL", column)),
                Value::String(s) => {
                    params.push(SqlParam::Text(s.clone()));
                    conditions.push(format!("t.{}::text = ${}", column, params.len()));
                }
                other => {
                    params.push(SqlParam::Text(other.to_string()));
                    conditions.push(format!("t.{}::text = ${}", column, params.len()));
                }
            }
        }
        if policy.has_retention() {
            conditions.push("t.\"deleted_at\" IS NULL".to_string());
        }
        let query = format!(
            "SELECT row_to_json(t) AS row FROM {} t WHERE {} LIMIT 1",
            ident(&policy.resource_type)?,
            if conditions.is_empty() { "TRUE".to_string() } else { conditions.join(" AND ") }
        );
        let row = bind_all(sqlx::query(&query), &params)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| decode_row(policy, r)).transpose()
    }

    async fn count_references(
        &self,
        referencing: &ResourcePolicy,
        field: &str,
        target_id: Uuid,
    ) -> Result<i64, StoreError> {
        let live = if referencing.has_retention() { " AND t.\"deleted_at\" IS NULL" } else { "" };
        let query = format!(
            "SELECT COUNT(*) AS count FROM {} t WHERE t.{} = $1{}",
            ident(&referencing.resource_type)?,
            ident(field)?,
            live
        );
        let row = sqlx::query(&query).bind(target_id).fetch_one(&self.pool).await?;
        Ok(row.try_get("count")?)
    }

    async fn insert(&self, policy: &ResourcePolicy, resource: Resource) -> Result<Option<Resource>, StoreError> {
        let table = ident(&policy.resource_type)?;
        let row = resource.to_row(policy);
        let columns = row
            .keys()
            .map(|k| ident(k))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let query = format!(
            "INSERT INTO {table} AS target ({columns}) \
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
             ON CONFLICT DO NOTHING \
             RETURNING row_to_json(target) AS row",
        );
        let inserted = sqlx::query(&query)
            .bind(Value::Object(row))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        inserted.as_ref().map(|r| decode_row(policy, r)).transpose()
    }

    async fn update(
        &self,
        policy: &ResourcePolicy,
        id: Uuid,
        changes: &ResourceChanges,
    ) -> Result<Option<Resource>, StoreError> {
        let table = ident(&policy.resource_type)?;
        let row: Map<String, Value> = changes.to_row(policy);
        let mut assignments = row
            .keys()
            .map(|k| ident(k).map(|c| format!("{c} = input.{c}")))
            .collect::<Result<Vec<_>, _>>()?;
        assignments.push("\"updated_at\" = now()".to_string());

        let mut query = format!(
            "UPDATE {table} AS target SET {} \
             FROM jsonb_populate_record(NULL::{table}, $1::jsonb) AS input \
             WHERE target.\"id\" = $2",
            assignments.join(", ")
        );
        if policy.has_retention() {
            query.push_str(" AND target.\"deleted_at\" IS NULL");
        }
        let unlocked = unlocked_clause(policy, 3)?;
        if let Some(clause) = &unlocked {
            query.push_str(clause);
        }
        query.push_str(" RETURNING row_to_json(target) AS row");

        let mut q = sqlx::query(&query).bind(Value::Object(row)).bind(id);
        if unlocked.is_some() {
            q = q.bind(policy.locked_statuses());
        }
        let updated = q.fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        updated.as_ref().map(|r| decode_row(policy, r)).transpose()
    }

    async fn soft_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError> {
        let mut query = format!(
            "UPDATE {} AS target SET \"deleted_at\" = now(), \"updated_at\" = now() \
             WHERE target.\"id\" = $1 AND target.\"deleted_at\" IS NULL",
            ident(&policy.resource_type)?
        );
        let unlocked = unlocked_clause(policy, 2)?;
        if let Some(clause) = &unlocked {
            query.push_str(clause);
        }
        query.push_str(" RETURNING row_to_json(target) AS row");

        let mut q = sqlx::query(&query).bind(id);
        if unlocked.is_some() {
            q = q.bind(policy.locked_statuses());
        }
        let deleted = q.fetch_optional(&self.pool).await?;
        deleted.as_ref().map(|r| decode_row(policy, r)).transpose()
    }

    async fn hard_delete(&self, policy: &ResourcePolicy, id: Uuid) -> Result<bool, StoreError> {
        let mut query = format!(
            "DELETE FROM {} AS target WHERE target.\"id\" = $1",
            ident(&policy.resource_type)?
        );
        let unlocked = unlocked_clause(policy, 2)?;
        if let Some(clause) = &unlocked {
            query.push_str(clause);
        }

        let mut q = sqlx::query(&query).bind(id);
        if unlocked.is_some() {
            q = q.bind(policy.locked_statuses());
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore(&self, policy: &ResourcePolicy, id: Uuid) -> Result<Option<Resource>, StoreError> {
        let query = format!(
            "UPDATE {} AS target SET \"deleted_at\" = NULL, \"updated_at\" = now() \
             WHERE target.\"id\" = $1 AND target.\"deleted_at\" IS NOT NULL \
             RETURNING row_to_json(target) AS row",
            ident(&policy.resource_type)?
        );
        let restored = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        restored.as_ref().map(|r| decode_row(policy, r)).transpose()
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (id, actor_id, actor_role, operation, target_type, target_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.actor_id)
        .bind(entry.actor_role.as_str())
        .bind(entry.operation.as_str())
        .bind(&entry.target_type)
        .bind(entry.target_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
