use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{BoundedQuery, ScopeFilter};
use crate::policy::ResourcePolicy;

/// Typed bind parameter for a rendered query
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Uuid(Uuid),
    Text(String),
    Timestamp(DateTime<Utc>),
    BigInt(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlResult {
    pub query: String,
    pub params: Vec<SqlParam>,
}

/// Quote an identifier that already passed policy validation
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl BoundedQuery {
    /// `SELECT row_to_json(t) AS row ...` for one page, ordered by the sort key
    /// with `id` as tie-break so adjacent pages never overlap.
    pub fn to_sql(&self, policy: &ResourcePolicy) -> SqlResult {
        let (where_clause, mut params) = self.where_sql(policy);
        params.push(SqlParam::BigInt(self.limit));
        params.push(SqlParam::BigInt(self.offset()));

        let query = [
            "SELECT row_to_json(t) AS row".to_string(),
            format!("FROM {} t", quote(&self.resource_type)),
            where_clause,
            format!(
                "ORDER BY t.{} {}, t.\"id\" ASC",
                quote(&self.sort.field),
                self.sort.direction.to_sql()
            ),
            format!("LIMIT ${} OFFSET ${}", params.len() - 1, params.len()),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

        SqlResult { query, params }
    }

    /// Total matching rows, ignoring page and limit
    pub fn to_count_sql(&self, policy: &ResourcePolicy) -> SqlResult {
        let (where_clause, params) = self.where_sql(policy);
        let query = [
            "SELECT COUNT(*) AS count".to_string(),
            format!("FROM {} t", quote(&self.resource_type)),
            where_clause,
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

        SqlResult { query, params }
    }

    fn where_sql(&self, policy: &ResourcePolicy) -> (String, Vec<SqlParam>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if self.live_only {
            conditions.push("t.\"deleted_at\" IS NULL".to_string());
        }

        for scope in &self.scope {
            match scope {
                ScopeFilter::FieldEquals { field, value } => {
                    params.push(SqlParam::Uuid(*value));
                    conditions.push(format!("t.{} = ${}", quote(field), params.len()));
                }
                ScopeFilter::ParticipatedBy { actor_id } => {
                    // A participant scope without a join matches nothing
                    let Some(participation) = &policy.participation else {
                        conditions.push("FALSE".to_string());
                        continue;
                    };
                    let local = match &participation.via_parent {
                        Some(parent) => policy.parent_field(parent).unwrap_or("id"),
                        None => "id",
                    };
                    params.push(SqlParam::Uuid(*actor_id));
                    conditions.push(format!(
                        "t.{} IN (SELECT {} FROM {} WHERE {} = ${})",
                        quote(local),
                        quote(&participation.resource_field),
                        quote(&participation.table),
                        quote(&participation.actor_field),
                        params.len()
                    ));
                }
            }
        }

        for filter in &self.filters {
            params.push(SqlParam::Text(filter.value.clone()));
            conditions.push(format!("t.{}::text = ${}", quote(&filter.field), params.len()));
        }

        if let Some(range) = &self.date_range {
            if let Some(gte) = range.gte {
                params.push(SqlParam::Timestamp(gte));
                conditions.push(format!("t.{} >= ${}", quote(&range.field), params.len()));
            }
            if let Some(lte) = range.lte {
                params.push(SqlParam::Timestamp(lte));
                conditions.push(format!("t.{} <= ${}", quote(&range.field), params.len()));
            }
        }

        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Participation, SortDirection};
    use crate::query::{DateRange, FieldFilter, SortKey};

    fn query() -> BoundedQuery {
        BoundedQuery {
            resource_type: "appointments".into(),
            page: 2,
            limit: 25,
            sort: SortKey {
                field: "starts_at".into(),
                direction: SortDirection::Asc,
            },
            filters: vec![FieldFilter {
                field: "status".into(),
                value: "scheduled".into(),
            }],
            date_range: None,
            scope: vec![],
            live_only: true,
        }
    }

    #[test]
    fn renders_page_query() {
        let owner = Uuid::new_v4();
        let mut q = query();
        q.scope.push(ScopeFilter::FieldEquals {
            field: "patient_id".into(),
            value: owner,
        });
        let policy = ResourcePolicy::new("appointments").owned_by("patient_id");

        let sql = q.to_sql(&policy);
        assert_eq!(
            sql.query,
            "SELECT row_to_json(t) AS row FROM \"appointments\" t \
             WHERE t.\"deleted_at\" IS NULL AND t.\"patient_id\" = $1 AND t.\"status\"::text = $2 \
             ORDER BY t.\"starts_at\" ASC, t.\"id\" ASC LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            sql.params,
            vec![
                SqlParam::Uuid(owner),
                SqlParam::Text("scheduled".into()),
                SqlParam::BigInt(25),
                SqlParam::BigInt(25),
            ]
        );
    }

    #[test]
    fn count_query_has_no_paging() {
        let policy = ResourcePolicy::new("appointments");
        let sql = query().to_count_sql(&policy);
        assert_eq!(
            sql.query,
            "SELECT COUNT(*) AS count FROM \"appointments\" t \
             WHERE t.\"deleted_at\" IS NULL AND t.\"status\"::text = $1"
        );
        assert_eq!(sql.params.len(), 1);
    }

    #[test]
    fn renders_independent_date_bounds() {
        let policy = ResourcePolicy::new("appointments");
        let mut q = query();
        q.filters.clear();
        q.live_only = false;
        let to = Utc::now();
        q.date_range = Some(DateRange {
            field: "created_at".into(),
            gte: None,
            lte: Some(to),
        });

        let sql = q.to_count_sql(&policy);
        assert_eq!(sql.query, "SELECT COUNT(*) AS count FROM \"appointments\" t WHERE t.\"created_at\" <= $1");
        assert_eq!(sql.params, vec![SqlParam::Timestamp(to)]);
    }

    #[test]
    fn renders_participation_subquery() {
        let actor = Uuid::new_v4();
        let policy = ResourcePolicy::new("interviews")
            .with_parent("applications", "application_id")
            .with_participation(Participation {
                table: "interview_participants".into(),
                resource_field: "interview_id".into(),
                actor_field: "recruiter_id".into(),
                via_parent: None,
            });
        let mut q = query();
        q.resource_type = "interviews".into();
        q.filters.clear();
        q.live_only = false;
        q.scope.push(ScopeFilter::ParticipatedBy { actor_id: actor });

        let sql = q.to_count_sql(&policy);
        assert_eq!(
            sql.query,
            "SELECT COUNT(*) AS count FROM \"interviews\" t WHERE t.\"id\" IN \
             (SELECT \"interview_id\" FROM \"interview_participants\" WHERE \"recruiter_id\" = $1)"
        );
    }

    #[test]
    fn quotes_embedded_quotes() {
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
