//! Bounded list queries.
//!
//! [`QueryBuilder::build`] turns loosely typed list parameters into a
//! [`BoundedQuery`]: page and limit resolved and clamped, sort field taken from
//! the policy whitelist, caller filters checked against the filter whitelist
//! and scope filters injected last so callers cannot override them.

pub mod sql;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueryConfig;
use crate::error::{GuardError, GuardResult};
use crate::policy::{ResourcePolicy, SortDirection};

pub use sql::{SqlParam, SqlResult};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Raw list parameters as received from the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub filters: BTreeMap<String, String>,
}

impl ListParams {
    /// Parse a flat query-string map. `page`, `limit`, `sort`, `order`,
    /// `date_from`, `date_to` and `include_deleted` are reserved; every other
    /// key is a filter. Numbers and timestamps must parse, their range is left
    /// to the builder.
    pub fn from_query(query: HashMap<String, String>) -> GuardResult<Self> {
        let mut params = ListParams::default();
        for (key, value) in query {
            match key.as_str() {
                "page" => params.page = Some(parse_number(&key, &value)?),
                "limit" => params.limit = Some(parse_number(&key, &value)?),
                "sort" => params.sort = Some(value),
                "order" => params.order = Some(value),
                "date_from" => params.date_from = Some(parse_timestamp(&key, &value)?),
                "date_to" => params.date_to = Some(parse_timestamp(&key, &value)?),
                "include_deleted" => params.include_deleted = matches!(value.as_str(), "true" | "1"),
                _ => {
                    params.filters.insert(key, value);
                }
            }
        }
        Ok(params)
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: impl Into<String>) -> Self {
        self.sort = Some(field.into());
        self.order = Some(order.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }
}

fn parse_number(key: &str, value: &str) -> GuardResult<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| GuardError::validation(format!("'{}' must be an integer", key)))
}

fn parse_timestamp(key: &str, value: &str) -> GuardResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| GuardError::validation(format!("'{}' must be an RFC 3339 timestamp", key)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Caller-supplied equality filter on a whitelisted column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

/// Inclusive range on the policy's date column; at least one bound is set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub field: String,
    pub gte: Option<DateTime<Utc>>,
    pub lte: Option<DateTime<Utc>>,
}

/// Row restriction derived from the actor, never from caller input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    FieldEquals { field: String, value: Uuid },
    ParticipatedBy { actor_id: Uuid },
}

impl ScopeFilter {
    fn field(&self) -> Option<&str> {
        match self {
            ScopeFilter::FieldEquals { field, .. } => Some(field),
            ScopeFilter::ParticipatedBy { .. } => None,
        }
    }
}

/// A list query with every bound resolved
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedQuery {
    pub resource_type: String,
    pub page: i64,
    pub limit: i64,
    pub sort: SortKey,
    pub filters: Vec<FieldFilter>,
    pub date_range: Option<DateRange>,
    pub scope: Vec<ScopeFilter>,
    /// Exclude rows with `deleted_at` set
    pub live_only: bool,
}

impl BoundedQuery {
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

pub struct QueryBuilder {
    config: QueryConfig,
}

impl QueryBuilder {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn build(
        &self,
        policy: &ResourcePolicy,
        params: ListParams,
        scope: Vec<ScopeFilter>,
    ) -> GuardResult<BoundedQuery> {
        let page = match params.page {
            Some(p) if p > 0 => p,
            _ => DEFAULT_PAGE,
        };

        let limit = match params.limit {
            Some(l) if l > 0 => l,
            _ => self.config.default_limit,
        };
        let limit = if limit > self.config.max_limit {
            tracing::debug!("Limit {} exceeds max {}, capping to max", limit, self.config.max_limit);
            self.config.max_limit
        } else {
            limit
        };

        if (page - 1).checked_mul(limit).is_none() {
            return Err(GuardError::validation(format!("Page {} is out of range", page)));
        }

        let sort_field = match params.sort {
            Some(field) if policy.sort_fields.contains(&field) => field,
            Some(field) => {
                tracing::debug!(
                    "Sort key '{}' not allowed on {}, using '{}'",
                    field, policy.resource_type, policy.default_sort
                );
                policy.default_sort.clone()
            }
            None => policy.default_sort.clone(),
        };
        let direction = params
            .order
            .as_deref()
            .and_then(SortDirection::parse)
            .unwrap_or(policy.default_direction);

        let scoped: Vec<&str> = scope.iter().filter_map(ScopeFilter::field).collect();
        let mut filters = Vec::with_capacity(params.filters.len());
        for (field, value) in params.filters {
            if !policy.filter_fields.contains(&field) && !scoped.contains(&field.as_str()) {
                return Err(GuardError::validation(format!(
                    "Cannot filter {} by '{}'",
                    policy.resource_type, field
                )));
            }
            // Scope wins over any caller value for the same column
            if scoped.contains(&field.as_str()) {
                tracing::debug!("Dropping caller filter on scoped column '{}'", field);
                continue;
            }
            filters.push(FieldFilter { field, value });
        }

        let date_range = if params.date_from.is_some() || params.date_to.is_some() {
            Some(DateRange {
                field: policy.date_field.clone(),
                gte: params.date_from,
                lte: params.date_to,
            })
        } else {
            None
        };

        Ok(BoundedQuery {
            resource_type: policy.resource_type.clone(),
            page,
            limit,
            sort: SortKey { field: sort_field, direction },
            filters,
            date_range,
            scope,
            live_only: policy.has_retention() && !params.include_deleted,
        })
    }
}

/// Pagination block of a list response; `current` and `limit` echo the
/// resolved values, not the caller's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current: i64,
    pub limit: i64,
    pub records: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(current: i64, limit: i64, records: i64) -> Self {
        let pages = if limit > 0 { (records + limit - 1) / limit } else { 0 };
        Self {
            current,
            limit,
            records,
            pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub pagination: Pagination,
    pub data: Vec<T>,
}

impl<T> Paginated<T> {
    pub fn new(query: &BoundedQuery, records: i64, data: Vec<T>) -> Self {
        Self {
            pagination: Pagination::new(query.page, query.limit, records),
            data,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            pagination: self.pagination,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}
