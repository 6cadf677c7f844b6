use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::FieldValue;

/// A comparison applied to one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(FieldValue),
    In(Vec<FieldValue>),
    Lt(FieldValue),
    Gt(FieldValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

/// A filter is either a conjunction of conditions or a disjunction of
/// conjunctions. Nothing deeper; callers that need more do two queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All(Vec<Condition>),
    Any(Vec<Vec<Condition>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

/// One relation to resolve alongside the main rows. `field` is either a
/// forward relation field of the queried type, or `"TypeName.field"` to
/// follow a relation backwards from the type that declares it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Include {
    pub field: String,
    #[serde(default)]
    pub nested: Vec<Include>,
}

impl Include {
    pub fn new(field: impl Into<String>) -> Include {
        Include {
            field: field.into(),
            nested: Vec::new(),
        }
    }
}

/// Filters results down to what one account may see through one app.
/// With `recursive` set, included assets are filtered too; otherwise an
/// included asset rides along with its visible parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub account_uuid: Uuid,
    pub app_uuid: Uuid,
    pub permission: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filter: Option<Filter>,
    /// Applied left to right as a compound sort key.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sort: Vec<(String, SortDir)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub includes: Vec<Include>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub authorization: Option<Authorization>,
}

impl Query {
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Query {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, dir: SortDir) -> Query {
        self.sort.push((field.into(), dir));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Query {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u32) -> Query {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn include(mut self, include: Include) -> Query {
        self.includes.push(include);
        self
    }

    #[must_use]
    pub fn authorized(mut self, authorization: Authorization) -> Query {
        self.authorization = Some(authorization);
        self
    }
}
