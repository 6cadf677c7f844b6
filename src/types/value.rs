use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The declared type of an asset-type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldKind {
    Boolean,
    Text,
    Varchar,
    Integer,
    Float,
    Date,
    Relation,
}

impl FieldKind {
    pub fn parse(s: &str) -> Option<FieldKind> {
        match s {
            "BOOLEAN" => Some(Self::Boolean),
            "TEXT" => Some(Self::Text),
            "VARCHAR" => Some(Self::Varchar),
            "INTEGER" => Some(Self::Integer),
            "FLOAT8" => Some(Self::Float),
            "DATE" => Some(Self::Date),
            "RELATION" => Some(Self::Relation),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
            Self::Varchar => "VARCHAR",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT8",
            Self::Date => "DATE",
            Self::Relation => "RELATION",
        }
    }

    /// SQLite column type used when the field is materialized as a column.
    #[must_use]
    pub const fn column_type(self) -> &'static str {
        match self {
            Self::Boolean | Self::Integer => "INTEGER",
            Self::Float => "REAL",
            Self::Text | Self::Varchar | Self::Date | Self::Relation => "TEXT",
        }
    }
}

/// A value carried by one dynamic field of an asset.
///
/// This is a closed variant: every value that enters or leaves the store is
/// checked against the owning asset type's field list, so an asset can never
/// hold a value its schema does not describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Date(DateTime<Utc>),
    AssetRefList(Vec<Uuid>),
    AssetRef(Uuid),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value is acceptable for a field of the given kind.
    /// `Null` is acceptable for any kind; required-ness is checked separately.
    #[must_use]
    pub fn matches_kind(&self, kind: FieldKind, allow_multiple: bool) -> bool {
        match (self, kind) {
            (Self::Null, _) => true,
            (Self::Bool(_), FieldKind::Boolean) => true,
            (Self::Integer(_), FieldKind::Integer) => true,
            (Self::Float(_) | Self::Integer(_), FieldKind::Float) => true,
            (Self::Date(_), FieldKind::Date) => true,
            (Self::Text(_), FieldKind::Text | FieldKind::Varchar) => true,
            (Self::AssetRef(_), FieldKind::Relation) => !allow_multiple,
            (Self::AssetRefList(_), FieldKind::Relation) => allow_multiple,
            _ => false,
        }
    }

    /// The uuids referenced by this value, if it is a relation value.
    #[must_use]
    pub fn referenced_uuids(&self) -> Vec<Uuid> {
        match self {
            Self::AssetRef(u) => vec![*u],
            Self::AssetRefList(us) => us.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Uuid> for FieldValue {
    fn from(u: Uuid) -> Self {
        Self::AssetRef(u)
    }
}
