use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FieldKind, FieldValue, Scope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub uuid: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    /// API-only account (no interactive login).
    pub api: bool,
    pub deactivated: bool,
    #[serde(skip)]
    pub two_factor_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub uuid: Uuid,
    pub subject_uuid: Uuid,
    pub created: DateTime<Utc>,
    pub expire: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub uuid: Uuid,
    pub name: String,
    pub url: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc_auth_code_cb: Option<String>,
    /// The platform's own app, created at bootstrap. Cannot be deleted.
    pub internal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One entry of an app's permission catalog: a capability the app declares
/// as assignable, optionally scoped to one asset type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub app_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_uuid: Option<Uuid>,
    pub permission: String,
}

/// An authorization edge from an account to a catalog permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub uuid: Uuid,
    pub account_uuid: Uuid,
    pub app_uuid: Uuid,
    pub permission: String,
    #[serde(flatten)]
    pub scope: Scope,
    /// Whether the holder may re-delegate this grant to other accounts.
    pub grantable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppScope {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub public: bool,
    pub app_uuids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityStrategy {
    Cascade,
    SetNull,
    Restrict,
    Invalidate,
}

impl IntegrityStrategy {
    pub fn parse(s: &str) -> Option<IntegrityStrategy> {
        match s {
            "CASCADE" => Some(Self::Cascade),
            "SET_NULL" => Some(Self::SetNull),
            "RESTRICT" => Some(Self::Restrict),
            "INVALIDATE" => Some(Self::Invalidate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET_NULL",
            Self::Restrict => "RESTRICT",
            Self::Invalidate => "INVALIDATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTypeField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub allow_multiple: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<IntegrityStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetType {
    pub uuid: Uuid,
    pub name: String,
    /// Physical table backing this type; derived from the uuid, never from
    /// the name, so renames never require migration.
    #[serde(skip)]
    pub physical_table: String,
    /// Internal types back the platform's own entities and cannot be
    /// deleted or renamed.
    pub internal: bool,
    pub fields: Vec<AssetTypeField>,
    pub created_at: DateTime<Utc>,
}

impl AssetType {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&AssetTypeField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// An instance of an asset type. Relation fields resolve into `relations`
/// only when a query explicitly includes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub uuid: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub relations: BTreeMap<String, Vec<Asset>>,
}

/// Read-only snapshot of every asset type, suitable for client-binding
/// generators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogExport {
    pub generated_at: DateTime<Utc>,
    pub types: Vec<AssetType>,
}
