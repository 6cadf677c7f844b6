use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The reach of a grant or of an authorization request.
///
/// Explicit tagged variant instead of a sentinel uuid: a grant is either
/// app-global, narrowed to one asset type, or narrowed to one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
    Global,
    TypeScoped { type_uuid: Uuid },
    AssetScoped { type_uuid: Uuid, asset_uuid: Uuid },
}

impl Scope {
    #[must_use]
    pub const fn type_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Global => None,
            Self::TypeScoped { type_uuid } | Self::AssetScoped { type_uuid, .. } => {
                Some(*type_uuid)
            }
        }
    }

    #[must_use]
    pub const fn asset_uuid(&self) -> Option<Uuid> {
        match self {
            Self::AssetScoped { asset_uuid, .. } => Some(*asset_uuid),
            _ => None,
        }
    }

    /// Reconstructs a scope from the two nullable columns it is stored as.
    pub fn from_parts(type_uuid: Option<Uuid>, asset_uuid: Option<Uuid>) -> Result<Scope> {
        match (type_uuid, asset_uuid) {
            (None, None) => Ok(Self::Global),
            (Some(type_uuid), None) => Ok(Self::TypeScoped { type_uuid }),
            (Some(type_uuid), Some(asset_uuid)) => Ok(Self::AssetScoped {
                type_uuid,
                asset_uuid,
            }),
            (None, Some(_)) => Err(Error::Internal(
                "grant has an asset scope without a type scope".to_string(),
            )),
        }
    }

    /// Whether a grant held at this scope covers a request at `requested`.
    ///
    /// Global covers everything in the app; a type scope covers that type
    /// and every asset of it; an asset scope covers only the exact asset.
    #[must_use]
    pub fn covers(&self, requested: &Scope) -> bool {
        match self {
            Self::Global => true,
            Self::TypeScoped { type_uuid } => requested.type_uuid() == Some(*type_uuid),
            Self::AssetScoped { .. } => self == requested,
        }
    }
}
