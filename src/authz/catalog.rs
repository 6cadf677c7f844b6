//! Declarative reconciliation of an app's permission catalog.
//!
//! Apps re-announce their full catalog at startup; the platform diffs it
//! against what is stored. Entries that disappear take every grant that
//! depended on them down with them, in the same transaction, so a grant
//! can never outlive its catalog entry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::PermissionEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntryInput {
    pub permission: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub type_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: usize,
    pub removed: usize,
}

pub fn reconcile_catalog(
    store: &dyn Store,
    app_uuid: Uuid,
    desired: &[CatalogEntryInput],
) -> Result<CatalogDiff> {
    let app = store.get_app(app_uuid)?.ok_or(Error::NotFound)?;

    let mut keys: HashSet<(Option<Uuid>, &str)> = HashSet::new();
    for entry in desired {
        if entry.permission.is_empty() {
            return Err(Error::InvalidInput("permission cannot be empty".to_string()));
        }
        if !keys.insert((entry.type_uuid, entry.permission.as_str())) {
            return Err(Error::Conflict(format!(
                "duplicate catalog entry '{}'",
                entry.permission
            )));
        }
        if let Some(type_uuid) = entry.type_uuid {
            if store.get_asset_type(type_uuid)?.is_none() {
                return Err(Error::InvalidInput(format!(
                    "catalog entry '{}' references unknown type {type_uuid}",
                    entry.permission
                )));
            }
        }
    }

    let current = store.list_app_permissions(app_uuid)?;
    let current_keys: HashSet<(Option<Uuid>, &str)> = current
        .iter()
        .map(|e| (e.type_uuid, e.permission.as_str()))
        .collect();

    let to_delete: Vec<(Option<Uuid>, String)> = current
        .iter()
        .filter(|e| !keys.contains(&(e.type_uuid, e.permission.as_str())))
        .map(|e| (e.type_uuid, e.permission.clone()))
        .collect();
    let to_insert: Vec<PermissionEntry> = desired
        .iter()
        .filter(|e| !current_keys.contains(&(e.type_uuid, e.permission.as_str())))
        .map(|e| PermissionEntry {
            app_uuid,
            type_uuid: e.type_uuid,
            permission: e.permission.clone(),
        })
        .collect();

    let diff = CatalogDiff {
        added: to_insert.len(),
        removed: to_delete.len(),
    };
    if diff == CatalogDiff::default() {
        return Ok(diff);
    }
    store.reconcile_permissions(app_uuid, &to_delete, &to_insert)?;
    tracing::info!(
        app = app.name,
        added = diff.added,
        removed = diff.removed,
        "reconciled permission catalog"
    );
    Ok(diff)
}
