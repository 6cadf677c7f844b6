//! Declarative grant assignment.
//!
//! `set_permissions` replaces an account's grant set for ONE app with the
//! desired set: grants absent from the input are revoked, new ones are
//! created, and everything is validated against the app's catalog before
//! a single row changes. Grants the account holds in other apps are never
//! touched.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{FieldKind, FieldValue, Grant, Scope};

use super::can_delegate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantInput {
    pub permission: String,
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default)]
    pub grantable: bool,
}

/// A desired grant is legal only if the catalog declares its permission at
/// the scope's type (or untyped, for global scopes), and the scoped type
/// and asset actually exist.
fn validate_input(store: &dyn Store, app_uuid: Uuid, input: &GrantInput) -> Result<()> {
    if input.permission.is_empty() {
        return Err(Error::InvalidInput("permission cannot be empty".to_string()));
    }
    let catalog = store.list_app_permissions(app_uuid)?;
    let declared = catalog
        .iter()
        .any(|e| e.permission == input.permission && e.type_uuid == input.scope.type_uuid());
    if !declared {
        return Err(Error::InvalidInput(format!(
            "permission '{}' is not declared by the app at this scope",
            input.permission
        )));
    }

    if let Some(type_uuid) = input.scope.type_uuid() {
        let asset_type = store.get_asset_type(type_uuid)?.ok_or_else(|| {
            Error::InvalidInput(format!("grant references unknown type {type_uuid}"))
        })?;
        if let Some(asset_uuid) = input.scope.asset_uuid() {
            let rows = store.query_dynamic(
                &format!(
                    "SELECT COUNT(*) FROM \"{}\" WHERE uuid = ?",
                    asset_type.physical_table
                ),
                &[FieldValue::AssetRef(asset_uuid)],
                &[FieldKind::Integer],
            )?;
            let found = matches!(
                rows.first().and_then(|r| r.first()),
                Some(FieldValue::Integer(n)) if *n > 0
            );
            if !found {
                return Err(Error::InvalidInput(format!(
                    "grant references unknown '{}' asset {asset_uuid}",
                    asset_type.name
                )));
            }
        }
    }
    Ok(())
}

/// Replaces the account's grants within one app with `desired`. The whole
/// input is validated first; any bad entry fails the call with the stored
/// grants untouched. The replacement itself is one transaction.
pub fn set_permissions(
    store: &dyn Store,
    account_uuid: Uuid,
    app_uuid: Uuid,
    desired: &[GrantInput],
) -> Result<()> {
    store.get_account(account_uuid)?.ok_or(Error::NotFound)?;
    store.get_app(app_uuid)?.ok_or(Error::NotFound)?;

    let mut wanted: HashMap<(String, Scope), bool> = HashMap::new();
    for input in desired {
        validate_input(store, app_uuid, input)?;
        let key = (input.permission.clone(), input.scope);
        if wanted.insert(key, input.grantable).is_some() {
            return Err(Error::Conflict(format!(
                "grant '{}' appears more than once",
                input.permission
            )));
        }
    }

    let current = store.list_account_app_grants(account_uuid, app_uuid)?;

    // A key present on both sides but with a different grantable flag is
    // replaced rather than kept.
    let mut to_delete = Vec::new();
    let mut kept: HashMap<(&str, Scope), ()> = HashMap::new();
    for g in &current {
        match wanted.get(&(g.permission.clone(), g.scope)) {
            Some(grantable) if *grantable == g.grantable => {
                kept.insert((g.permission.as_str(), g.scope), ());
            }
            _ => to_delete.push(g.uuid),
        }
    }
    let to_insert: Vec<Grant> = wanted
        .iter()
        .filter(|((permission, scope), _)| !kept.contains_key(&(permission.as_str(), *scope)))
        .map(|((permission, scope), grantable)| Grant {
            uuid: Uuid::new_v4(),
            account_uuid,
            app_uuid,
            permission: permission.clone(),
            scope: *scope,
            grantable: *grantable,
            created_at: Utc::now(),
        })
        .collect();

    if to_delete.is_empty() && to_insert.is_empty() {
        return Ok(());
    }
    store.replace_account_app_grants(account_uuid, app_uuid, &to_delete, &to_insert)?;
    tracing::info!(
        %account_uuid,
        %app_uuid,
        revoked = to_delete.len(),
        granted = to_insert.len(),
        "replaced account grants"
    );
    Ok(())
}

/// One account passing a grant it holds on to another. The granter must
/// hold a grantable grant covering the delegated scope; the delegated
/// grant is itself non-grantable unless the granter says otherwise.
pub fn delegate(
    store: &dyn Store,
    granter_uuid: Uuid,
    recipient_uuid: Uuid,
    app_uuid: Uuid,
    input: &GrantInput,
) -> Result<Grant> {
    store.get_account(recipient_uuid)?.ok_or(Error::NotFound)?;
    validate_input(store, app_uuid, input)?;

    if !can_delegate(store, granter_uuid, app_uuid, &input.permission, &input.scope)? {
        return Err(Error::Unauthorized);
    }

    let grant = Grant {
        uuid: Uuid::new_v4(),
        account_uuid: recipient_uuid,
        app_uuid,
        permission: input.permission.clone(),
        scope: input.scope,
        grantable: input.grantable,
        created_at: Utc::now(),
    };
    store.create_grant(&grant)?;
    tracing::info!(
        granter = %granter_uuid,
        recipient = %recipient_uuid,
        permission = grant.permission,
        "delegated grant"
    );
    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::catalog::{reconcile_catalog, CatalogEntryInput};
    use crate::store::SqliteStore;
    use crate::types::{Account, App};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    fn seed_account(store: &SqliteStore, username: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        store
            .create_account(&Account {
                uuid,
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password_hash: String::new(),
                api: false,
                deactivated: false,
                two_factor_code: None,
                created_at: Utc::now(),
            })
            .unwrap();
        uuid
    }

    fn seed_app(store: &SqliteStore, permissions: &[&str]) -> Uuid {
        let uuid = Uuid::new_v4();
        store
            .create_app(&App {
                uuid,
                name: format!("app-{uuid}"),
                url: "http://localhost".to_string(),
                token_hash: String::new(),
                token_lookup: uuid.to_string()[..8].to_string(),
                oidc_auth_code_cb: None,
                internal: false,
                healthy: None,
                last_probe_at: None,
                created_at: Utc::now(),
            })
            .unwrap();
        let entries: Vec<CatalogEntryInput> = permissions
            .iter()
            .map(|p| CatalogEntryInput {
                permission: (*p).to_string(),
                type_uuid: None,
            })
            .collect();
        reconcile_catalog(store, uuid, &entries).unwrap();
        uuid
    }

    fn global(permission: &str) -> GrantInput {
        GrantInput {
            permission: permission.to_string(),
            scope: Scope::Global,
            grantable: false,
        }
    }

    #[test]
    fn test_set_permissions_is_declarative() {
        let (_temp, store) = open_store();
        let account = seed_account(&store, "u");
        let app = seed_app(&store, &["read", "write"]);

        set_permissions(&store, account, app, &[global("read"), global("write")]).unwrap();
        assert_eq!(store.list_account_app_grants(account, app).unwrap().len(), 2);

        // Omitting "write" revokes it.
        set_permissions(&store, account, app, &[global("read")]).unwrap();
        let grants = store.list_account_app_grants(account, app).unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].permission, "read");
    }

    #[test]
    fn test_set_permissions_is_idempotent() {
        let (_temp, store) = open_store();
        let account = seed_account(&store, "u");
        let app = seed_app(&store, &["read"]);

        set_permissions(&store, account, app, &[global("read")]).unwrap();
        let before = store.list_account_app_grants(account, app).unwrap();
        set_permissions(&store, account, app, &[global("read")]).unwrap();
        let after = store.list_account_app_grants(account, app).unwrap();

        assert_eq!(before.len(), 1);
        // The surviving grant is the same row, not a recreated one.
        assert_eq!(before[0].uuid, after[0].uuid);
    }

    #[test]
    fn test_other_apps_grants_untouched() {
        let (_temp, store) = open_store();
        let account = seed_account(&store, "u");
        let app_a = seed_app(&store, &["read"]);
        let app_b = seed_app(&store, &["read"]);

        set_permissions(&store, account, app_a, &[global("read")]).unwrap();
        set_permissions(&store, account, app_b, &[global("read")]).unwrap();
        set_permissions(&store, account, app_a, &[]).unwrap();

        assert!(store.list_account_app_grants(account, app_a).unwrap().is_empty());
        assert_eq!(store.list_account_app_grants(account, app_b).unwrap().len(), 1);
    }

    #[test]
    fn test_undeclared_permission_fails_whole_call() {
        let (_temp, store) = open_store();
        let account = seed_account(&store, "u");
        let app = seed_app(&store, &["read"]);
        set_permissions(&store, account, app, &[global("read")]).unwrap();

        let result = set_permissions(&store, account, app, &[global("bogus")]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        // Nothing was revoked by the failed call.
        assert_eq!(store.list_account_app_grants(account, app).unwrap().len(), 1);
    }

    #[test]
    fn test_grantable_change_replaces_grant() {
        let (_temp, store) = open_store();
        let account = seed_account(&store, "u");
        let app = seed_app(&store, &["read"]);

        set_permissions(&store, account, app, &[global("read")]).unwrap();
        set_permissions(
            &store,
            account,
            app,
            &[GrantInput {
                permission: "read".to_string(),
                scope: Scope::Global,
                grantable: true,
            }],
        )
        .unwrap();

        let grants = store.list_account_app_grants(account, app).unwrap();
        assert_eq!(grants.len(), 1);
        assert!(grants[0].grantable);
    }

    #[test]
    fn test_delegate_requires_grantable_grant() {
        let (_temp, store) = open_store();
        let granter = seed_account(&store, "granter");
        let recipient = seed_account(&store, "recipient");
        let app = seed_app(&store, &["read"]);

        set_permissions(&store, granter, app, &[global("read")]).unwrap();
        let result = delegate(&store, granter, recipient, app, &global("read"));
        assert!(matches!(result, Err(Error::Unauthorized)));

        set_permissions(
            &store,
            granter,
            app,
            &[GrantInput {
                permission: "read".to_string(),
                scope: Scope::Global,
                grantable: true,
            }],
        )
        .unwrap();
        let grant = delegate(&store, granter, recipient, app, &global("read")).unwrap();
        assert_eq!(grant.account_uuid, recipient);
        assert!(!grant.grantable);
    }
}
