//! Grant evaluation, catalog reconciliation, and platform bootstrap.

pub mod bootstrap;
pub mod catalog;
pub mod grants;

use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::types::{Grant, Scope};

/// The all-access permission. A grant of this permission covers every
/// permission of its app at its scope.
pub const ROOT_PERMISSION: &str = "root";

fn matching<'a>(
    grants: &'a [Grant],
    permission: &'a str,
    scope: &'a Scope,
) -> impl Iterator<Item = &'a Grant> {
    grants.iter().filter(move |g| {
        (g.permission == permission || g.permission == ROOT_PERMISSION) && g.scope.covers(scope)
    })
}

/// Whether the account may exercise `permission` at `scope` within the app.
pub fn can_act(
    store: &dyn Store,
    account_uuid: Uuid,
    app_uuid: Uuid,
    permission: &str,
    scope: &Scope,
) -> Result<bool> {
    let grants = store.list_account_app_grants(account_uuid, app_uuid)?;
    Ok(matching(&grants, permission, scope).next().is_some())
}

/// Whether the account may pass `permission` at `scope` on to another
/// account. Requires a covering grant that is itself marked grantable.
pub fn can_delegate(
    store: &dyn Store,
    account_uuid: Uuid,
    app_uuid: Uuid,
    permission: &str,
    scope: &Scope,
) -> Result<bool> {
    let grants = store.list_account_app_grants(account_uuid, app_uuid)?;
    Ok(matching(&grants, permission, scope).any(|g| g.grantable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{Account, App};
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    fn seed_account(store: &SqliteStore) -> Uuid {
        let uuid = Uuid::new_v4();
        store
            .create_account(&Account {
                uuid,
                username: format!("u-{uuid}"),
                email: format!("u-{uuid}@example.com"),
                password_hash: String::new(),
                api: false,
                deactivated: false,
                two_factor_code: None,
                created_at: Utc::now(),
            })
            .unwrap();
        uuid
    }

    fn seed_app(store: &SqliteStore) -> Uuid {
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
        uuid
    }

    fn seed_grant(store: &SqliteStore, account: Uuid, app: Uuid, permission: &str, scope: Scope, grantable: bool) {
        store
            .create_grant(&Grant {
                uuid: Uuid::new_v4(),
                account_uuid: account,
                app_uuid: app,
                permission: permission.to_string(),
                scope,
                grantable,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn test_root_covers_any_permission() {
        let (_temp, store) = open_store();
        let account = seed_account(&store);
        let app = seed_app(&store);
        seed_grant(&store, account, app, ROOT_PERMISSION, Scope::Global, false);

        assert!(can_act(&store, account, app, "anything", &Scope::Global).unwrap());
        assert!(can_act(
            &store,
            account,
            app,
            "read",
            &Scope::TypeScoped {
                type_uuid: Uuid::new_v4()
            }
        )
        .unwrap());
    }

    #[test]
    fn test_type_grant_does_not_reach_other_types() {
        let (_temp, store) = open_store();
        let account = seed_account(&store);
        let app = seed_app(&store);
        let t = Uuid::new_v4();
        seed_grant(&store, account, app, "read", Scope::TypeScoped { type_uuid: t }, false);

        assert!(can_act(&store, account, app, "read", &Scope::TypeScoped { type_uuid: t }).unwrap());
        assert!(!can_act(
            &store,
            account,
            app,
            "read",
            &Scope::TypeScoped {
                type_uuid: Uuid::new_v4()
            }
        )
        .unwrap());
        assert!(!can_act(&store, account, app, "write", &Scope::TypeScoped { type_uuid: t }).unwrap());
    }

    #[test]
    fn test_delegation_needs_grantable() {
        let (_temp, store) = open_store();
        let account = seed_account(&store);
        let app = seed_app(&store);
        seed_grant(&store, account, app, "read", Scope::Global, false);
        seed_grant(&store, account, app, "write", Scope::Global, true);

        assert!(!can_delegate(&store, account, app, "read", &Scope::Global).unwrap());
        assert!(can_delegate(&store, account, app, "write", &Scope::Global).unwrap());
    }

    #[test]
    fn test_grants_do_not_cross_apps() {
        let (_temp, store) = open_store();
        let account = seed_account(&store);
        let app_a = seed_app(&store);
        let app_b = seed_app(&store);
        seed_grant(&store, account, app_a, "read", Scope::Global, false);

        assert!(!can_act(&store, account, app_b, "read", &Scope::Global).unwrap());
    }
}
