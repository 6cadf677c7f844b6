//! Behavioral contract for `Store` implementations.
//!
//! Every check takes `&dyn Store`, so a new backend gets the whole suite
//! by adding one open function and one test per check.

use chrono::{Duration, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use warden::error::Error;
use warden::store::{SqliteStore, Store};
use warden::types::*;

fn sqlite() -> (TempDir, SqliteStore) {
    let temp = TempDir::new().unwrap();
    let store = SqliteStore::new(temp.path().join("conformance.db")).unwrap();
    store.initialize().unwrap();
    (temp, store)
}

fn account(username: &str) -> Account {
    Account {
        uuid: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        password_hash: String::new(),
        api: false,
        deactivated: false,
        two_factor_code: None,
        created_at: Utc::now(),
    }
}

fn app(name: &str) -> App {
    App {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        url: String::new(),
        token_hash: String::new(),
        token_lookup: Uuid::new_v4().to_string()[..8].to_string(),
        oidc_auth_code_cb: None,
        internal: false,
        healthy: None,
        last_probe_at: None,
        created_at: Utc::now(),
    }
}

fn grant(account_uuid: Uuid, app_uuid: Uuid, permission: &str, scope: Scope) -> Grant {
    Grant {
        uuid: Uuid::new_v4(),
        account_uuid,
        app_uuid,
        permission: permission.to_string(),
        scope,
        grantable: false,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// The checks

fn check_account_username_unique(store: &dyn Store) {
    store.create_account(&account("dup")).unwrap();
    let result = store.create_account(&account("dup"));
    assert!(matches!(result, Err(Error::Conflict(_))));
}

fn check_session_expiry_purge(store: &dyn Store) {
    let a = account("u");
    store.create_account(&a).unwrap();
    let now = Utc::now();
    let expired = Session {
        uuid: Uuid::new_v4(),
        subject_uuid: a.uuid,
        created: now - Duration::hours(2),
        expire: now - Duration::hours(1),
    };
    let live = Session {
        uuid: Uuid::new_v4(),
        subject_uuid: a.uuid,
        created: now,
        expire: now + Duration::hours(1),
    };
    store.create_session(&expired).unwrap();
    store.create_session(&live).unwrap();

    assert_eq!(store.delete_expired_sessions(now).unwrap(), 1);
    assert!(store.get_session(expired.uuid).unwrap().is_none());
    assert!(store.get_session(live.uuid).unwrap().is_some());
}

fn check_app_token_lookup(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();

    let found = store.get_app_by_token_lookup(&a.token_lookup).unwrap().unwrap();
    assert_eq!(found.uuid, a.uuid);
    assert!(store.get_app_by_token_lookup("nope").unwrap().is_none());
}

fn check_permission_key_unique(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();
    let entry = PermissionEntry {
        app_uuid: a.uuid,
        type_uuid: None,
        permission: "read".to_string(),
    };
    store.insert_permission(&entry).unwrap();
    assert!(matches!(
        store.insert_permission(&entry),
        Err(Error::Conflict(_))
    ));

    // The same permission name under a type key is a distinct entry.
    store
        .insert_permission(&PermissionEntry {
            app_uuid: a.uuid,
            type_uuid: Some(Uuid::new_v4()),
            permission: "read".to_string(),
        })
        .unwrap();
}

fn check_permission_reconcile_cascades_grants(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();
    let holder = account("holder");
    store.create_account(&holder).unwrap();

    store
        .insert_permission(&PermissionEntry {
            app_uuid: a.uuid,
            type_uuid: None,
            permission: "write".to_string(),
        })
        .unwrap();
    store
        .create_grant(&grant(holder.uuid, a.uuid, "write", Scope::Global))
        .unwrap();

    store
        .reconcile_permissions(a.uuid, &[(None, "write".to_string())], &[])
        .unwrap();
    assert!(store.list_app_permissions(a.uuid).unwrap().is_empty());
    assert!(store.list_account_app_grants(holder.uuid, a.uuid).unwrap().is_empty());
}

fn check_app_delete_cascades(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();
    let holder = account("holder");
    store.create_account(&holder).unwrap();
    store
        .insert_permission(&PermissionEntry {
            app_uuid: a.uuid,
            type_uuid: None,
            permission: "read".to_string(),
        })
        .unwrap();
    store
        .create_grant(&grant(holder.uuid, a.uuid, "read", Scope::Global))
        .unwrap();

    assert!(store.delete_app(a.uuid).unwrap());
    assert!(store.list_app_permissions(a.uuid).unwrap().is_empty());
    assert!(store.list_account_app_grants(holder.uuid, a.uuid).unwrap().is_empty());
}

fn check_grant_scope_roundtrip(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();
    let holder = account("holder");
    store.create_account(&holder).unwrap();

    let type_uuid = Uuid::new_v4();
    let asset_uuid = Uuid::new_v4();
    for scope in [
        Scope::Global,
        Scope::TypeScoped { type_uuid },
        Scope::AssetScoped {
            type_uuid,
            asset_uuid,
        },
    ] {
        store
            .create_grant(&grant(holder.uuid, a.uuid, "read", scope))
            .unwrap();
    }

    let grants = store.list_account_app_grants(holder.uuid, a.uuid).unwrap();
    assert_eq!(grants.len(), 3);
    assert!(grants.iter().any(|g| g.scope == Scope::Global));
    assert!(grants.iter().any(|g| g.scope == Scope::TypeScoped { type_uuid }));
    assert!(grants.iter().any(|g| g.scope
        == Scope::AssetScoped {
            type_uuid,
            asset_uuid
        }));
}

fn check_replace_grants_is_atomic(store: &dyn Store) {
    let a = app("a");
    store.create_app(&a).unwrap();
    let holder = account("holder");
    store.create_account(&holder).unwrap();

    let existing = grant(holder.uuid, a.uuid, "read", Scope::Global);
    store.create_grant(&existing).unwrap();

    // The insert half collides with the surviving row, so the delete half
    // must roll back with it.
    let dup = grant(holder.uuid, a.uuid, "read", Scope::Global);
    let result = store.replace_account_app_grants(holder.uuid, a.uuid, &[], &[dup]);
    assert!(result.is_err());
    assert_eq!(store.list_account_app_grants(holder.uuid, a.uuid).unwrap().len(), 1);
}

fn check_registry_rename_keeps_table(store: &dyn Store) {
    let uuid = Uuid::new_v4();
    let asset_type = AssetType {
        uuid,
        name: "before".to_string(),
        physical_table: format!("at_{}", uuid.simple()),
        internal: false,
        fields: vec![AssetTypeField {
            name: "title".to_string(),
            kind: FieldKind::Varchar,
            required: true,
            allow_multiple: false,
            target_type: None,
            on_delete: None,
        }],
        created_at: Utc::now(),
    };
    store.insert_asset_type(&asset_type).unwrap();
    store
        .apply_asset_type_edit(uuid, Some("after"), &asset_type.fields, &[])
        .unwrap();

    let loaded = store.get_asset_type(uuid).unwrap().unwrap();
    assert_eq!(loaded.name, "after");
    assert_eq!(loaded.physical_table, asset_type.physical_table);
    assert_eq!(loaded.fields, asset_type.fields);
    assert!(store.get_asset_type_by_name("before").unwrap().is_none());
}

fn check_asset_type_edit_is_atomic(store: &dyn Store) {
    let uuid = Uuid::new_v4();
    let table = format!("at_{}", uuid.simple());
    let asset_type = AssetType {
        uuid,
        name: "journal".to_string(),
        physical_table: table.clone(),
        internal: false,
        fields: vec![AssetTypeField {
            name: "title".to_string(),
            kind: FieldKind::Varchar,
            required: true,
            allow_multiple: false,
            target_type: None,
            on_delete: None,
        }],
        created_at: Utc::now(),
    };
    store.insert_asset_type(&asset_type).unwrap();
    store
        .ddl(&format!(
            "CREATE TABLE \"{table}\" (uuid TEXT PRIMARY KEY, name TEXT NOT NULL, title TEXT)"
        ))
        .unwrap();

    // Second statement fails; the applied ALTER, the field replacement,
    // and the rename must all roll back together.
    let result = store.apply_asset_type_edit(
        uuid,
        Some("renamed"),
        &[],
        &[
            format!("ALTER TABLE \"{table}\" ADD COLUMN extra TEXT"),
            format!("ALTER TABLE \"{table}\" DROP COLUMN no_such_column"),
        ],
    );
    assert!(result.is_err());

    let loaded = store.get_asset_type(uuid).unwrap().unwrap();
    assert_eq!(loaded.name, "journal");
    assert_eq!(loaded.fields, asset_type.fields);
    store
        .exec_dynamic(
            &format!("INSERT INTO \"{table}\" (uuid, name, title) VALUES (?, ?, ?)"),
            &[
                FieldValue::AssetRef(Uuid::new_v4()),
                FieldValue::Text("entry".to_string()),
                FieldValue::Text("t".to_string()),
            ],
        )
        .unwrap();
    let rows = store
        .query_dynamic(&format!("SELECT uuid FROM \"{table}\" WHERE extra IS NULL"), &[], &[
            FieldKind::Relation,
        ]);
    assert!(rows.is_err(), "rolled-back column still present");
}

fn check_dynamic_surface(store: &dyn Store) {
    store
        .ddl("CREATE TABLE dyn_probe (uuid TEXT PRIMARY KEY, n INTEGER)")
        .unwrap();
    let u = Uuid::new_v4();
    store
        .exec_dynamic(
            "INSERT INTO dyn_probe (uuid, n) VALUES (?, ?)",
            &[FieldValue::AssetRef(u), FieldValue::Integer(7)],
        )
        .unwrap();

    let rows = store
        .query_dynamic(
            "SELECT uuid, n FROM dyn_probe",
            &[],
            &[FieldKind::Relation, FieldKind::Integer],
        )
        .unwrap();
    assert_eq!(rows, vec![vec![FieldValue::AssetRef(u), FieldValue::Integer(7)]]);
}

fn check_dynamic_batch_is_atomic(store: &dyn Store) {
    store
        .ddl("CREATE TABLE batch_probe (uuid TEXT PRIMARY KEY)")
        .unwrap();
    let u = Uuid::new_v4();
    let result = store.exec_dynamic_batch(&[
        (
            "INSERT INTO batch_probe (uuid) VALUES (?)".to_string(),
            vec![FieldValue::AssetRef(u)],
        ),
        (
            // Duplicate key fails the whole batch.
            "INSERT INTO batch_probe (uuid) VALUES (?)".to_string(),
            vec![FieldValue::AssetRef(u)],
        ),
    ]);
    assert!(result.is_err());

    let rows = store
        .query_dynamic("SELECT COUNT(*) FROM batch_probe", &[], &[FieldKind::Integer])
        .unwrap();
    assert_eq!(rows[0][0], FieldValue::Integer(0));
}

// ---------------------------------------------------------------------------
// SqliteStore runs the suite

#[test]
fn sqlite_account_username_unique() {
    let (_t, s) = sqlite();
    check_account_username_unique(&s);
}

#[test]
fn sqlite_session_expiry_purge() {
    let (_t, s) = sqlite();
    check_session_expiry_purge(&s);
}

#[test]
fn sqlite_app_token_lookup() {
    let (_t, s) = sqlite();
    check_app_token_lookup(&s);
}

#[test]
fn sqlite_permission_key_unique() {
    let (_t, s) = sqlite();
    check_permission_key_unique(&s);
}

#[test]
fn sqlite_permission_reconcile_cascades_grants() {
    let (_t, s) = sqlite();
    check_permission_reconcile_cascades_grants(&s);
}

#[test]
fn sqlite_app_delete_cascades() {
    let (_t, s) = sqlite();
    check_app_delete_cascades(&s);
}

#[test]
fn sqlite_grant_scope_roundtrip() {
    let (_t, s) = sqlite();
    check_grant_scope_roundtrip(&s);
}

#[test]
fn sqlite_replace_grants_is_atomic() {
    let (_t, s) = sqlite();
    check_replace_grants_is_atomic(&s);
}

#[test]
fn sqlite_registry_rename_keeps_table() {
    let (_t, s) = sqlite();
    check_registry_rename_keeps_table(&s);
}

#[test]
fn sqlite_asset_type_edit_is_atomic() {
    let (_t, s) = sqlite();
    check_asset_type_edit_is_atomic(&s);
}

#[test]
fn sqlite_dynamic_surface() {
    let (_t, s) = sqlite();
    check_dynamic_surface(&s);
}

#[test]
fn sqlite_dynamic_batch_is_atomic() {
    let (_t, s) = sqlite();
    check_dynamic_batch_is_atomic(&s);
}
