//! First-run provisioning. Every step checks before it writes, so running
//! bootstrap on an already-provisioned database is a no-op; the persisted
//! state file lets a restart skip straight through.

use chrono::Utc;
use uuid::Uuid;

use crate::auth::SecretHasher;
use crate::config::BootstrapState;
use crate::error::Result;
use crate::store::Store;
use crate::types::{Account, App, Grant, Scope};

use super::catalog::{CatalogEntryInput, reconcile_catalog};
use super::ROOT_PERMISSION;

/// Entity names and the fixed tables backing them. Registered as internal
/// asset types so grants and catalog entries can scope to them. The
/// `asset_type` entry stands for the type registry itself, which is how
/// "may create asset types" is expressed as an ordinary type-scoped grant.
const INTERNAL_TYPES: &[(&str, &str)] = &[
    ("account", "accounts"),
    ("session", "sessions"),
    ("app", "apps"),
    ("permission", "permissions"),
    ("grant", "grants"),
    ("app_scope", "app_scopes"),
    (REGISTRY_TYPE_NAME, "asset_types"),
];

/// The internal type standing for the asset-type registry.
pub const REGISTRY_TYPE_NAME: &str = "asset_type";

/// Schema-change permissions declared against the registry type.
const REGISTRY_PERMISSIONS: &[&str] = &["create_asset", "edit_asset", "delete_asset"];

const INTERNAL_APP_NAME: &str = "warden";
const ADMIN_USERNAME: &str = "admin";

/// Secrets minted during a run. Each is `Some` only the first time it is
/// created; neither is recoverable afterwards.
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub app_uuid: Option<Uuid>,
    pub app_token: Option<String>,
    pub admin_password: Option<String>,
}

pub fn bootstrap(
    store: &dyn Store,
    hasher: &SecretHasher,
    state: &mut BootstrapState,
) -> Result<BootstrapReport> {
    let mut report = BootstrapReport::default();

    ensure_internal_types(store, state)?;
    let app = ensure_internal_app(store, hasher, state, &mut report)?;
    ensure_catalog(store, state, app.uuid)?;
    ensure_admin(store, hasher, state, app.uuid, &mut report)?;

    report.app_uuid = Some(app.uuid);
    Ok(report)
}

fn ensure_internal_types(store: &dyn Store, state: &mut BootstrapState) -> Result<()> {
    for (name, table) in INTERNAL_TYPES {
        if let Some(existing) = store.get_asset_type_by_name(name)? {
            state.internal_types.insert((*name).to_string(), existing.uuid);
            continue;
        }
        let uuid = Uuid::new_v4();
        store.insert_asset_type(&crate::types::AssetType {
            uuid,
            name: (*name).to_string(),
            physical_table: (*table).to_string(),
            internal: true,
            fields: Vec::new(),
            created_at: Utc::now(),
        })?;
        state.internal_types.insert((*name).to_string(), uuid);
        tracing::info!(name, "registered internal asset type");
    }
    Ok(())
}

fn ensure_internal_app(
    store: &dyn Store,
    hasher: &SecretHasher,
    state: &mut BootstrapState,
    report: &mut BootstrapReport,
) -> Result<App> {
    if let Some(app) = store.get_internal_app()? {
        state.app_uuid = Some(app.uuid);
        return Ok(app);
    }

    let minted = hasher.mint_token()?;
    let app = App {
        uuid: Uuid::new_v4(),
        name: INTERNAL_APP_NAME.to_string(),
        url: String::new(),
        token_hash: minted.hash,
        token_lookup: minted.lookup,
        oidc_auth_code_cb: None,
        internal: true,
        healthy: None,
        last_probe_at: None,
        created_at: Utc::now(),
    };
    store.create_app(&app)?;
    state.app_uuid = Some(app.uuid);
    report.app_token = Some(minted.raw);
    tracing::info!(%app.uuid, "created internal app");
    Ok(app)
}

/// The internal app's catalog: root, one management permission per
/// internal entity, and the schema-change permissions scoped to the
/// registry type.
fn ensure_catalog(store: &dyn Store, state: &BootstrapState, app_uuid: Uuid) -> Result<()> {
    let mut entries = vec![CatalogEntryInput {
        permission: ROOT_PERMISSION.to_string(),
        type_uuid: None,
    }];
    for (name, _) in INTERNAL_TYPES {
        if let Some(type_uuid) = state.internal_types.get(*name) {
            entries.push(CatalogEntryInput {
                permission: "manage".to_string(),
                type_uuid: Some(*type_uuid),
            });
        }
    }
    if let Some(registry) = state.internal_types.get(REGISTRY_TYPE_NAME) {
        for permission in REGISTRY_PERMISSIONS {
            entries.push(CatalogEntryInput {
                permission: (*permission).to_string(),
                type_uuid: Some(*registry),
            });
        }
    }
    reconcile_catalog(store, app_uuid, &entries)?;
    Ok(())
}

fn ensure_admin(
    store: &dyn Store,
    hasher: &SecretHasher,
    state: &mut BootstrapState,
    app_uuid: Uuid,
    report: &mut BootstrapReport,
) -> Result<()> {
    if state.admin_created || store.count_accounts()? > 0 {
        state.admin_created = true;
        return Ok(());
    }

    let password = generate_password();
    let account = Account {
        uuid: Uuid::new_v4(),
        username: ADMIN_USERNAME.to_string(),
        email: String::new(),
        password_hash: hasher.hash(&password)?,
        api: false,
        deactivated: false,
        two_factor_code: None,
        created_at: Utc::now(),
    };
    store.create_account(&account)?;
    store.create_grant(&Grant {
        uuid: Uuid::new_v4(),
        account_uuid: account.uuid,
        app_uuid,
        permission: ROOT_PERMISSION.to_string(),
        scope: Scope::Global,
        grantable: true,
        created_at: Utc::now(),
    })?;
    if let Some(registry) = state.internal_types.get(REGISTRY_TYPE_NAME) {
        store.create_grant(&Grant {
            uuid: Uuid::new_v4(),
            account_uuid: account.uuid,
            app_uuid,
            permission: "create_asset".to_string(),
            scope: Scope::TypeScoped { type_uuid: *registry },
            grantable: true,
            created_at: Utc::now(),
        })?;
    }

    state.admin_created = true;
    report.admin_password = Some(password);
    tracing::info!(username = ADMIN_USERNAME, "created default admin account");
    Ok(())
}

fn generate_password() -> String {
    crate::auth::random_alphanumeric(20)
}
