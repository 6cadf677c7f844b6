//! The top-level handle tying the store, caches, and engines together.
//!
//! `Platform` owns the relation-map cache: every data operation reads the
//! schema through it, and every schema mutation invalidates it, so a
//! caller observing a schema change is guaranteed a rebuilt map on its
//! next read rather than a stale one.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{self, SecretHasher};
use crate::authz::{self, bootstrap::BootstrapReport, catalog::CatalogEntryInput,
    catalog::CatalogDiff, grants::GrantInput};
use crate::cache::{Coalesced, CoalescedMap};
use crate::config::{BootstrapState, PlatformConfig};
use crate::data::{self, Authorization, Include, Query, RelationMap};
use crate::error::{Error, Result};
use crate::health::{AppHealth, HealthMonitor};
use crate::schema::{self, FieldUpdate, NewField};
use crate::store::{SqliteStore, Store};
use crate::types::*;

pub struct Platform {
    store: Arc<dyn Store>,
    config: PlatformConfig,
    hasher: SecretHasher,
    schema_cache: Coalesced<Arc<RelationMap>>,
    app_cache: CoalescedMap<String, App>,
    health: HealthMonitor,
}

impl Platform {
    /// Opens (or creates) the database under the configured data dir,
    /// provisions anything missing, and returns the handle plus whatever
    /// secrets bootstrap minted on this run.
    pub fn open(config: PlatformConfig) -> Result<(Platform, BootstrapReport)> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = SqliteStore::new(config.db_path())?;
        store.initialize()?;
        Self::with_store(Arc::new(store), config)
    }

    /// Like `open` but over a caller-supplied store. Used by tests and by
    /// deployments bringing their own backend.
    pub fn with_store(
        store: Arc<dyn Store>,
        config: PlatformConfig,
    ) -> Result<(Platform, BootstrapReport)> {
        let hasher = SecretHasher::new();

        let mut state = BootstrapState::load(&config.state_path())?;
        let report = authz::bootstrap::bootstrap(store.as_ref(), &hasher, &mut state)?;
        state.save(&config.state_path())?;

        let health = HealthMonitor::new(
            store.clone(),
            config.probe_timeout(),
            config.health_cache_ttl(),
        )?;
        let platform = Platform {
            schema_cache: Coalesced::new(Some(config.schema_cache_ttl())),
            app_cache: CoalescedMap::new(None),
            health,
            store,
            config,
            hasher,
        };
        Ok((platform, report))
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// The current relation map. Concurrent callers behind a stale cache
    /// share one rebuild.
    pub async fn relation_map(&self) -> Result<Arc<RelationMap>> {
        self.schema_cache
            .get_or_refresh(|| async {
                let types = self.store.list_asset_types()?;
                Ok(Arc::new(RelationMap::build(types)))
            })
            .await
    }

    // -----------------------------------------------------------------
    // Schema

    pub async fn create_asset_type(&self, name: &str, fields: &[NewField]) -> Result<AssetType> {
        let created = schema::create_asset_type(self.store.as_ref(), name, fields)?;
        self.schema_cache.invalidate();
        Ok(created)
    }

    pub async fn edit_asset_type(
        &self,
        uuid: Uuid,
        new_name: &str,
        updates: &[FieldUpdate],
    ) -> Result<AssetType> {
        let edited = schema::edit_asset_type(self.store.as_ref(), uuid, new_name, updates)?;
        self.schema_cache.invalidate();
        Ok(edited)
    }

    pub async fn delete_asset_type(&self, uuid: Uuid) -> Result<()> {
        schema::delete_asset_type(self.store.as_ref(), uuid)?;
        self.schema_cache.invalidate();
        Ok(())
    }

    pub fn get_asset_type(&self, uuid: Uuid) -> Result<Option<AssetType>> {
        self.store.get_asset_type(uuid)
    }

    pub fn get_asset_type_by_name(&self, name: &str) -> Result<Option<AssetType>> {
        self.store.get_asset_type_by_name(name)
    }

    pub fn list_asset_types(&self) -> Result<Vec<AssetType>> {
        self.store.list_asset_types()
    }

    pub fn export_catalog(&self) -> Result<CatalogExport> {
        schema::export_catalog(self.store.as_ref())
    }

    // -----------------------------------------------------------------
    // Data access

    pub async fn find_one(
        &self,
        type_uuid: Uuid,
        asset_uuid: Uuid,
        includes: &[Include],
        authorization: Option<&Authorization>,
    ) -> Result<Option<Asset>> {
        let map = self.relation_map().await?;
        data::find_one(
            self.store.as_ref(),
            &map,
            type_uuid,
            asset_uuid,
            includes,
            authorization,
        )
    }

    pub async fn find_many(&self, type_uuid: Uuid, query: &Query) -> Result<Vec<Asset>> {
        let map = self.relation_map().await?;
        data::find_many(self.store.as_ref(), &map, type_uuid, query)
    }

    pub async fn create_one(
        &self,
        type_uuid: Uuid,
        name: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Asset> {
        let map = self.relation_map().await?;
        data::create_one(self.store.as_ref(), &map, type_uuid, name, fields)
    }

    pub async fn create_many(
        &self,
        type_uuid: Uuid,
        inputs: &[(String, BTreeMap<String, FieldValue>)],
    ) -> Result<Vec<Asset>> {
        let map = self.relation_map().await?;
        data::create_many(self.store.as_ref(), &map, type_uuid, inputs)
    }

    pub async fn update_one(
        &self,
        type_uuid: Uuid,
        asset_uuid: Uuid,
        name: Option<&str>,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Asset> {
        let map = self.relation_map().await?;
        data::update_one(self.store.as_ref(), &map, type_uuid, asset_uuid, name, fields)
    }

    pub async fn update_many(
        &self,
        type_uuid: Uuid,
        asset_uuids: &[Uuid],
        name: Option<&str>,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Vec<Asset>> {
        let map = self.relation_map().await?;
        data::update_many(self.store.as_ref(), &map, type_uuid, asset_uuids, name, fields)
    }

    pub async fn delete_one(&self, type_uuid: Uuid, asset_uuid: Uuid) -> Result<()> {
        let map = self.relation_map().await?;
        data::delete_one(self.store.as_ref(), &map, type_uuid, asset_uuid)
    }

    pub async fn delete_many(&self, type_uuid: Uuid, asset_uuids: &[Uuid]) -> Result<()> {
        let map = self.relation_map().await?;
        data::delete_many(self.store.as_ref(), &map, type_uuid, asset_uuids)
    }

    // -----------------------------------------------------------------
    // Authorization

    pub fn can_act(
        &self,
        account_uuid: Uuid,
        app_uuid: Uuid,
        permission: &str,
        scope: &Scope,
    ) -> Result<bool> {
        authz::can_act(self.store.as_ref(), account_uuid, app_uuid, permission, scope)
    }

    pub fn reconcile_catalog(
        &self,
        app_uuid: Uuid,
        desired: &[CatalogEntryInput],
    ) -> Result<CatalogDiff> {
        authz::catalog::reconcile_catalog(self.store.as_ref(), app_uuid, desired)
    }

    pub fn list_app_permissions(&self, app_uuid: Uuid) -> Result<Vec<PermissionEntry>> {
        self.store.list_app_permissions(app_uuid)
    }

    pub fn set_permissions(
        &self,
        account_uuid: Uuid,
        app_uuid: Uuid,
        desired: &[GrantInput],
    ) -> Result<()> {
        authz::grants::set_permissions(self.store.as_ref(), account_uuid, app_uuid, desired)
    }

    pub fn delegate(
        &self,
        granter_uuid: Uuid,
        recipient_uuid: Uuid,
        app_uuid: Uuid,
        input: &GrantInput,
    ) -> Result<Grant> {
        authz::grants::delegate(self.store.as_ref(), granter_uuid, recipient_uuid, app_uuid, input)
    }

    pub fn list_grants(&self, account_uuid: Uuid) -> Result<Vec<Grant>> {
        self.store.list_account_grants(account_uuid)
    }

    // -----------------------------------------------------------------
    // Accounts and sessions

    pub fn create_account(&self, username: &str, email: &str, password: &str) -> Result<Account> {
        if username.is_empty() {
            return Err(Error::InvalidInput("username cannot be empty".to_string()));
        }
        let account = Account {
            uuid: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: self.hasher.hash(password)?,
            api: false,
            deactivated: false,
            two_factor_code: None,
            created_at: chrono::Utc::now(),
        };
        self.store.create_account(&account)?;
        Ok(account)
    }

    pub fn get_account(&self, uuid: Uuid) -> Result<Option<Account>> {
        self.store.get_account(uuid)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts()
    }

    pub fn deactivate_account(&self, uuid: Uuid) -> Result<()> {
        let mut account = self.store.get_account(uuid)?.ok_or(Error::NotFound)?;
        account.deactivated = true;
        self.store.update_account(&account)
    }

    /// Password login. Wrong credentials and deactivated accounts both
    /// come back as `Unauthorized`; the caller cannot tell which.
    pub fn login(&self, username: &str, password: &str) -> Result<Session> {
        let account = self
            .store
            .get_account_by_username(username)?
            .ok_or(Error::Unauthorized)?;
        if !self.hasher.verify(password, &account.password_hash)? {
            return Err(Error::Unauthorized);
        }
        auth::issue_session(self.store.as_ref(), account.uuid, self.config.session_ttl_secs)
    }

    pub fn authenticate_session(&self, session_uuid: Uuid) -> Result<Session> {
        auth::authenticate_session(self.store.as_ref(), session_uuid)
    }

    pub fn revoke_session(&self, session_uuid: Uuid) -> Result<()> {
        auth::revoke_session(self.store.as_ref(), session_uuid)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        auth::purge_expired_sessions(self.store.as_ref())
    }

    // -----------------------------------------------------------------
    // Apps

    /// Registers an app and returns it with its raw token. The token is
    /// only stored hashed; this is the one chance to read it.
    pub fn create_app(&self, name: &str, url: &str) -> Result<(App, String)> {
        if name.is_empty() {
            return Err(Error::InvalidInput("app name cannot be empty".to_string()));
        }
        let minted = self.hasher.mint_token()?;
        let app = App {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            token_hash: minted.hash,
            token_lookup: minted.lookup,
            oidc_auth_code_cb: None,
            internal: false,
            healthy: None,
            last_probe_at: None,
            created_at: chrono::Utc::now(),
        };
        self.store.create_app(&app)?;
        Ok((app, minted.raw))
    }

    pub fn get_app(&self, uuid: Uuid) -> Result<Option<App>> {
        self.store.get_app(uuid)
    }

    pub fn list_apps(&self) -> Result<Vec<App>> {
        self.store.list_apps()
    }

    pub fn delete_app(&self, uuid: Uuid) -> Result<()> {
        let app = self.store.get_app(uuid)?.ok_or(Error::NotFound)?;
        if app.internal {
            return Err(Error::Conflict(
                "the internal app cannot be deleted".to_string(),
            ));
        }
        self.store.delete_app(uuid)?;
        self.app_cache.invalidate(&app.token_lookup);
        Ok(())
    }

    /// Resolves an app token to its app. The lookup-to-app step is cached
    /// behind coalesced cells; the hash verification runs every time.
    pub async fn authenticate_app(&self, token: &str) -> Result<App> {
        let (lookup, _secret) = auth::parse_token(token)?;
        let cell = self.app_cache.cell(&lookup);
        let app = cell
            .get_or_refresh(|| async {
                self.store
                    .get_app_by_token_lookup(&lookup)?
                    .ok_or(Error::Unauthorized)
            })
            .await?;
        if !self.hasher.verify(token, &app.token_hash)? {
            return Err(Error::Unauthorized);
        }
        Ok(app)
    }

    pub async fn app_health(&self, app_uuid: Uuid) -> Result<AppHealth> {
        self.health.check(app_uuid).await
    }

    pub async fn all_app_health(&self) -> Result<Vec<AppHealth>> {
        self.health.check_all().await
    }

    // -----------------------------------------------------------------
    // App scopes

    pub fn upsert_app_scope(&self, scope: &AppScope) -> Result<()> {
        if scope.name.is_empty() {
            return Err(Error::InvalidInput("scope name cannot be empty".to_string()));
        }
        for app_uuid in &scope.app_uuids {
            self.store.get_app(*app_uuid)?.ok_or(Error::NotFound)?;
        }
        self.store.upsert_app_scope(scope)
    }

    pub fn get_app_scope(&self, name: &str) -> Result<Option<AppScope>> {
        self.store.get_app_scope(name)
    }

    pub fn list_app_scopes(&self) -> Result<Vec<AppScope>> {
        self.store.list_app_scopes()
    }

    pub fn delete_app_scope(&self, name: &str) -> Result<()> {
        if !self.store.delete_app_scope(name)? {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}
