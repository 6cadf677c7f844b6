mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

/// Store defines the database interface.
///
/// Exactly one production implementation exists (`SqliteStore`); the trait
/// is the extension point for alternative backends, which must pass the
/// conformance suite in `tests/store_conformance.rs`.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Account operations
    fn create_account(&self, account: &Account) -> Result<()>;
    fn get_account(&self, uuid: Uuid) -> Result<Option<Account>>;
    fn get_account_by_username(&self, username: &str) -> Result<Option<Account>>;
    fn list_accounts(&self) -> Result<Vec<Account>>;
    fn update_account(&self, account: &Account) -> Result<()>;
    fn delete_account(&self, uuid: Uuid) -> Result<bool>;
    fn count_accounts(&self) -> Result<i64>;

    // Session operations
    fn create_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, uuid: Uuid) -> Result<Option<Session>>;
    fn list_account_sessions(&self, subject_uuid: Uuid) -> Result<Vec<Session>>;
    fn delete_session(&self, uuid: Uuid) -> Result<bool>;
    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    // App operations
    fn create_app(&self, app: &App) -> Result<()>;
    fn get_app(&self, uuid: Uuid) -> Result<Option<App>>;
    fn get_app_by_name(&self, name: &str) -> Result<Option<App>>;
    fn get_app_by_token_lookup(&self, lookup: &str) -> Result<Option<App>>;
    fn get_internal_app(&self) -> Result<Option<App>>;
    fn list_apps(&self) -> Result<Vec<App>>;
    fn update_app(&self, app: &App) -> Result<()>;
    fn update_app_health(&self, uuid: Uuid, healthy: bool, at: DateTime<Utc>) -> Result<()>;
    fn delete_app(&self, uuid: Uuid) -> Result<bool>;

    // Permission catalog operations
    fn list_app_permissions(&self, app_uuid: Uuid) -> Result<Vec<PermissionEntry>>;
    fn insert_permission(&self, entry: &PermissionEntry) -> Result<()>;
    /// Applies a catalog diff atomically. Deleting a catalog key also
    /// deletes every grant referencing the same key.
    fn reconcile_permissions(
        &self,
        app_uuid: Uuid,
        to_delete: &[(Option<Uuid>, String)],
        to_insert: &[PermissionEntry],
    ) -> Result<()>;
    fn delete_permissions_for_type(&self, type_uuid: Uuid) -> Result<usize>;

    // Grant operations
    fn create_grant(&self, grant: &Grant) -> Result<()>;
    fn list_account_grants(&self, account_uuid: Uuid) -> Result<Vec<Grant>>;
    fn list_account_app_grants(&self, account_uuid: Uuid, app_uuid: Uuid) -> Result<Vec<Grant>>;
    /// Applies a grant-set diff for one account and one app atomically:
    /// all deletes and inserts become visible together or not at all.
    fn replace_account_app_grants(
        &self,
        account_uuid: Uuid,
        app_uuid: Uuid,
        to_delete: &[Uuid],
        to_insert: &[Grant],
    ) -> Result<()>;
    fn delete_grants_for_type(&self, type_uuid: Uuid) -> Result<usize>;

    // App scope operations
    fn upsert_app_scope(&self, scope: &AppScope) -> Result<()>;
    fn get_app_scope(&self, name: &str) -> Result<Option<AppScope>>;
    fn list_app_scopes(&self) -> Result<Vec<AppScope>>;
    fn delete_app_scope(&self, name: &str) -> Result<bool>;

    // Asset type registry operations
    fn insert_asset_type(&self, asset_type: &AssetType) -> Result<()>;
    fn get_asset_type(&self, uuid: Uuid) -> Result<Option<AssetType>>;
    fn get_asset_type_by_name(&self, name: &str) -> Result<Option<AssetType>>;
    fn list_asset_types(&self) -> Result<Vec<AssetType>>;
    /// Applies one structural edit in a single transaction: the planned
    /// DDL, the replacement field set, and the optional rename. A failure
    /// anywhere rolls back the physical changes with the registry.
    fn apply_asset_type_edit(
        &self,
        uuid: Uuid,
        new_name: Option<&str>,
        fields: &[AssetTypeField],
        ddl: &[String],
    ) -> Result<()>;
    /// Removes the registry rows and drops the physical tables in one
    /// transaction. `drop_sql` carries the DROP TABLE statements, executed
    /// last.
    fn drop_asset_type(&self, uuid: Uuid, drop_sql: &[String]) -> Result<()>;

    // Dynamic table surface, used by the schema engine and access layer.
    // Statements are built against the relation map; values travel as the
    // closed FieldValue variant.
    fn ddl(&self, sql: &str) -> Result<()>;
    fn exec_dynamic(&self, sql: &str, params: &[FieldValue]) -> Result<usize>;
    fn exec_dynamic_batch(&self, stmts: &[(String, Vec<FieldValue>)]) -> Result<()>;
    fn query_dynamic(
        &self,
        sql: &str,
        params: &[FieldValue],
        cols: &[FieldKind],
    ) -> Result<Vec<Vec<FieldValue>>>;

    fn close(&self) -> Result<()>;
}
