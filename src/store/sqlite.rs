use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|e| {
        tracing::error!("Invalid uuid in database: '{}' - {}", s, e);
        Uuid::nil()
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Converts a field value to its bound SQL form. Many-valued relation
/// values never bind directly; they live in join tables.
fn bind_value(v: &FieldValue) -> Result<Value> {
    Ok(match v {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Integer(i64::from(*b)),
        FieldValue::Integer(n) => Value::Integer(*n),
        FieldValue::Float(f) => Value::Real(*f),
        FieldValue::Date(dt) => Value::Text(format_datetime(dt)),
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::AssetRef(u) => Value::Text(u.to_string()),
        FieldValue::AssetRefList(_) => {
            return Err(Error::Internal(
                "many-valued relation cannot bind as a column value".to_string(),
            ));
        }
    })
}

fn decode_value(kind: FieldKind, vr: ValueRef<'_>) -> FieldValue {
    if matches!(vr, ValueRef::Null) {
        return FieldValue::Null;
    }
    match kind {
        FieldKind::Boolean => match vr.as_i64() {
            Ok(n) => FieldValue::Bool(n != 0),
            Err(_) => FieldValue::Null,
        },
        FieldKind::Integer => match vr.as_i64() {
            Ok(n) => FieldValue::Integer(n),
            Err(_) => FieldValue::Null,
        },
        FieldKind::Float => match vr.as_f64() {
            Ok(f) => FieldValue::Float(f),
            Err(_) => FieldValue::Null,
        },
        FieldKind::Date => match vr.as_str() {
            Ok(s) => FieldValue::Date(parse_datetime(s)),
            Err(_) => FieldValue::Null,
        },
        FieldKind::Text | FieldKind::Varchar => match vr.as_str() {
            Ok(s) => FieldValue::Text(s.to_string()),
            Err(_) => FieldValue::Null,
        },
        FieldKind::Relation => match vr.as_str() {
            Ok(s) => FieldValue::AssetRef(parse_uuid(s)),
            Err(_) => FieldValue::Null,
        },
    }
}

struct GrantRow {
    uuid: String,
    account_uuid: String,
    app_uuid: String,
    permission: String,
    type_uuid: Option<String>,
    asset_uuid: Option<String>,
    grantable: bool,
    created_at: String,
}

fn grant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrantRow> {
    Ok(GrantRow {
        uuid: row.get(0)?,
        account_uuid: row.get(1)?,
        app_uuid: row.get(2)?,
        permission: row.get(3)?,
        type_uuid: row.get(4)?,
        asset_uuid: row.get(5)?,
        grantable: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn into_grant(r: GrantRow) -> Result<Grant> {
    let scope = Scope::from_parts(
        r.type_uuid.as_deref().map(parse_uuid),
        r.asset_uuid.as_deref().map(parse_uuid),
    )?;
    Ok(Grant {
        uuid: parse_uuid(&r.uuid),
        account_uuid: parse_uuid(&r.account_uuid),
        app_uuid: parse_uuid(&r.app_uuid),
        permission: r.permission,
        scope,
        grantable: r.grantable,
        created_at: parse_datetime(&r.created_at),
    })
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        uuid: parse_uuid(&row.get::<_, String>(0)?),
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        api: row.get(4)?,
        deactivated: row.get(5)?,
        two_factor_code: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

fn app_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        uuid: parse_uuid(&row.get::<_, String>(0)?),
        name: row.get(1)?,
        url: row.get(2)?,
        token_hash: row.get(3)?,
        token_lookup: row.get(4)?,
        oidc_auth_code_cb: row.get(5)?,
        internal: row.get(6)?,
        healthy: row.get(7)?,
        last_probe_at: row.get::<_, Option<String>>(8)?.map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn field_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetTypeField> {
    let kind_str: String = row.get(1)?;
    let on_delete: Option<String> = row.get(5)?;
    Ok(AssetTypeField {
        name: row.get(0)?,
        kind: FieldKind::parse(&kind_str).unwrap_or(FieldKind::Text),
        required: row.get(2)?,
        allow_multiple: row.get(3)?,
        target_type: row.get::<_, Option<String>>(4)?.as_deref().map(parse_uuid),
        on_delete: on_delete.as_deref().and_then(IntegrityStrategy::parse),
    })
}

const ACCOUNT_COLS: &str =
    "uuid, username, email, password_hash, api, deactivated, two_factor_code, created_at";
const APP_COLS: &str = "uuid, name, url, token_hash, token_lookup, oidc_auth_code_cb, internal, healthy, last_probe_at, created_at";
const GRANT_COLS: &str =
    "uuid, account_uuid, app_uuid, permission, type_uuid, asset_uuid, grantable, created_at";
const FIELD_COLS: &str = "name, kind, required, allow_multiple, target_type_uuid, on_delete";

impl SqliteStore {
    fn load_fields(conn: &Connection, type_uuid: &str) -> Result<Vec<AssetTypeField>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {FIELD_COLS} FROM asset_type_fields WHERE type_uuid = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![type_uuid], field_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn load_asset_type(conn: &Connection, where_clause: &str, key: &str) -> Result<Option<AssetType>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT uuid, name, physical_table, internal, created_at
                     FROM asset_types WHERE {where_clause}"
                ),
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((uuid, name, physical_table, internal, created_at)) = row else {
            return Ok(None);
        };
        let fields = Self::load_fields(conn, &uuid)?;
        Ok(Some(AssetType {
            uuid: parse_uuid(&uuid),
            name,
            physical_table,
            internal,
            fields,
            created_at: parse_datetime(&created_at),
        }))
    }

    fn insert_fields(
        conn: &Connection,
        type_uuid: &str,
        fields: &[AssetTypeField],
    ) -> Result<()> {
        for f in fields {
            conn.execute(
                "INSERT INTO asset_type_fields
                 (type_uuid, name, kind, required, allow_multiple, target_type_uuid, on_delete)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    type_uuid,
                    f.name,
                    f.kind.as_str(),
                    f.required,
                    f.allow_multiple,
                    f.target_type.map(|u| u.to_string()),
                    f.on_delete.map(IntegrityStrategy::as_str),
                ],
            )?;
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Account operations

    fn create_account(&self, account: &Account) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO accounts (uuid, username, email, password_hash, api, deactivated, two_factor_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                account.uuid.to_string(),
                account.username,
                account.email,
                account.password_hash,
                account.api,
                account.deactivated,
                account.two_factor_code,
                format_datetime(&account.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::Conflict(format!(
                "account '{}' already exists",
                account.username
            ))),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_account(&self, uuid: Uuid) -> Result<Option<Account>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE uuid = ?1"),
            params![uuid.to_string()],
            account_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE username = ?1"),
            params![username],
            account_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {ACCOUNT_COLS} FROM accounts ORDER BY username"))?;
        let rows = stmt.query_map([], account_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_account(&self, account: &Account) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE accounts SET username = ?1, email = ?2, password_hash = ?3, api = ?4,
             deactivated = ?5, two_factor_code = ?6 WHERE uuid = ?7",
            params![
                account.username,
                account.email,
                account.password_hash,
                account.api,
                account.deactivated,
                account.two_factor_code,
                account.uuid.to_string(),
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_account(&self, uuid: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM accounts WHERE uuid = ?1", params![uuid.to_string()])?;
        Ok(rows > 0)
    }

    fn count_accounts(&self) -> Result<i64> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count)
    }

    // Session operations

    fn create_session(&self, session: &Session) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sessions (uuid, subject_uuid, created, expire) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.uuid.to_string(),
                session.subject_uuid.to_string(),
                format_datetime(&session.created),
                format_datetime(&session.expire),
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, uuid: Uuid) -> Result<Option<Session>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT uuid, subject_uuid, created, expire FROM sessions WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| {
                Ok(Session {
                    uuid: parse_uuid(&row.get::<_, String>(0)?),
                    subject_uuid: parse_uuid(&row.get::<_, String>(1)?),
                    created: parse_datetime(&row.get::<_, String>(2)?),
                    expire: parse_datetime(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_account_sessions(&self, subject_uuid: Uuid) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uuid, subject_uuid, created, expire FROM sessions
             WHERE subject_uuid = ?1 ORDER BY created DESC",
        )?;
        let rows = stmt.query_map(params![subject_uuid.to_string()], |row| {
            Ok(Session {
                uuid: parse_uuid(&row.get::<_, String>(0)?),
                subject_uuid: parse_uuid(&row.get::<_, String>(1)?),
                created: parse_datetime(&row.get::<_, String>(2)?),
                expire: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_session(&self, uuid: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM sessions WHERE uuid = ?1", params![uuid.to_string()])?;
        Ok(rows > 0)
    }

    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM sessions WHERE expire <= ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // App operations

    fn create_app(&self, app: &App) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO apps (uuid, name, url, token_hash, token_lookup, oidc_auth_code_cb, internal, healthy, last_probe_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                app.uuid.to_string(),
                app.name,
                app.url,
                app.token_hash,
                app.token_lookup,
                app.oidc_auth_code_cb,
                app.internal,
                app.healthy,
                app.last_probe_at.as_ref().map(format_datetime),
                format_datetime(&app.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(Error::Conflict(format!("app '{}' already exists", app.name)))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_app(&self, uuid: Uuid) -> Result<Option<App>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {APP_COLS} FROM apps WHERE uuid = ?1"),
            params![uuid.to_string()],
            app_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_app_by_name(&self, name: &str) -> Result<Option<App>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {APP_COLS} FROM apps WHERE name = ?1"),
            params![name],
            app_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_app_by_token_lookup(&self, lookup: &str) -> Result<Option<App>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {APP_COLS} FROM apps WHERE token_lookup = ?1"),
            params![lookup],
            app_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_internal_app(&self) -> Result<Option<App>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {APP_COLS} FROM apps WHERE internal = 1"),
            [],
            app_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_apps(&self) -> Result<Vec<App>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {APP_COLS} FROM apps ORDER BY name"))?;
        let rows = stmt.query_map([], app_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_app(&self, app: &App) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE apps SET name = ?1, url = ?2, token_hash = ?3, token_lookup = ?4,
             oidc_auth_code_cb = ?5 WHERE uuid = ?6",
            params![
                app.name,
                app.url,
                app.token_hash,
                app.token_lookup,
                app.oidc_auth_code_cb,
                app.uuid.to_string(),
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_app_health(&self, uuid: Uuid, healthy: bool, at: DateTime<Utc>) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE apps SET healthy = ?1, last_probe_at = ?2 WHERE uuid = ?3",
            params![healthy, format_datetime(&at), uuid.to_string()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_app(&self, uuid: Uuid) -> Result<bool> {
        // Catalog entries, grants and scope memberships cascade via fk.
        let rows = self
            .conn()
            .execute("DELETE FROM apps WHERE uuid = ?1", params![uuid.to_string()])?;
        Ok(rows > 0)
    }

    // Permission catalog operations

    fn list_app_permissions(&self, app_uuid: Uuid) -> Result<Vec<PermissionEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT app_uuid, type_uuid, permission FROM permissions
             WHERE app_uuid = ?1 ORDER BY ifnull(type_uuid, ''), permission",
        )?;
        let rows = stmt.query_map(params![app_uuid.to_string()], |row| {
            Ok(PermissionEntry {
                app_uuid: parse_uuid(&row.get::<_, String>(0)?),
                type_uuid: row.get::<_, Option<String>>(1)?.as_deref().map(parse_uuid),
                permission: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn insert_permission(&self, entry: &PermissionEntry) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO permissions (app_uuid, type_uuid, permission) VALUES (?1, ?2, ?3)",
            params![
                entry.app_uuid.to_string(),
                entry.type_uuid.map(|u| u.to_string()),
                entry.permission,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::Conflict(format!(
                "permission '{}' already declared",
                entry.permission
            ))),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn reconcile_permissions(
        &self,
        app_uuid: Uuid,
        to_delete: &[(Option<Uuid>, String)],
        to_insert: &[PermissionEntry],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let app = app_uuid.to_string();

        for (type_uuid, permission) in to_delete {
            let type_key = type_uuid.map(|u| u.to_string()).unwrap_or_default();
            tx.execute(
                "DELETE FROM permissions
                 WHERE app_uuid = ?1 AND ifnull(type_uuid, '') = ?2 AND permission = ?3",
                params![app, type_key, permission],
            )?;
            // Removing a catalog entry orphans any grant holding the same
            // key; those grants go with it.
            tx.execute(
                "DELETE FROM grants
                 WHERE app_uuid = ?1 AND ifnull(type_uuid, '') = ?2 AND permission = ?3",
                params![app, type_key, permission],
            )?;
        }

        for entry in to_insert {
            tx.execute(
                "INSERT INTO permissions (app_uuid, type_uuid, permission) VALUES (?1, ?2, ?3)",
                params![
                    entry.app_uuid.to_string(),
                    entry.type_uuid.map(|u| u.to_string()),
                    entry.permission,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_permissions_for_type(&self, type_uuid: Uuid) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM permissions WHERE type_uuid = ?1",
            params![type_uuid.to_string()],
        )?;
        Ok(rows)
    }

    // Grant operations

    fn create_grant(&self, grant: &Grant) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO grants (uuid, account_uuid, app_uuid, permission, type_uuid, asset_uuid, grantable, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                grant.uuid.to_string(),
                grant.account_uuid.to_string(),
                grant.app_uuid.to_string(),
                grant.permission,
                grant.scope.type_uuid().map(|u| u.to_string()),
                grant.scope.asset_uuid().map(|u| u.to_string()),
                grant.grantable,
                format_datetime(&grant.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::Conflict(format!(
                "grant for '{}' already exists",
                grant.permission
            ))),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn list_account_grants(&self, account_uuid: Uuid) -> Result<Vec<Grant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLS} FROM grants WHERE account_uuid = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![account_uuid.to_string()], grant_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(into_grant)
            .collect()
    }

    fn list_account_app_grants(&self, account_uuid: Uuid, app_uuid: Uuid) -> Result<Vec<Grant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {GRANT_COLS} FROM grants
             WHERE account_uuid = ?1 AND app_uuid = ?2 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(
            params![account_uuid.to_string(), app_uuid.to_string()],
            grant_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(into_grant)
            .collect()
    }

    fn replace_account_app_grants(
        &self,
        account_uuid: Uuid,
        app_uuid: Uuid,
        to_delete: &[Uuid],
        to_insert: &[Grant],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        for uuid in to_delete {
            tx.execute(
                "DELETE FROM grants WHERE uuid = ?1 AND account_uuid = ?2 AND app_uuid = ?3",
                params![
                    uuid.to_string(),
                    account_uuid.to_string(),
                    app_uuid.to_string()
                ],
            )?;
        }

        for grant in to_insert {
            tx.execute(
                "INSERT INTO grants (uuid, account_uuid, app_uuid, permission, type_uuid, asset_uuid, grantable, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    grant.uuid.to_string(),
                    grant.account_uuid.to_string(),
                    grant.app_uuid.to_string(),
                    grant.permission,
                    grant.scope.type_uuid().map(|u| u.to_string()),
                    grant.scope.asset_uuid().map(|u| u.to_string()),
                    grant.grantable,
                    format_datetime(&grant.created_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_grants_for_type(&self, type_uuid: Uuid) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM grants WHERE type_uuid = ?1",
            params![type_uuid.to_string()],
        )?;
        Ok(rows)
    }

    // App scope operations

    fn upsert_app_scope(&self, scope: &AppScope) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO app_scopes (name, description, public, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (name) DO UPDATE SET
                description = excluded.description,
                public = excluded.public",
            params![
                scope.name,
                scope.description,
                scope.public,
                format_datetime(&scope.created_at),
            ],
        )?;

        tx.execute(
            "DELETE FROM app_scope_members WHERE scope_name = ?1",
            params![scope.name],
        )?;
        for app_uuid in &scope.app_uuids {
            tx.execute(
                "INSERT INTO app_scope_members (scope_name, app_uuid) VALUES (?1, ?2)",
                params![scope.name, app_uuid.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_app_scope(&self, name: &str) -> Result<Option<AppScope>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT name, description, public, created_at FROM app_scopes WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, description, public, created_at)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT app_uuid FROM app_scope_members WHERE scope_name = ?1 ORDER BY app_uuid",
        )?;
        let members = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(AppScope {
            name,
            description,
            public,
            app_uuids: members.iter().map(|s| parse_uuid(s)).collect(),
            created_at: parse_datetime(&created_at),
        }))
    }

    fn list_app_scopes(&self) -> Result<Vec<AppScope>> {
        let names: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT name FROM app_scopes ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut scopes = Vec::with_capacity(names.len());
        for name in names {
            if let Some(scope) = self.get_app_scope(&name)? {
                scopes.push(scope);
            }
        }
        Ok(scopes)
    }

    fn delete_app_scope(&self, name: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM app_scopes WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    // Asset type registry operations

    fn insert_asset_type(&self, asset_type: &AssetType) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let uuid = asset_type.uuid.to_string();

        let result = tx.execute(
            "INSERT INTO asset_types (uuid, name, physical_table, internal, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid,
                asset_type.name,
                asset_type.physical_table,
                asset_type.internal,
                format_datetime(&asset_type.created_at),
            ],
        );
        if let Err(e) = result {
            return if is_constraint_violation(&e) {
                Err(Error::Conflict(format!(
                    "asset type '{}' already exists",
                    asset_type.name
                )))
            } else {
                Err(Error::from(e))
            };
        }

        Self::insert_fields(&tx, &uuid, &asset_type.fields)?;
        tx.commit()?;
        Ok(())
    }

    fn get_asset_type(&self, uuid: Uuid) -> Result<Option<AssetType>> {
        let conn = self.conn();
        Self::load_asset_type(&conn, "uuid = ?1", &uuid.to_string())
    }

    fn get_asset_type_by_name(&self, name: &str) -> Result<Option<AssetType>> {
        let conn = self.conn();
        Self::load_asset_type(&conn, "name = ?1", name)
    }

    fn list_asset_types(&self) -> Result<Vec<AssetType>> {
        let uuids: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT uuid FROM asset_types ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut types = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let conn = self.conn();
            if let Some(t) = Self::load_asset_type(&conn, "uuid = ?1", &uuid)? {
                types.push(t);
            }
        }
        Ok(types)
    }

    fn apply_asset_type_edit(
        &self,
        uuid: Uuid,
        new_name: Option<&str>,
        fields: &[AssetTypeField],
        ddl: &[String],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = uuid.to_string();

        // DDL first; a rejected ALTER rolls the whole edit back.
        for sql in ddl {
            tx.execute_batch(sql)?;
        }

        tx.execute(
            "DELETE FROM asset_type_fields WHERE type_uuid = ?1",
            params![key],
        )?;
        Self::insert_fields(&tx, &key, fields)?;

        if let Some(name) = new_name {
            let result = tx.execute(
                "UPDATE asset_types SET name = ?1 WHERE uuid = ?2",
                params![name, key],
            );
            match result {
                Ok(0) => return Err(Error::NotFound),
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(Error::Conflict(format!(
                        "asset type '{name}' already exists"
                    )));
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn drop_asset_type(&self, uuid: Uuid, drop_sql: &[String]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "DELETE FROM asset_types WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        // Physical tables go last, after all dependent rows are resolved.
        for sql in drop_sql {
            tx.execute_batch(sql)?;
        }

        tx.commit()?;
        Ok(())
    }

    // Dynamic table surface

    fn ddl(&self, sql: &str) -> Result<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    fn exec_dynamic(&self, sql: &str, params: &[FieldValue]) -> Result<usize> {
        let values = params.iter().map(bind_value).collect::<Result<Vec<_>>>()?;
        let result = self.conn().execute(sql, params_from_iter(values));

        match result {
            Ok(rows) => Ok(rows),
            Err(e) if is_constraint_violation(&e) => {
                Err(Error::InvalidInput(format!("constraint violation: {e}")))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn exec_dynamic_batch(&self, stmts: &[(String, Vec<FieldValue>)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        for (sql, params) in stmts {
            let values = params.iter().map(bind_value).collect::<Result<Vec<_>>>()?;
            if let Err(e) = tx.execute(sql, params_from_iter(values)) {
                return if is_constraint_violation(&e) {
                    Err(Error::InvalidInput(format!("constraint violation: {e}")))
                } else {
                    Err(Error::from(e))
                };
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn query_dynamic(
        &self,
        sql: &str,
        params: &[FieldValue],
        cols: &[FieldKind],
    ) -> Result<Vec<Vec<FieldValue>>> {
        let values = params.iter().map(bind_value).collect::<Result<Vec<_>>>()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;

        let rows = stmt.query_map(params_from_iter(values), |row| {
            let mut out = Vec::with_capacity(cols.len());
            for (i, kind) in cols.iter().enumerate() {
                out.push(decode_value(*kind, row.get_ref(i)?));
            }
            Ok(out)
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
