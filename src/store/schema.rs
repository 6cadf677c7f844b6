pub const SCHEMA: &str = r#"
-- Accounts own grants and sessions
CREATE TABLE IF NOT EXISTS accounts (
    uuid TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    password_hash TEXT NOT NULL,       -- argon2id hash with embedded salt
    api INTEGER NOT NULL DEFAULT 0,    -- API-only account, no interactive login
    deactivated INTEGER NOT NULL DEFAULT 0,
    two_factor_code TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Sessions expire by absolute epoch comparison, no sliding renewal
CREATE TABLE IF NOT EXISTS sessions (
    uuid TEXT PRIMARY KEY,
    subject_uuid TEXT NOT NULL REFERENCES accounts(uuid) ON DELETE CASCADE,
    created TEXT NOT NULL,
    expire TEXT NOT NULL
);

-- Relying-party apps; each declares a permission catalog
CREATE TABLE IF NOT EXISTS apps (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL,        -- first 8 chars of the raw token for fast lookup
    oidc_auth_code_cb TEXT,
    internal INTEGER NOT NULL DEFAULT 0,  -- the platform's own app, created at bootstrap

    -- Health probe state, written by the prober, read from cache
    healthy INTEGER,
    last_probe_at TEXT,

    created_at TEXT DEFAULT (datetime('now'))
);

-- Permission catalog: capabilities an app declares as assignable.
-- type_uuid NULL means root-scoped (global to the app).
CREATE TABLE IF NOT EXISTS permissions (
    app_uuid TEXT NOT NULL REFERENCES apps(uuid) ON DELETE CASCADE,
    type_uuid TEXT,
    permission TEXT NOT NULL
);

-- Grants: the authorization edge from an account to a catalog permission,
-- optionally narrowed to one asset type or one asset.
CREATE TABLE IF NOT EXISTS grants (
    uuid TEXT PRIMARY KEY,
    account_uuid TEXT NOT NULL REFERENCES accounts(uuid) ON DELETE CASCADE,
    app_uuid TEXT NOT NULL REFERENCES apps(uuid) ON DELETE CASCADE,
    permission TEXT NOT NULL,
    type_uuid TEXT,
    asset_uuid TEXT,
    grantable INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);

-- App scopes group apps for OAuth-style scope requests
CREATE TABLE IF NOT EXISTS app_scopes (
    name TEXT PRIMARY KEY,
    description TEXT,
    public INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS app_scope_members (
    scope_name TEXT NOT NULL REFERENCES app_scopes(name) ON DELETE CASCADE,
    app_uuid TEXT NOT NULL REFERENCES apps(uuid) ON DELETE CASCADE,
    PRIMARY KEY (scope_name, app_uuid)
);

-- Asset type registry: logical definitions mapped onto physical tables.
-- physical_table is derived from the uuid so renames never migrate data.
CREATE TABLE IF NOT EXISTS asset_types (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    physical_table TEXT NOT NULL,
    internal INTEGER NOT NULL DEFAULT 0,  -- backs a platform entity, protected
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS asset_type_fields (
    type_uuid TEXT NOT NULL REFERENCES asset_types(uuid) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    required INTEGER NOT NULL DEFAULT 0,
    allow_multiple INTEGER NOT NULL DEFAULT 0,
    target_type_uuid TEXT,
    on_delete TEXT,
    PRIMARY KEY (type_uuid, name)
);

-- Create indexes
CREATE UNIQUE INDEX IF NOT EXISTS idx_permissions_key
    ON permissions(app_uuid, ifnull(type_uuid, ''), permission);
CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_key
    ON grants(account_uuid, app_uuid, permission, ifnull(type_uuid, ''), ifnull(asset_uuid, ''));
CREATE INDEX IF NOT EXISTS idx_grants_account ON grants(account_uuid);
CREATE INDEX IF NOT EXISTS idx_grants_type ON grants(type_uuid);
CREATE INDEX IF NOT EXISTS idx_grants_asset ON grants(asset_uuid);
CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject_uuid);
CREATE INDEX IF NOT EXISTS idx_sessions_expire ON sessions(expire);
CREATE UNIQUE INDEX IF NOT EXISTS idx_apps_lookup ON apps(token_lookup);
CREATE INDEX IF NOT EXISTS idx_fields_target ON asset_type_fields(target_type_uuid);
"#;
