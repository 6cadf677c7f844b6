//! Schema materialization: maps logical asset-type definitions onto
//! physical tables and performs structural changes safely.
//!
//! Physical names derive from the type's uuid, never from its display name,
//! so renames are pure metadata edits. Required-ness is enforced at the
//! validation boundary, not by NOT NULL constraints, so tightening a field
//! never needs a physical ALTER; it does need a bulk scan of existing rows.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::*;

const MAX_NAME_LEN: usize = 64;
const RESERVED_COLUMNS: &[&str] = &[
    "uuid",
    "name",
    "created_at",
    "updated_at",
    "source_uuid",
    "target_uuid",
];

/// A field as supplied by the caller. `target_type: None` on a relation
/// field means the type being created/edited references itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_type: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub on_delete: Option<IntegrityStrategy>,
}

/// One entry of the desired field set for an edit. `original_name` carries
/// the field's current name so renames are unambiguous; `None` means a new
/// field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldUpdate {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_name: Option<String>,
    #[serde(flatten)]
    pub field: NewField,
}

#[must_use]
pub fn table_name(uuid: Uuid) -> String {
    format!("at_{}", uuid.simple())
}

#[must_use]
pub fn join_table_name(table: &str, field: &str) -> String {
    format!("{table}__{field}")
}

fn validate_type_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("type name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "type name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(
            "type name can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("field name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "field name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    let leading_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !leading_ok || !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "field name '{name}' must be snake_case ascii"
        )));
    }
    if RESERVED_COLUMNS.contains(&name) {
        return Err(Error::InvalidInput(format!("field name '{name}' is reserved")));
    }
    Ok(())
}

/// Resolves and validates one caller-supplied field. `self_uuid` is the
/// uuid the type itself will have, used for self-referencing relations.
fn resolve_field(store: &dyn Store, self_uuid: Uuid, input: &NewField) -> Result<AssetTypeField> {
    validate_field_name(&input.name)?;

    if input.kind == FieldKind::Relation {
        let target = input.target_type.unwrap_or(self_uuid);
        if target != self_uuid && store.get_asset_type(target)?.is_none() {
            return Err(Error::InvalidInput(format!(
                "relation field '{}' targets unknown type {target}",
                input.name
            )));
        }
        let on_delete = input.on_delete.ok_or_else(|| {
            Error::InvalidInput(format!(
                "relation field '{}' needs a referential integrity strategy",
                input.name
            ))
        })?;
        Ok(AssetTypeField {
            name: input.name.clone(),
            kind: FieldKind::Relation,
            required: input.required,
            allow_multiple: input.allow_multiple,
            target_type: Some(target),
            on_delete: Some(on_delete),
        })
    } else {
        if input.target_type.is_some() || input.on_delete.is_some() {
            return Err(Error::InvalidInput(format!(
                "field '{}' is not a relation but carries relation attributes",
                input.name
            )));
        }
        if input.allow_multiple {
            return Err(Error::InvalidInput(format!(
                "field '{}' cannot be many-valued; only relations can",
                input.name
            )));
        }
        Ok(AssetTypeField {
            name: input.name.clone(),
            kind: input.kind,
            required: input.required,
            allow_multiple: false,
            target_type: None,
            on_delete: None,
        })
    }
}

fn check_unique_names(fields: &[NewField]) -> Result<()> {
    let mut seen = HashSet::new();
    for f in fields {
        if !seen.insert(f.name.as_str()) {
            return Err(Error::Conflict(format!("duplicate field name '{}'", f.name)));
        }
    }
    Ok(())
}

/// Whether the field is stored as a column on the main table (as opposed
/// to a join table).
fn is_column_field(f: &AssetTypeField) -> bool {
    !(f.kind == FieldKind::Relation && f.allow_multiple)
}

fn column_ddl(f: &AssetTypeField) -> String {
    format!("\"{}\" {}", f.name, f.kind.column_type())
}

fn join_table_ddl(jt: &str) -> String {
    format!(
        "CREATE TABLE \"{jt}\" (
            source_uuid TEXT NOT NULL,
            target_uuid TEXT NOT NULL,
            PRIMARY KEY (source_uuid, target_uuid)
        );
        CREATE INDEX \"idx_{jt}_target\" ON \"{jt}\" (target_uuid);"
    )
}

/// Creates a new asset type and materializes its physical storage.
pub fn create_asset_type(store: &dyn Store, name: &str, fields: &[NewField]) -> Result<AssetType> {
    validate_type_name(name)?;
    if store.get_asset_type_by_name(name)?.is_some() {
        return Err(Error::Conflict(format!("asset type '{name}' already exists")));
    }
    check_unique_names(fields)?;

    let uuid = Uuid::new_v4();
    let table = table_name(uuid);
    let resolved = fields
        .iter()
        .map(|f| resolve_field(store, uuid, f))
        .collect::<Result<Vec<_>>>()?;

    let mut columns = vec![
        "uuid TEXT PRIMARY KEY".to_string(),
        "name TEXT NOT NULL".to_string(),
        "created_at TEXT DEFAULT (datetime('now'))".to_string(),
        "updated_at TEXT DEFAULT (datetime('now'))".to_string(),
    ];
    columns.extend(resolved.iter().filter(|f| is_column_field(f)).map(column_ddl));

    let mut ddl = format!("CREATE TABLE \"{table}\" ({});", columns.join(", "));
    for f in resolved.iter().filter(|f| !is_column_field(f)) {
        ddl.push('\n');
        ddl.push_str(&join_table_ddl(&join_table_name(&table, &f.name)));
    }
    store.ddl(&ddl)?;

    let asset_type = AssetType {
        uuid,
        name: name.to_string(),
        physical_table: table.clone(),
        internal: false,
        fields: resolved,
        created_at: Utc::now(),
    };
    if let Err(e) = store.insert_asset_type(&asset_type) {
        // Physical table exists without a registry row; undo it.
        if let Err(drop_err) = store.ddl(&format!("DROP TABLE IF EXISTS \"{table}\"")) {
            tracing::warn!("failed to clean up table {table}: {drop_err}");
        }
        return Err(e);
    }

    tracing::info!(name, %uuid, "created asset type");
    Ok(asset_type)
}

/// Edits an asset type: rename plus a full desired field set, diffed
/// against the current one. Cost is proportional to the number of existing
/// assets of the type, since tightened fields re-validate every row.
pub fn edit_asset_type(
    store: &dyn Store,
    uuid: Uuid,
    new_name: &str,
    updates: &[FieldUpdate],
) -> Result<AssetType> {
    let current = store.get_asset_type(uuid)?.ok_or(Error::NotFound)?;
    if current.internal {
        return Err(Error::Conflict(format!(
            "asset type '{}' backs a platform entity and cannot be edited",
            current.name
        )));
    }

    if new_name != current.name {
        validate_type_name(new_name)?;
        if store.get_asset_type_by_name(new_name)?.is_some() {
            return Err(Error::Conflict(format!(
                "asset type '{new_name}' already exists"
            )));
        }
    }

    let existing: HashMap<&str, &AssetTypeField> =
        current.fields.iter().map(|f| (f.name.as_str(), f)).collect();

    // Each update referencing an original must reference a distinct,
    // existing field; anything else is an ambiguous rename.
    let mut claimed = HashSet::new();
    for u in updates {
        if let Some(orig) = &u.original_name {
            if !existing.contains_key(orig.as_str()) {
                return Err(Error::Conflict(format!("no field named '{orig}' to update")));
            }
            if !claimed.insert(orig.as_str()) {
                return Err(Error::Conflict(format!(
                    "field '{orig}' is updated more than once"
                )));
            }
        }
    }
    {
        let mut names = HashSet::new();
        for u in updates {
            if !names.insert(u.field.name.as_str()) {
                return Err(Error::Conflict(format!(
                    "duplicate field name '{}'",
                    u.field.name
                )));
            }
        }
    }

    let mut desired = Vec::with_capacity(updates.len());
    let mut statements: Vec<String> = Vec::new();

    for u in updates {
        let resolved = resolve_field(store, uuid, &u.field)?;
        match u.original_name.as_deref().and_then(|o| existing.get(o)) {
            Some(old) => {
                plan_field_change(store, &current, old, &resolved, &mut statements)?;
            }
            None => {
                if existing.contains_key(resolved.name.as_str()) {
                    return Err(Error::Conflict(format!(
                        "field '{}' already exists; pass its original name to update it",
                        resolved.name
                    )));
                }
                if is_column_field(&resolved) {
                    statements.push(format!(
                        "ALTER TABLE \"{}\" ADD COLUMN {}",
                        current.physical_table,
                        column_ddl(&resolved)
                    ));
                } else {
                    statements.push(join_table_ddl(&join_table_name(
                        &current.physical_table,
                        &resolved.name,
                    )));
                }
                if resolved.required {
                    ensure_no_rows(store, &current.physical_table, &resolved.name)?;
                }
            }
        }
        desired.push(resolved);
    }

    // Fields absent from the desired set are dropped.
    for old in &current.fields {
        if !claimed.contains(old.name.as_str()) {
            if is_column_field(old) {
                statements.push(format!(
                    "ALTER TABLE \"{}\" DROP COLUMN \"{}\"",
                    current.physical_table, old.name
                ));
            } else {
                statements.push(format!(
                    "DROP TABLE IF EXISTS \"{}\"",
                    join_table_name(&current.physical_table, &old.name)
                ));
            }
        }
    }

    let rename = (new_name != current.name).then_some(new_name);
    store.apply_asset_type_edit(uuid, rename, &desired, &statements)?;

    tracing::info!(old = current.name, new = new_name, %uuid, "edited asset type");
    store.get_asset_type(uuid)?.ok_or(Error::NotFound)
}

/// Plans the physical work for one surviving field, re-validating existing
/// rows where the change tightens the contract.
fn plan_field_change(
    store: &dyn Store,
    current: &AssetType,
    old: &AssetTypeField,
    new: &AssetTypeField,
    statements: &mut Vec<String>,
) -> Result<()> {
    if (old.kind == FieldKind::Relation) != (new.kind == FieldKind::Relation) {
        return Err(Error::InvalidInput(format!(
            "field '{}' cannot change between relation and scalar",
            old.name
        )));
    }
    if old.allow_multiple != new.allow_multiple {
        return Err(Error::InvalidInput(format!(
            "field '{}' cannot change cardinality; add a new field instead",
            old.name
        )));
    }
    if old.kind == FieldKind::Relation && old.target_type != new.target_type {
        return Err(Error::InvalidInput(format!(
            "relation field '{}' cannot change its target type",
            old.name
        )));
    }

    if old.kind != new.kind {
        // SQLite storage classes are flexible; the declared kind only
        // gates validation, so a kind change is a bulk row check.
        let rows = store.query_dynamic(
            &format!(
                "SELECT \"{}\" FROM \"{}\" WHERE \"{}\" IS NOT NULL",
                old.name, current.physical_table, old.name
            ),
            &[],
            &[old.kind],
        )?;
        for row in &rows {
            if !row[0].matches_kind(new.kind, false) {
                return Err(Error::Conflict(format!(
                    "existing values of field '{}' do not fit kind {}",
                    old.name,
                    new.kind.as_str()
                )));
            }
        }
    }

    if new.required && !old.required {
        let violations = if is_column_field(old) {
            count_rows(
                store,
                &format!(
                    "SELECT COUNT(*) FROM \"{}\" WHERE \"{}\" IS NULL",
                    current.physical_table, old.name
                ),
            )?
        } else {
            count_rows(
                store,
                &format!(
                    "SELECT COUNT(*) FROM \"{}\" t WHERE NOT EXISTS
                     (SELECT 1 FROM \"{}\" j WHERE j.source_uuid = t.uuid)",
                    current.physical_table,
                    join_table_name(&current.physical_table, &old.name)
                ),
            )?
        };
        if violations > 0 {
            return Err(Error::Conflict(format!(
                "{violations} existing assets are missing now-required field '{}'",
                old.name
            )));
        }
    }

    if old.name != new.name {
        if is_column_field(old) {
            statements.push(format!(
                "ALTER TABLE \"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
                current.physical_table, old.name, new.name
            ));
        } else {
            statements.push(format!(
                "ALTER TABLE \"{}\" RENAME TO \"{}\"",
                join_table_name(&current.physical_table, &old.name),
                join_table_name(&current.physical_table, &new.name),
            ));
        }
    }

    Ok(())
}

fn count_rows(store: &dyn Store, sql: &str) -> Result<i64> {
    let rows = store.query_dynamic(sql, &[], &[FieldKind::Integer])?;
    match rows.first().map(|r| r.first()) {
        Some(Some(FieldValue::Integer(n))) => Ok(*n),
        _ => Ok(0),
    }
}

/// A newly added required field is only legal while the type has no rows;
/// existing rows could never satisfy it.
fn ensure_no_rows(store: &dyn Store, table: &str, field: &str) -> Result<()> {
    let count = count_rows(store, &format!("SELECT COUNT(*) FROM \"{table}\""))?;
    if count > 0 {
        return Err(Error::Conflict(format!(
            "cannot add required field '{field}': {count} existing assets would violate it"
        )));
    }
    Ok(())
}

/// Deletes an asset type: refuses for internal types, otherwise cascades
/// dependent rows first (each inbound relation's strategy on the other
/// side), then permissions and grants scoped to the type, then the
/// physical tables.
pub fn delete_asset_type(store: &dyn Store, uuid: Uuid) -> Result<()> {
    let target = store.get_asset_type(uuid)?.ok_or(Error::NotFound)?;
    if target.internal {
        return Err(Error::Conflict(format!(
            "asset type '{}' backs a platform entity and cannot be deleted",
            target.name
        )));
    }

    crate::data::access::resolve_inbound_on_type_delete(store, &target)?;

    let permissions = store.delete_permissions_for_type(uuid)?;
    let grants = store.delete_grants_for_type(uuid)?;

    let mut drops = Vec::new();
    for f in target.fields.iter().filter(|f| !is_column_field(f)) {
        drops.push(format!(
            "DROP TABLE IF EXISTS \"{}\"",
            join_table_name(&target.physical_table, &f.name)
        ));
    }
    drops.push(format!(
        "DROP TABLE IF EXISTS \"{}\"",
        target.physical_table
    ));
    store.drop_asset_type(uuid, &drops)?;

    tracing::info!(
        name = target.name,
        %uuid,
        permissions,
        grants,
        "deleted asset type"
    );
    Ok(())
}

/// Read-only snapshot of every type definition, for client-binding
/// generators.
pub fn export_catalog(store: &dyn Store) -> Result<CatalogExport> {
    Ok(CatalogExport {
        generated_at: Utc::now(),
        types: store.list_asset_types()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (temp, store)
    }

    fn varchar(name: &str, required: bool) -> NewField {
        NewField {
            name: name.to_string(),
            kind: FieldKind::Varchar,
            required,
            allow_multiple: false,
            target_type: None,
            on_delete: None,
        }
    }

    #[test]
    fn test_create_materializes_table() {
        let (_temp, store) = open_store();

        let t = create_asset_type(&store, "document", &[varchar("title", true)]).unwrap();
        assert_eq!(t.physical_table, table_name(t.uuid));

        // The table accepts rows in the materialized shape.
        store
            .exec_dynamic(
                &format!(
                    "INSERT INTO \"{}\" (uuid, name, \"title\") VALUES (?1, ?2, ?3)",
                    t.physical_table
                ),
                &[
                    FieldValue::AssetRef(Uuid::new_v4()),
                    FieldValue::Text("a".into()),
                    FieldValue::Text("Hello".into()),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let (_temp, store) = open_store();
        create_asset_type(&store, "dup", &[]).unwrap();
        let result = create_asset_type(&store, "dup", &[]);
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_unknown_relation_target_rejected() {
        let (_temp, store) = open_store();
        let result = create_asset_type(
            &store,
            "orphan",
            &[NewField {
                name: "parent".to_string(),
                kind: FieldKind::Relation,
                required: false,
                allow_multiple: false,
                target_type: Some(Uuid::new_v4()),
                on_delete: Some(IntegrityStrategy::Cascade),
            }],
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_self_reference_via_none_target() {
        let (_temp, store) = open_store();
        let t = create_asset_type(
            &store,
            "node",
            &[NewField {
                name: "parent".to_string(),
                kind: FieldKind::Relation,
                required: false,
                allow_multiple: false,
                target_type: None,
                on_delete: Some(IntegrityStrategy::SetNull),
            }],
        )
        .unwrap();
        assert_eq!(t.fields[0].target_type, Some(t.uuid));
    }

    #[test]
    fn test_many_valued_relation_gets_join_table() {
        let (_temp, store) = open_store();
        let people = create_asset_type(&store, "person", &[]).unwrap();
        let t = create_asset_type(
            &store,
            "team",
            &[NewField {
                name: "members".to_string(),
                kind: FieldKind::Relation,
                required: false,
                allow_multiple: true,
                target_type: Some(people.uuid),
                on_delete: Some(IntegrityStrategy::SetNull),
            }],
        )
        .unwrap();

        let jt = join_table_name(&t.physical_table, "members");
        store
            .exec_dynamic(
                &format!("INSERT INTO \"{jt}\" (source_uuid, target_uuid) VALUES (?1, ?2)"),
                &[
                    FieldValue::AssetRef(Uuid::new_v4()),
                    FieldValue::AssetRef(Uuid::new_v4()),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_rename_keeps_physical_table() {
        let (_temp, store) = open_store();
        let t = create_asset_type(&store, "old", &[varchar("title", false)]).unwrap();

        let edited = edit_asset_type(
            &store,
            t.uuid,
            "new",
            &[FieldUpdate {
                original_name: Some("title".to_string()),
                field: varchar("title", false),
            }],
        )
        .unwrap();

        assert_eq!(edited.name, "new");
        assert_eq!(edited.physical_table, t.physical_table);
    }

    #[test]
    fn test_field_rename_by_original_name() {
        let (_temp, store) = open_store();
        let t = create_asset_type(&store, "doc", &[varchar("title", false)]).unwrap();

        let edited = edit_asset_type(
            &store,
            t.uuid,
            "doc",
            &[FieldUpdate {
                original_name: Some("title".to_string()),
                field: varchar("headline", false),
            }],
        )
        .unwrap();

        assert_eq!(edited.fields.len(), 1);
        assert_eq!(edited.fields[0].name, "headline");

        // The renamed column is live.
        store
            .exec_dynamic(
                &format!(
                    "INSERT INTO \"{}\" (uuid, name, \"headline\") VALUES (?1, ?2, ?3)",
                    t.physical_table
                ),
                &[
                    FieldValue::AssetRef(Uuid::new_v4()),
                    FieldValue::Text("x".into()),
                    FieldValue::Text("Hi".into()),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_ambiguous_rename_is_conflict() {
        let (_temp, store) = open_store();
        let t = create_asset_type(&store, "amb", &[varchar("title", false)]).unwrap();

        let result = edit_asset_type(
            &store,
            t.uuid,
            "amb",
            &[
                FieldUpdate {
                    original_name: Some("title".to_string()),
                    field: varchar("a", false),
                },
                FieldUpdate {
                    original_name: Some("title".to_string()),
                    field: varchar("b", false),
                },
            ],
        );
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_tightening_required_rejected_with_violating_rows() {
        let (_temp, store) = open_store();
        let t = create_asset_type(&store, "strict", &[varchar("title", false)]).unwrap();

        store
            .exec_dynamic(
                &format!("INSERT INTO \"{}\" (uuid, name) VALUES (?1, ?2)", t.physical_table),
                &[
                    FieldValue::AssetRef(Uuid::new_v4()),
                    FieldValue::Text("bare".into()),
                ],
            )
            .unwrap();

        let result = edit_asset_type(
            &store,
            t.uuid,
            "strict",
            &[FieldUpdate {
                original_name: Some("title".to_string()),
                field: varchar("title", true),
            }],
        );
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_removed_field_drops_column() {
        let (_temp, store) = open_store();
        let t = create_asset_type(
            &store,
            "shrink",
            &[varchar("keep", false), varchar("drop_me", false)],
        )
        .unwrap();

        let edited = edit_asset_type(
            &store,
            t.uuid,
            "shrink",
            &[FieldUpdate {
                original_name: Some("keep".to_string()),
                field: varchar("keep", false),
            }],
        )
        .unwrap();
        assert_eq!(edited.fields.len(), 1);

        // Inserting into the dropped column now fails.
        let result = store.exec_dynamic(
            &format!(
                "INSERT INTO \"{}\" (uuid, name, \"drop_me\") VALUES (?1, ?2, ?3)",
                t.physical_table
            ),
            &[
                FieldValue::AssetRef(Uuid::new_v4()),
                FieldValue::Text("x".into()),
                FieldValue::Text("y".into()),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_refuses_internal_type() {
        let (_temp, store) = open_store();
        let uuid = Uuid::new_v4();
        store
            .insert_asset_type(&AssetType {
                uuid,
                name: "account".to_string(),
                physical_table: "accounts".to_string(),
                internal: true,
                fields: vec![],
                created_at: Utc::now(),
            })
            .unwrap();

        assert!(matches!(
            delete_asset_type(&store, uuid),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            edit_asset_type(&store, uuid, "renamed", &[]),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_delete_drops_physical_table() {
        let (_temp, store) = open_store();
        let t = create_asset_type(&store, "temp", &[varchar("x", false)]).unwrap();

        delete_asset_type(&store, t.uuid).unwrap();
        assert!(store.get_asset_type(t.uuid).unwrap().is_none());

        let result = store.query_dynamic(
            &format!("SELECT uuid FROM \"{}\"", t.physical_table),
            &[],
            &[FieldKind::Relation],
        );
        assert!(result.is_err());
    }
}
