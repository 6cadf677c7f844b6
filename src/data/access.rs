//! Generic CRUD over dynamically defined asset types.
//!
//! Every operation takes the relation map alongside the store: the map is
//! the authoritative picture of the schema at the time the caller's view
//! was refreshed, and all SQL identifiers come from it, never from caller
//! input. Caller input only ever reaches the database as bound parameters.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::authz::ROOT_PERMISSION;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::*;

use super::query::{Authorization, Condition, Filter, Include, Predicate, Query, SortDir};
use super::relation_map::{Link, LinkKind, RelationMap, TypeShape};

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

fn uuid_params(uuids: &[Uuid]) -> Vec<FieldValue> {
    uuids.iter().map(|u| FieldValue::AssetRef(*u)).collect()
}

/// The columns selected for every row of a type, in a fixed order: uuid,
/// name, created_at, then the type's column-backed fields.
struct RowShape<'a> {
    select: String,
    kinds: Vec<FieldKind>,
    fields: Vec<&'a AssetTypeField>,
}

fn row_shape(shape: &TypeShape) -> RowShape<'_> {
    let mut cols = vec!["uuid".to_string(), "name".to_string(), "created_at".to_string()];
    let mut kinds = vec![FieldKind::Relation, FieldKind::Text, FieldKind::Date];
    let mut fields = Vec::new();
    for f in &shape.def.fields {
        if f.kind == FieldKind::Relation && f.allow_multiple {
            continue;
        }
        cols.push(format!("\"{}\"", f.name));
        kinds.push(f.kind);
        fields.push(f);
    }
    RowShape {
        select: cols.join(", "),
        kinds,
        fields,
    }
}

fn decode_row(rs: &RowShape<'_>, row: Vec<FieldValue>) -> Result<Asset> {
    let mut iter = row.into_iter();
    let uuid = match iter.next() {
        Some(FieldValue::AssetRef(u)) => u,
        _ => return Err(Error::Internal("row without a uuid".to_string())),
    };
    let name = match iter.next() {
        Some(FieldValue::Text(s)) => s,
        _ => String::new(),
    };
    let created_at = match iter.next() {
        Some(FieldValue::Date(dt)) => dt,
        _ => chrono::Utc::now(),
    };
    let mut fields = BTreeMap::new();
    for (f, value) in rs.fields.iter().zip(iter) {
        fields.insert(f.name.clone(), value);
    }
    Ok(Asset {
        uuid,
        name,
        created_at,
        fields,
        relations: BTreeMap::new(),
    })
}

/// Loads many-valued relation fields for a batch of assets from their
/// join tables.
fn attach_join_fields(
    store: &dyn Store,
    shape: &TypeShape,
    assets: &mut [Asset],
) -> Result<()> {
    let joins: Vec<&Link> = shape
        .links
        .values()
        .filter(|l| matches!(l.kind, LinkKind::JoinTable(_)))
        .collect();
    if joins.is_empty() || assets.is_empty() {
        return Ok(());
    }

    let uuids: Vec<Uuid> = assets.iter().map(|a| a.uuid).collect();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    for (i, a) in assets.iter().enumerate() {
        index.insert(a.uuid, i);
    }

    for link in joins {
        let LinkKind::JoinTable(jt) = &link.kind else {
            continue;
        };
        let rows = store.query_dynamic(
            &format!(
                "SELECT source_uuid, target_uuid FROM \"{jt}\"
                 WHERE source_uuid IN ({}) ORDER BY rowid",
                placeholders(uuids.len())
            ),
            &uuid_params(&uuids),
            &[FieldKind::Relation, FieldKind::Relation],
        )?;

        let mut per_asset: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for row in &rows {
            if let [FieldValue::AssetRef(src), FieldValue::AssetRef(dst)] = row[..] {
                per_asset.entry(src).or_default().push(dst);
            }
        }
        for a in assets.iter_mut() {
            let refs = per_asset.remove(&a.uuid).unwrap_or_default();
            a.fields
                .insert(link.field.name.clone(), FieldValue::AssetRefList(refs));
        }
    }
    Ok(())
}

fn fetch_by_uuids(store: &dyn Store, shape: &TypeShape, uuids: &[Uuid]) -> Result<Vec<Asset>> {
    if uuids.is_empty() {
        return Ok(Vec::new());
    }
    let rs = row_shape(shape);
    let rows = store.query_dynamic(
        &format!(
            "SELECT {} FROM \"{}\" WHERE uuid IN ({})",
            rs.select,
            shape.def.physical_table,
            placeholders(uuids.len())
        ),
        &uuid_params(uuids),
        &rs.kinds,
    )?;
    let mut assets = rows
        .into_iter()
        .map(|r| decode_row(&rs, r))
        .collect::<Result<Vec<_>>>()?;
    attach_join_fields(store, shape, &mut assets)?;
    Ok(assets)
}

// ---------------------------------------------------------------------------
// Validation

/// Checks a field patch against the type definition. `create` additionally
/// demands every required field; an update only rejects clearing one.
fn validate_fields(
    store: &dyn Store,
    map: &RelationMap,
    shape: &TypeShape,
    fields: &BTreeMap<String, FieldValue>,
    create: bool,
) -> Result<()> {
    for (name, value) in fields {
        let Some(def) = shape.def.field(name) else {
            return Err(Error::InvalidInput(format!(
                "type '{}' has no field '{name}'",
                shape.def.name
            )));
        };
        if !value.matches_kind(def.kind, def.allow_multiple) {
            return Err(Error::InvalidInput(format!(
                "field '{name}' expects kind {}",
                def.kind.as_str()
            )));
        }
        if def.required && cleared(def, value) {
            return Err(Error::InvalidInput(format!(
                "field '{name}' is required and cannot be cleared"
            )));
        }
    }
    if create {
        for def in &shape.def.fields {
            if def.required && fields.get(&def.name).is_none_or(|v| cleared(def, v)) {
                return Err(Error::InvalidInput(format!(
                    "missing required field '{}'",
                    def.name
                )));
            }
        }
    }
    check_references(store, map, shape, fields)
}

fn cleared(def: &AssetTypeField, value: &FieldValue) -> bool {
    match value {
        FieldValue::Null => true,
        FieldValue::AssetRefList(refs) => def.allow_multiple && refs.is_empty(),
        _ => false,
    }
}

/// Every referenced asset must exist in the relation's target table at
/// write time. Later deletions are the target's integrity strategy's
/// problem, not the writer's.
fn check_references(
    store: &dyn Store,
    map: &RelationMap,
    shape: &TypeShape,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<()> {
    for (name, value) in fields {
        let refs = value.referenced_uuids();
        if refs.is_empty() {
            continue;
        }
        let Some(link) = shape.links.get(name) else {
            continue;
        };
        let target = map.shape(link.target)?;
        let rows = store.query_dynamic(
            &format!(
                "SELECT COUNT(*) FROM \"{}\" WHERE uuid IN ({})",
                target.def.physical_table,
                placeholders(refs.len())
            ),
            &uuid_params(&refs),
            &[FieldKind::Integer],
        )?;
        let found = match rows.first().and_then(|r| r.first()) {
            Some(FieldValue::Integer(n)) => *n as usize,
            _ => 0,
        };
        if found != refs.len() {
            return Err(Error::InvalidInput(format!(
                "field '{name}' references an unknown '{}' asset",
                target.def.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filters and sorting

/// Resolves a caller-supplied field name to a physical column and its
/// kind. Only column-backed fields plus the built-ins are addressable.
fn column_for(shape: &TypeShape, name: &str) -> Result<FieldKind> {
    match name {
        "uuid" => return Ok(FieldKind::Relation),
        "name" => return Ok(FieldKind::Text),
        "created_at" | "updated_at" => return Ok(FieldKind::Date),
        _ => {}
    }
    let def = shape.def.field(name).ok_or_else(|| {
        Error::InvalidInput(format!("type '{}' has no field '{name}'", shape.def.name))
    })?;
    if def.kind == FieldKind::Relation && def.allow_multiple {
        return Err(Error::InvalidInput(format!(
            "field '{name}' is many-valued and cannot be filtered or sorted on"
        )));
    }
    Ok(def.kind)
}

fn render_condition(
    shape: &TypeShape,
    cond: &Condition,
    params: &mut Vec<FieldValue>,
) -> Result<String> {
    column_for(shape, &cond.field)?;
    let col = format!("\"{}\"", cond.field);
    Ok(match &cond.predicate {
        Predicate::Eq(FieldValue::Null) => format!("{col} IS NULL"),
        Predicate::Eq(v) => {
            params.push(v.clone());
            format!("{col} = ?")
        }
        Predicate::In(vs) => {
            if vs.is_empty() {
                "0 = 1".to_string()
            } else {
                params.extend(vs.iter().cloned());
                format!("{col} IN ({})", placeholders(vs.len()))
            }
        }
        Predicate::Lt(v) => {
            params.push(v.clone());
            format!("{col} < ?")
        }
        Predicate::Gt(v) => {
            params.push(v.clone());
            format!("{col} > ?")
        }
    })
}

fn render_filter(
    shape: &TypeShape,
    filter: &Filter,
    params: &mut Vec<FieldValue>,
) -> Result<String> {
    let render_group = |conds: &[Condition], params: &mut Vec<FieldValue>| -> Result<String> {
        if conds.is_empty() {
            return Ok("1 = 1".to_string());
        }
        let parts = conds
            .iter()
            .map(|c| render_condition(shape, c, params))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(" AND "))
    };
    match filter {
        Filter::All(conds) => render_group(conds, params),
        Filter::Any(groups) => {
            if groups.is_empty() {
                return Ok("1 = 1".to_string());
            }
            let parts = groups
                .iter()
                .map(|g| Ok(format!("({})", render_group(g, params)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(parts.join(" OR "))
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization

struct AuthzCtx {
    grants: Vec<Grant>,
    permission: String,
    recursive: bool,
}

fn load_authz(store: &dyn Store, authz: &Authorization) -> Result<AuthzCtx> {
    Ok(AuthzCtx {
        grants: store.list_account_app_grants(authz.account_uuid, authz.app_uuid)?,
        permission: authz.permission.clone(),
        recursive: authz.recursive,
    })
}

impl AuthzCtx {
    fn allows(&self, type_uuid: Uuid, asset_uuid: Uuid) -> bool {
        let requested = Scope::AssetScoped {
            type_uuid,
            asset_uuid,
        };
        self.grants.iter().any(|g| {
            (g.permission == self.permission || g.permission == ROOT_PERMISSION)
                && g.scope.covers(&requested)
        })
    }

    fn filter(&self, type_uuid: Uuid, assets: &mut Vec<Asset>) {
        assets.retain(|a| self.allows(type_uuid, a.uuid));
    }
}

// ---------------------------------------------------------------------------
// Includes

/// One hop of include resolution: either follow a relation field the
/// queried type declares, or walk a relation backwards from the type that
/// declares it (addressed as `"TypeName.field"`).
fn resolve_includes(
    store: &dyn Store,
    map: &RelationMap,
    shape: &TypeShape,
    assets: &mut [Asset],
    includes: &[Include],
    authz: Option<&AuthzCtx>,
) -> Result<()> {
    for include in includes {
        if let Some((type_name, field)) = include.field.split_once('.') {
            resolve_reverse(store, map, shape, assets, include, type_name, field, authz)?;
        } else {
            resolve_forward(store, map, shape, assets, include, authz)?;
        }
    }
    Ok(())
}

fn resolve_forward(
    store: &dyn Store,
    map: &RelationMap,
    shape: &TypeShape,
    assets: &mut [Asset],
    include: &Include,
    authz: Option<&AuthzCtx>,
) -> Result<()> {
    let link = shape.links.get(&include.field).ok_or_else(|| {
        Error::InvalidInput(format!(
            "type '{}' has no relation field '{}'",
            shape.def.name, include.field
        ))
    })?;
    let target = map.shape(link.target)?;

    // Gather every referenced uuid across the batch, fetch once, then
    // hand each asset its slice. References to deleted assets simply
    // resolve to nothing.
    let mut wanted: Vec<Uuid> = Vec::new();
    let mut seen = HashSet::new();
    for a in assets.iter() {
        for r in a.fields.get(&include.field).map(FieldValue::referenced_uuids).unwrap_or_default()
        {
            if seen.insert(r) {
                wanted.push(r);
            }
        }
    }
    let mut fetched = fetch_by_uuids(store, target, &wanted)?;
    if let Some(ctx) = authz.filter(|c| c.recursive) {
        ctx.filter(target.def.uuid, &mut fetched);
    }
    resolve_includes(store, map, target, &mut fetched, &include.nested, authz)?;

    let by_uuid: HashMap<Uuid, Asset> = fetched.into_iter().map(|a| (a.uuid, a)).collect();
    for a in assets.iter_mut() {
        let refs = a
            .fields
            .get(&include.field)
            .map(FieldValue::referenced_uuids)
            .unwrap_or_default();
        let resolved = refs.iter().filter_map(|r| by_uuid.get(r).cloned()).collect();
        a.relations.insert(include.field.clone(), resolved);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn resolve_reverse(
    store: &dyn Store,
    map: &RelationMap,
    shape: &TypeShape,
    assets: &mut [Asset],
    include: &Include,
    type_name: &str,
    field: &str,
    authz: Option<&AuthzCtx>,
) -> Result<()> {
    let source = map.shape_by_name(type_name).ok_or_else(|| {
        Error::InvalidInput(format!("unknown asset type '{type_name}'"))
    })?;
    let link = source.links.get(field).ok_or_else(|| {
        Error::InvalidInput(format!(
            "type '{type_name}' has no relation field '{field}'"
        ))
    })?;
    if link.target != shape.def.uuid {
        return Err(Error::InvalidInput(format!(
            "'{type_name}.{field}' does not target type '{}'",
            shape.def.name
        )));
    }
    if assets.is_empty() {
        return Ok(());
    }

    let parents: Vec<Uuid> = assets.iter().map(|a| a.uuid).collect();

    // (source asset uuid, parent it points at) pairs for the whole batch.
    let pairs: Vec<(Uuid, Uuid)> = match &link.kind {
        LinkKind::Column => {
            let rows = store.query_dynamic(
                &format!(
                    "SELECT uuid, \"{field}\" FROM \"{}\" WHERE \"{field}\" IN ({})",
                    source.def.physical_table,
                    placeholders(parents.len())
                ),
                &uuid_params(&parents),
                &[FieldKind::Relation, FieldKind::Relation],
            )?;
            rows.into_iter()
                .filter_map(|r| match r[..] {
                    [FieldValue::AssetRef(s), FieldValue::AssetRef(p)] => Some((s, p)),
                    _ => None,
                })
                .collect()
        }
        LinkKind::JoinTable(jt) => {
            let rows = store.query_dynamic(
                &format!(
                    "SELECT source_uuid, target_uuid FROM \"{jt}\" WHERE target_uuid IN ({})",
                    placeholders(parents.len())
                ),
                &uuid_params(&parents),
                &[FieldKind::Relation, FieldKind::Relation],
            )?;
            rows.into_iter()
                .filter_map(|r| match r[..] {
                    [FieldValue::AssetRef(s), FieldValue::AssetRef(p)] => Some((s, p)),
                    _ => None,
                })
                .collect()
        }
    };

    let wanted: Vec<Uuid> = {
        let mut seen = HashSet::new();
        pairs.iter().filter(|(s, _)| seen.insert(*s)).map(|(s, _)| *s).collect()
    };
    let mut fetched = fetch_by_uuids(store, source, &wanted)?;
    if let Some(ctx) = authz.filter(|c| c.recursive) {
        ctx.filter(source.def.uuid, &mut fetched);
    }
    resolve_includes(store, map, source, &mut fetched, &include.nested, authz)?;
    let by_uuid: HashMap<Uuid, Asset> = fetched.into_iter().map(|a| (a.uuid, a)).collect();

    let mut per_parent: HashMap<Uuid, Vec<Asset>> = HashMap::new();
    for (s, p) in &pairs {
        if let Some(asset) = by_uuid.get(s) {
            per_parent.entry(*p).or_default().push(asset.clone());
        }
    }
    for a in assets.iter_mut() {
        a.relations
            .insert(include.field.clone(), per_parent.remove(&a.uuid).unwrap_or_default());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads

pub fn find_one(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuid: Uuid,
    includes: &[Include],
    authorization: Option<&Authorization>,
) -> Result<Option<Asset>> {
    let shape = map.shape(type_uuid)?;
    let authz = authorization.map(|a| load_authz(store, a)).transpose()?;

    let mut assets = fetch_by_uuids(store, shape, &[asset_uuid])?;
    if let Some(ctx) = &authz {
        ctx.filter(type_uuid, &mut assets);
    }
    resolve_includes(store, map, shape, &mut assets, includes, authz.as_ref())?;
    Ok(assets.into_iter().next())
}

pub fn find_many(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    query: &Query,
) -> Result<Vec<Asset>> {
    let shape = map.shape(type_uuid)?;
    let authz = query
        .authorization
        .as_ref()
        .map(|a| load_authz(store, a))
        .transpose()?;

    let rs = row_shape(shape);
    let mut sql = format!("SELECT {} FROM \"{}\"", rs.select, shape.def.physical_table);
    let mut params = Vec::new();
    if let Some(filter) = &query.filter {
        let clause = render_filter(shape, filter, &mut params)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    if !query.sort.is_empty() {
        let mut keys = Vec::with_capacity(query.sort.len());
        for (field, dir) in &query.sort {
            column_for(shape, field)?;
            keys.push(format!(
                "\"{field}\" {}",
                match dir {
                    SortDir::Asc => "ASC",
                    SortDir::Desc => "DESC",
                }
            ));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }
    if query.limit.is_some() || query.offset.is_some() {
        // LIMIT -1 is SQLite for "no limit"; OFFSET needs a LIMIT clause.
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            query.limit.map_or(-1, i64::from),
            query.offset.unwrap_or(0)
        ));
    }

    let rows = store.query_dynamic(&sql, &params, &rs.kinds)?;
    let mut assets = rows
        .into_iter()
        .map(|r| decode_row(&rs, r))
        .collect::<Result<Vec<_>>>()?;
    attach_join_fields(store, shape, &mut assets)?;

    if let Some(ctx) = &authz {
        ctx.filter(type_uuid, &mut assets);
    }
    resolve_includes(store, map, shape, &mut assets, &query.includes, authz.as_ref())?;
    Ok(assets)
}

// ---------------------------------------------------------------------------
// Writes

fn insert_statements(
    shape: &TypeShape,
    uuid: Uuid,
    name: &str,
    fields: &BTreeMap<String, FieldValue>,
    stmts: &mut Vec<(String, Vec<FieldValue>)>,
) {
    let mut cols = vec!["uuid".to_string(), "name".to_string()];
    let mut params = vec![FieldValue::AssetRef(uuid), FieldValue::Text(name.to_string())];
    for f in &shape.def.fields {
        if f.kind == FieldKind::Relation && f.allow_multiple {
            continue;
        }
        if let Some(v) = fields.get(&f.name) {
            cols.push(format!("\"{}\"", f.name));
            params.push(v.clone());
        }
    }
    stmts.push((
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            shape.def.physical_table,
            cols.join(", "),
            placeholders(params.len())
        ),
        params,
    ));

    for link in shape.links.values() {
        let LinkKind::JoinTable(jt) = &link.kind else {
            continue;
        };
        let Some(value) = fields.get(&link.field.name) else {
            continue;
        };
        for r in value.referenced_uuids() {
            stmts.push((
                format!("INSERT INTO \"{jt}\" (source_uuid, target_uuid) VALUES (?, ?)"),
                vec![FieldValue::AssetRef(uuid), FieldValue::AssetRef(r)],
            ));
        }
    }
}

pub fn create_one(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    name: &str,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Asset> {
    create_many(store, map, type_uuid, &[(name.to_string(), fields.clone())])?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("created asset did not read back".to_string()))
}

/// Creates a batch of assets atomically: every row is validated before
/// anything is written, and all writes go through one transaction.
pub fn create_many(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    inputs: &[(String, BTreeMap<String, FieldValue>)],
) -> Result<Vec<Asset>> {
    let shape = map.shape(type_uuid)?;
    for (name, fields) in inputs {
        if name.is_empty() {
            return Err(Error::InvalidInput("asset name cannot be empty".to_string()));
        }
        validate_fields(store, map, shape, fields, true)?;
    }

    let mut stmts = Vec::new();
    let mut uuids = Vec::with_capacity(inputs.len());
    for (name, fields) in inputs {
        let uuid = Uuid::new_v4();
        uuids.push(uuid);
        insert_statements(shape, uuid, name, fields, &mut stmts);
    }
    store.exec_dynamic_batch(&stmts)?;
    tracing::debug!(type_name = shape.def.name, count = inputs.len(), "created assets");

    let mut created = fetch_by_uuids(store, shape, &uuids)?;
    created.sort_by_key(|a| uuids.iter().position(|u| *u == a.uuid));
    Ok(created)
}

fn update_statements(
    shape: &TypeShape,
    uuid: Uuid,
    name: Option<&str>,
    fields: &BTreeMap<String, FieldValue>,
    stmts: &mut Vec<(String, Vec<FieldValue>)>,
) {
    let mut sets = vec!["updated_at = datetime('now')".to_string()];
    let mut params = Vec::new();
    if let Some(name) = name {
        sets.push("name = ?".to_string());
        params.push(FieldValue::Text(name.to_string()));
    }
    for f in &shape.def.fields {
        if f.kind == FieldKind::Relation && f.allow_multiple {
            continue;
        }
        if let Some(v) = fields.get(&f.name) {
            sets.push(format!("\"{}\" = ?", f.name));
            params.push(v.clone());
        }
    }
    params.push(FieldValue::AssetRef(uuid));
    stmts.push((
        format!(
            "UPDATE \"{}\" SET {} WHERE uuid = ?",
            shape.def.physical_table,
            sets.join(", ")
        ),
        params,
    ));

    // A many-valued relation patch replaces the full membership.
    for link in shape.links.values() {
        let LinkKind::JoinTable(jt) = &link.kind else {
            continue;
        };
        let Some(value) = fields.get(&link.field.name) else {
            continue;
        };
        stmts.push((
            format!("DELETE FROM \"{jt}\" WHERE source_uuid = ?"),
            vec![FieldValue::AssetRef(uuid)],
        ));
        for r in value.referenced_uuids() {
            stmts.push((
                format!("INSERT INTO \"{jt}\" (source_uuid, target_uuid) VALUES (?, ?)"),
                vec![FieldValue::AssetRef(uuid), FieldValue::AssetRef(r)],
            ));
        }
    }
}

pub fn update_one(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuid: Uuid,
    name: Option<&str>,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Asset> {
    update_many(store, map, type_uuid, &[asset_uuid], name, fields)?
        .into_iter()
        .next()
        .ok_or(Error::NotFound)
}

/// Applies one patch to a set of assets. All targets must exist; a single
/// missing uuid fails the whole batch before anything is written.
pub fn update_many(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuids: &[Uuid],
    name: Option<&str>,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Vec<Asset>> {
    let shape = map.shape(type_uuid)?;
    if let Some(name) = name {
        if name.is_empty() {
            return Err(Error::InvalidInput("asset name cannot be empty".to_string()));
        }
    }
    validate_fields(store, map, shape, fields, false)?;
    ensure_all_exist(store, shape, asset_uuids)?;

    let mut stmts = Vec::new();
    for uuid in asset_uuids {
        update_statements(shape, *uuid, name, fields, &mut stmts);
    }
    store.exec_dynamic_batch(&stmts)?;

    fetch_by_uuids(store, shape, asset_uuids)
}

fn ensure_all_exist(store: &dyn Store, shape: &TypeShape, uuids: &[Uuid]) -> Result<()> {
    if uuids.is_empty() {
        return Ok(());
    }
    let rows = store.query_dynamic(
        &format!(
            "SELECT COUNT(DISTINCT uuid) FROM \"{}\" WHERE uuid IN ({})",
            shape.def.physical_table,
            placeholders(uuids.len())
        ),
        &uuid_params(uuids),
        &[FieldKind::Integer],
    )?;
    let found = match rows.first().and_then(|r| r.first()) {
        Some(FieldValue::Integer(n)) => *n as usize,
        _ => 0,
    };
    let distinct: HashSet<&Uuid> = uuids.iter().collect();
    if found != distinct.len() {
        return Err(Error::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Deletes

pub fn delete_one(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuid: Uuid,
) -> Result<()> {
    delete_many(store, map, type_uuid, &[asset_uuid])
}

/// Deletes a set of assets, honoring the integrity strategy of every
/// relation that points at them. The whole plan, cascades included, is
/// computed first and executed as one transaction; any Restrict edge or
/// missing target aborts it with nothing written.
pub fn delete_many(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuids: &[Uuid],
) -> Result<()> {
    let shape = map.shape(type_uuid)?;
    ensure_all_exist(store, shape, asset_uuids)?;

    let mut visited = HashSet::new();
    let mut stmts = Vec::new();
    let mut doomed: Vec<Uuid> = Vec::new();
    plan_delete(store, map, type_uuid, asset_uuids, &mut visited, &mut stmts, &mut doomed)?;

    // Asset-scoped grants go in the same transaction as the rows they
    // reference.
    if !doomed.is_empty() {
        stmts.push((
            format!(
                "DELETE FROM grants WHERE asset_uuid IN ({})",
                placeholders(doomed.len())
            ),
            uuid_params(&doomed),
        ));
    }
    store.exec_dynamic_batch(&stmts)?;

    tracing::debug!(type_name = shape.def.name, deleted = doomed.len(), "deleted assets");
    Ok(())
}

/// Recursively plans one type's deletions. The visited set both prevents
/// infinite recursion through relation cycles and keeps a row from being
/// planned twice.
fn plan_delete(
    store: &dyn Store,
    map: &RelationMap,
    type_uuid: Uuid,
    asset_uuids: &[Uuid],
    visited: &mut HashSet<Uuid>,
    stmts: &mut Vec<(String, Vec<FieldValue>)>,
    doomed: &mut Vec<Uuid>,
) -> Result<()> {
    let uuids: Vec<Uuid> = asset_uuids
        .iter()
        .copied()
        .filter(|u| visited.insert(*u))
        .collect();
    if uuids.is_empty() {
        return Ok(());
    }
    let shape = map.shape(type_uuid)?;

    for edge in &shape.inbound {
        let source = map.shape(edge.source_type)?;
        let strategy = edge.field.on_delete.unwrap_or(IntegrityStrategy::Restrict);

        match strategy {
            IntegrityStrategy::Invalidate => {}
            IntegrityStrategy::Restrict => {
                let referrers = referring_uuids(store, source, edge, &uuids, visited)?;
                if !referrers.is_empty() {
                    return Err(Error::Conflict(format!(
                        "{} '{}' assets still reference the deleted assets via '{}'",
                        referrers.len(),
                        source.def.name,
                        edge.field.name
                    )));
                }
            }
            IntegrityStrategy::Cascade => {
                let referrers = referring_uuids(store, source, edge, &uuids, visited)?;
                plan_delete(store, map, edge.source_type, &referrers, visited, stmts, doomed)?;
            }
            IntegrityStrategy::SetNull => match &edge.kind {
                LinkKind::Column => stmts.push((
                    format!(
                        "UPDATE \"{}\" SET \"{}\" = NULL WHERE \"{}\" IN ({})",
                        source.def.physical_table,
                        edge.field.name,
                        edge.field.name,
                        placeholders(uuids.len())
                    ),
                    uuid_params(&uuids),
                )),
                LinkKind::JoinTable(jt) => stmts.push((
                    format!(
                        "DELETE FROM \"{jt}\" WHERE target_uuid IN ({})",
                        placeholders(uuids.len())
                    ),
                    uuid_params(&uuids),
                )),
            },
        }
    }

    // The rows' own join memberships go with them.
    for link in shape.links.values() {
        if let LinkKind::JoinTable(jt) = &link.kind {
            stmts.push((
                format!(
                    "DELETE FROM \"{jt}\" WHERE source_uuid IN ({})",
                    placeholders(uuids.len())
                ),
                uuid_params(&uuids),
            ));
        }
    }
    stmts.push((
        format!(
            "DELETE FROM \"{}\" WHERE uuid IN ({})",
            shape.def.physical_table,
            placeholders(uuids.len())
        ),
        uuid_params(&uuids),
    ));
    doomed.extend(uuids);
    Ok(())
}

/// Uuids of `source` rows referencing any of `targets` through `edge`,
/// excluding rows already planned for deletion.
fn referring_uuids(
    store: &dyn Store,
    source: &TypeShape,
    edge: &super::relation_map::InboundLink,
    targets: &[Uuid],
    visited: &HashSet<Uuid>,
) -> Result<Vec<Uuid>> {
    let sql = match &edge.kind {
        LinkKind::Column => format!(
            "SELECT uuid FROM \"{}\" WHERE \"{}\" IN ({})",
            source.def.physical_table,
            edge.field.name,
            placeholders(targets.len())
        ),
        LinkKind::JoinTable(jt) => format!(
            "SELECT DISTINCT source_uuid FROM \"{jt}\" WHERE target_uuid IN ({})",
            placeholders(targets.len())
        ),
    };
    let rows = store.query_dynamic(&sql, &uuid_params(targets), &[FieldKind::Relation])?;
    Ok(rows
        .into_iter()
        .filter_map(|r| match r.first() {
            Some(FieldValue::AssetRef(u)) if !visited.contains(u) => Some(*u),
            _ => None,
        })
        .collect())
}

/// Resolves every relation pointing INTO a type about to be dropped,
/// applying each inbound field's strategy against the type's entire row
/// set. Called by schema deletion before the physical tables go away.
pub fn resolve_inbound_on_type_delete(store: &dyn Store, target: &AssetType) -> Result<()> {
    let map = RelationMap::build(store.list_asset_types()?);
    let shape = map.shape(target.uuid)?;

    for edge in &shape.inbound {
        if edge.source_type == target.uuid {
            continue;
        }
        let source = map.shape(edge.source_type)?;
        let strategy = edge.field.on_delete.unwrap_or(IntegrityStrategy::Restrict);

        match strategy {
            IntegrityStrategy::Invalidate => {}
            IntegrityStrategy::Restrict | IntegrityStrategy::Cascade => {
                let sql = match &edge.kind {
                    LinkKind::Column => format!(
                        "SELECT uuid FROM \"{}\" WHERE \"{}\" IN (SELECT uuid FROM \"{}\")",
                        source.def.physical_table, edge.field.name, target.physical_table
                    ),
                    LinkKind::JoinTable(jt) => format!(
                        "SELECT DISTINCT source_uuid FROM \"{jt}\"
                         WHERE target_uuid IN (SELECT uuid FROM \"{}\")",
                        target.physical_table
                    ),
                };
                let rows = store.query_dynamic(&sql, &[], &[FieldKind::Relation])?;
                let referrers: Vec<Uuid> = rows
                    .into_iter()
                    .filter_map(|r| match r.first() {
                        Some(FieldValue::AssetRef(u)) => Some(*u),
                        _ => None,
                    })
                    .collect();
                if referrers.is_empty() {
                    continue;
                }
                if strategy == IntegrityStrategy::Restrict {
                    return Err(Error::Conflict(format!(
                        "type '{}' still references '{}' via '{}'",
                        source.def.name, target.name, edge.field.name
                    )));
                }
                delete_many(store, &map, edge.source_type, &referrers)?;
            }
            IntegrityStrategy::SetNull => {
                let sql = match &edge.kind {
                    LinkKind::Column => format!(
                        "UPDATE \"{}\" SET \"{}\" = NULL
                         WHERE \"{}\" IN (SELECT uuid FROM \"{}\")",
                        source.def.physical_table,
                        edge.field.name,
                        edge.field.name,
                        target.physical_table
                    ),
                    LinkKind::JoinTable(jt) => format!(
                        "DELETE FROM \"{jt}\" WHERE target_uuid IN (SELECT uuid FROM \"{}\")",
                        target.physical_table
                    ),
                };
                store.exec_dynamic(&sql, &[])?;
            }
        }
    }
    Ok(())
}
