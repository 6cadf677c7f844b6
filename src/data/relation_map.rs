//! An in-memory index of every asset type and how they link together.
//!
//! The map is rebuilt from the registry whenever the schema changes and is
//! shared read-only between queries. It answers two questions the registry
//! rows alone answer slowly: where does a relation field physically live,
//! and which types point INTO a given type.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::join_table_name;
use crate::types::{AssetType, AssetTypeField, FieldKind};

/// How a relation field is physically stored on the declaring type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// A TEXT column on the declaring type's table holding the target uuid.
    Column,
    /// A separate (source_uuid, target_uuid) table, named here.
    JoinTable(String),
}

/// A relation field seen from the declaring side.
#[derive(Debug, Clone)]
pub struct Link {
    pub field: AssetTypeField,
    pub target: Uuid,
    pub kind: LinkKind,
}

/// A relation field seen from the targeted side.
#[derive(Debug, Clone)]
pub struct InboundLink {
    pub source_type: Uuid,
    pub field: AssetTypeField,
    pub kind: LinkKind,
}

#[derive(Debug, Clone)]
pub struct TypeShape {
    pub def: AssetType,
    pub links: BTreeMap<String, Link>,
    pub inbound: Vec<InboundLink>,
}

#[derive(Debug, Clone, Default)]
pub struct RelationMap {
    types: HashMap<Uuid, TypeShape>,
    by_name: HashMap<String, Uuid>,
}

impl RelationMap {
    pub fn build(defs: Vec<AssetType>) -> RelationMap {
        let mut map = RelationMap::default();
        for def in &defs {
            map.by_name.insert(def.name.clone(), def.uuid);
        }
        for def in defs {
            let mut links = BTreeMap::new();
            for f in def.fields.iter().filter(|f| f.kind == FieldKind::Relation) {
                let Some(target) = f.target_type else {
                    continue;
                };
                let kind = if f.allow_multiple {
                    LinkKind::JoinTable(join_table_name(&def.physical_table, &f.name))
                } else {
                    LinkKind::Column
                };
                links.insert(
                    f.name.clone(),
                    Link {
                        field: f.clone(),
                        target,
                        kind,
                    },
                );
            }
            map.types.insert(
                def.uuid,
                TypeShape {
                    def,
                    links,
                    inbound: Vec::new(),
                },
            );
        }

        // Second pass: project every link onto its target as an inbound edge.
        let edges: Vec<(Uuid, InboundLink)> = map
            .types
            .values()
            .flat_map(|shape| {
                shape.links.values().map(|link| {
                    (
                        link.target,
                        InboundLink {
                            source_type: shape.def.uuid,
                            field: link.field.clone(),
                            kind: link.kind.clone(),
                        },
                    )
                })
            })
            .collect();
        for (target, edge) in edges {
            if let Some(shape) = map.types.get_mut(&target) {
                shape.inbound.push(edge);
            }
        }
        map
    }

    pub fn shape(&self, uuid: Uuid) -> Result<&TypeShape> {
        self.types.get(&uuid).ok_or(Error::NotFound)
    }

    #[must_use]
    pub fn shape_by_name(&self, name: &str) -> Option<&TypeShape> {
        self.by_name.get(name).and_then(|u| self.types.get(u))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::table_name;
    use crate::types::IntegrityStrategy;
    use chrono::Utc;

    fn def(name: &str, fields: Vec<AssetTypeField>) -> AssetType {
        let uuid = Uuid::new_v4();
        AssetType {
            uuid,
            name: name.to_string(),
            physical_table: table_name(uuid),
            internal: false,
            fields,
            created_at: Utc::now(),
        }
    }

    fn relation(name: &str, target: Uuid, multi: bool) -> AssetTypeField {
        AssetTypeField {
            name: name.to_string(),
            kind: FieldKind::Relation,
            required: false,
            allow_multiple: multi,
            target_type: Some(target),
            on_delete: Some(IntegrityStrategy::SetNull),
        }
    }

    #[test]
    fn test_links_and_inbound_edges() {
        let person = def("person", vec![]);
        let person_uuid = person.uuid;
        let team = def(
            "team",
            vec![
                relation("lead", person_uuid, false),
                relation("members", person_uuid, true),
            ],
        );
        let team_table = team.physical_table.clone();

        let map = RelationMap::build(vec![person, team]);

        let team_shape = map.shape_by_name("team").unwrap();
        assert_eq!(team_shape.links["lead"].kind, LinkKind::Column);
        assert_eq!(
            team_shape.links["members"].kind,
            LinkKind::JoinTable(join_table_name(&team_table, "members"))
        );

        let person_shape = map.shape_by_name("person").unwrap();
        assert_eq!(person_shape.inbound.len(), 2);
        assert!(person_shape
            .inbound
            .iter()
            .all(|e| e.source_type == team_shape.def.uuid));
    }

    #[test]
    fn test_self_reference() {
        let mut node = def("node", vec![]);
        node.fields.push(relation("parent", node.uuid, false));
        let uuid = node.uuid;

        let map = RelationMap::build(vec![node]);
        let shape = map.shape(uuid).unwrap();
        assert_eq!(shape.links["parent"].target, uuid);
        assert_eq!(shape.inbound.len(), 1);
        assert_eq!(shape.inbound[0].source_type, uuid);
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let map = RelationMap::build(vec![]);
        assert!(matches!(map.shape(Uuid::new_v4()), Err(Error::NotFound)));
    }
}
