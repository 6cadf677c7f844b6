//! Generic data access over dynamically defined asset types.

pub mod access;
pub mod query;
pub mod relation_map;

pub use access::*;
pub use query::*;
pub use relation_map::{LinkKind, RelationMap, TypeShape};
