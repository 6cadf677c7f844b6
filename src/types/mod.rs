mod models;
mod scope;
mod value;

pub use models::*;
pub use scope::Scope;
pub use value::{FieldKind, FieldValue};
