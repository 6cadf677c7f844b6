//! warden: an identity and authorization platform with a dynamic schema.
//!
//! Admins define asset types at runtime; the platform materializes them as
//! real tables and serves generic, relation-aware CRUD over them. Apps
//! declare permission catalogs, accounts hold scoped grants against them,
//! and derived views (the relation map, app credentials, health verdicts)
//! sit behind coalesced caches so bursts of readers share one rebuild.
//!
//! [`Platform`] is the entry point; everything else hangs off it.

pub mod auth;
pub mod authz;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod health;
pub mod platform;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use platform::Platform;
