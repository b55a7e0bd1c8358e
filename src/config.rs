//! Jail configuration
//!
//! - `document`: the on-disk `config.json` map
//! - `schema`: the property registry and validators
//! - `grammar`, `address`: value mini-grammars
//! - `migrate`: the version ladder
//! - `defaults`: host-wide defaults
//! - `store`: load/save/set with validation

pub mod address;
pub mod defaults;
pub mod document;
pub mod grammar;
pub mod migrate;
pub mod schema;
pub mod store;

pub use document::ConfigDocument;
pub use schema::HostFacts;
pub use store::{ConfigStore, JailConfig};
