//! # Persistence Module
//!
//! Stores per-controller key mappings as JSON files. Missing or corrupt files
//! degrade to the default mapping rather than blocking registration.

pub mod mapping_store;

pub use mapping_store::{JsonMappingStore, MappingStore};
