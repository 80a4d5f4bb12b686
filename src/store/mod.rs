//! Persisted settings store
//!
//! - `document`: the XML settings document and its schema constants
//! - `fs`: file access abstraction, real and in-memory
//! - `config_store`: the thread-safe store built on both

mod config_store;
pub mod document;
pub mod fs;

pub use config_store::ConfigStore;
pub use document::{ConfigDocument, ConfigEntry};
pub use fs::{FileSystem, MemoryFileSystem, OsFileSystem};
