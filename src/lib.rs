//! confstore - a small persisted settings store
//!
//! Settings live in memory as a name → value table backed by an XML file.
//! Changes are tracked, flushed explicitly with `save`, and can be thrown
//! away with `reload`. A single store can be shared between threads.

pub mod config;
pub mod store;
pub mod types;

pub use store::{ConfigDocument, ConfigEntry, ConfigStore, FileSystem, MemoryFileSystem, OsFileSystem};
pub use types::{Result, StoreError};
