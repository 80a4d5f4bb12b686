//! Command-line configuration
//!
//! Works out which settings file the `confstore` binary operates on:
//! 1. `--file` argument (highest priority)
//! 2. `CONFSTORE_FILE` environment variable
//! 3. Platform config directory (lowest priority)

mod location;

pub use location::{resolve_store_path, DEFAULT_FILE_NAME, STORE_PATH_ENV};
