//! Thread-safe settings store backed by an XML file
//!
//! A [`ConfigStore`] keeps a name → value map together with the parsed
//! document it was loaded from. Every write updates both, marks the store
//! dirty, and waits for an explicit [`ConfigStore::save`] before anything
//! reaches the disk. [`ConfigStore::reload`] throws unsaved changes away.
//!
//! One mutex guards the map, the document, the dirty flag and all file
//! I/O, so concurrent callers never see the map and the document disagree.

use crate::store::document::{is_xml_text, ConfigDocument, ConfigEntry};
use crate::store::fs::{absolute_path, FileSystem, OsFileSystem};
use crate::types::{Result, StoreError};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// How a write treats an existing or missing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Add,
    Update,
    AddOrUpdate,
}

/// Everything the lock protects.
#[derive(Debug)]
struct State {
    document: ConfigDocument,
    values: HashMap<String, String>,
    dirty: bool,
}

impl State {
    fn loaded(document: ConfigDocument) -> Self {
        let values = document.to_map();
        Self {
            document,
            values,
            dirty: false,
        }
    }
}

/// Settings table persisted to a single XML file.
///
/// All methods take `&self`; share one store between threads with `Arc`.
pub struct ConfigStore {
    full_path: PathBuf,
    fs: Arc<dyn FileSystem>,
    state: Mutex<State>,
}

impl ConfigStore {
    /// Open the settings file at `path` on the real file system.
    ///
    /// With `create_new` a fresh document holding only the root element is
    /// written immediately, and an existing file is an
    /// [`StoreError::AlreadyExists`] error. Without it the file must exist
    /// and parse as a settings document.
    pub fn open(path: impl AsRef<Path>, create_new: bool) -> Result<Self> {
        Self::open_with(Arc::new(OsFileSystem), path, create_new)
    }

    /// Same as [`ConfigStore::open`] but on the given file system.
    pub fn open_with(
        fs: Arc<dyn FileSystem>,
        path: impl AsRef<Path>,
        create_new: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.to_string_lossy().trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "file path must not be empty".to_string(),
            ));
        }

        let full_path = absolute_path(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let document = if create_new {
            if fs.exists(&full_path) {
                return Err(StoreError::AlreadyExists(format!(
                    "file {}",
                    full_path.display()
                )));
            }
            let document = ConfigDocument::new();
            write_document(fs.as_ref(), &full_path, &document)?;
            info!("Created settings file {}", full_path.display());
            document
        } else {
            let document = read_document(fs.as_ref(), &full_path)?;
            info!(
                "Loaded {} settings from {}",
                document.len(),
                full_path.display()
            );
            document
        };

        Ok(Self {
            full_path,
            fs,
            state: Mutex::new(State::loaded(document)),
        })
    }

    /// Absolute path of the backing file, fixed at construction.
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Whether there are changes that have not been saved yet.
    pub fn is_changed(&self) -> bool {
        self.lock().dirty
    }

    /// Current value of `name`, or `None` when it is not set.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        validate_name(name)?;
        Ok(self.lock().values.get(name).cloned())
    }

    /// Whether a setting called `name` exists.
    pub fn contains(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.lock().values.contains_key(name))
    }

    /// Number of settings.
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    /// Whether the store holds no settings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current name → value map.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().values.clone()
    }

    /// Copy of the current entries in document order.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.lock().document.entries().to_vec()
    }

    /// Insert a new setting. Fails if `name` is already present.
    pub fn add(&self, name: &str, value: &str) -> Result<()> {
        self.write(name, value, WriteMode::Add)
    }

    /// Change an existing setting. Fails if `name` is absent.
    pub fn update(&self, name: &str, value: &str) -> Result<()> {
        self.write(name, value, WriteMode::Update)
    }

    /// Set `name` to `value`, adding the setting if it is missing.
    pub fn add_or_update(&self, name: &str, value: &str) -> Result<()> {
        self.write(name, value, WriteMode::AddOrUpdate)
    }

    /// Delete a setting. Returns `false` if there was nothing to delete.
    pub fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;

        let mut state = self.lock();
        if state.values.remove(name).is_none() {
            return Ok(false);
        }
        state.document.remove(name);
        state.dirty = true;

        debug!("Removed setting '{}'", name);
        Ok(true)
    }

    /// Write pending changes to disk.
    ///
    /// Returns `false` without touching the file when nothing changed. On
    /// failure the store stays dirty so the save can be retried.
    pub fn save(&self) -> Result<bool> {
        let mut state = self.lock();
        if !state.dirty {
            debug!("No changes to save for {}", self.full_path.display());
            return Ok(false);
        }

        write_document(self.fs.as_ref(), &self.full_path, &state.document)?;
        state.dirty = false;

        info!(
            "Saved {} settings to {}",
            state.document.len(),
            self.full_path.display()
        );
        Ok(true)
    }

    /// Re-read the backing file, discarding unsaved changes.
    ///
    /// If the file is gone or no longer valid the error is returned and the
    /// in-memory state is left exactly as it was.
    pub fn reload(&self) -> Result<()> {
        let mut state = self.lock();

        let document = match read_document(self.fs.as_ref(), &self.full_path) {
            Ok(document) => document,
            Err(e) => {
                warn!("Reload of {} failed: {}", self.full_path.display(), e);
                return Err(e);
            }
        };

        if state.dirty {
            debug!("Discarding unsaved changes to {}", self.full_path.display());
        }
        *state = State::loaded(document);

        info!(
            "Reloaded {} settings from {}",
            state.document.len(),
            self.full_path.display()
        );
        Ok(())
    }

    fn write(&self, name: &str, value: &str, mode: WriteMode) -> Result<()> {
        validate_name(name)?;
        validate_value(value)?;

        let mut state = self.lock();
        let exists = state.values.contains_key(name);

        match (mode, exists) {
            (WriteMode::Add, true) => {
                return Err(StoreError::AlreadyExists(format!("setting '{}'", name)));
            }
            (WriteMode::Update, false) => {
                return Err(StoreError::NotFound(format!("setting '{}'", name)));
            }
            (_, true) => {
                state.document.set_value(name, value);
            }
            (_, false) => {
                state.document.push(name, value);
            }
        }
        state.values.insert(name.to_string(), value.to_string());
        state.dirty = true;

        debug!(
            "{} setting '{}'",
            if exists { "Updated" } else { "Added" },
            name
        );
        Ok(())
    }

    // Every mutation finishes both halves before it can unwind, so a
    // poisoned guard still holds a consistent state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("full_path", &self.full_path)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "setting name must not be empty".to_string(),
        ));
    }
    if !is_xml_text(name) {
        return Err(StoreError::InvalidArgument(format!(
            "setting name {:?} contains characters not allowed in XML",
            name
        )));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if !is_xml_text(value) {
        return Err(StoreError::InvalidArgument(
            "setting value contains characters not allowed in XML".to_string(),
        ));
    }
    Ok(())
}

fn read_document(fs: &dyn FileSystem, path: &Path) -> Result<ConfigDocument> {
    let bytes = fs.read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(format!("file {}", path.display()))
        } else {
            StoreError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let text = String::from_utf8(bytes).map_err(|e| {
        StoreError::InvalidFormat(format!("{} is not valid UTF-8: {}", path.display(), e))
    })?;

    ConfigDocument::parse(&text)
}

fn write_document(fs: &dyn FileSystem, path: &Path, document: &ConfigDocument) -> Result<()> {
    let write_error = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let xml = document.to_xml().map_err(write_error)?;
    fs.write_all(path, xml.as_bytes()).map_err(write_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fs::MemoryFileSystem;

    const PATH: &str = "/config/settings.xml";

    fn memory_fs(xml: &str) -> Arc<MemoryFileSystem> {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.insert(PATH, xml);
        fs
    }

    fn open(fs: &Arc<MemoryFileSystem>) -> ConfigStore {
        ConfigStore::open_with(fs.clone(), PATH, false).expect("open store")
    }

    fn assert_consistent(store: &ConfigStore) {
        let state = store.lock();
        assert_eq!(state.values, state.document.to_map());
        assert_eq!(state.values.len(), state.document.len());
    }

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<configurations>
  <setting name="theme" value="dark" />
  <setting name="language" value="en" />
  <setting name="broken" />
</configurations>"#;

    #[test]
    fn test_open_existing_loads_valid_entries() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));
        assert!(!store.contains("broken").unwrap());
        assert!(!store.is_changed());
        assert_eq!(store.full_path(), Path::new(PATH));
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let fs = Arc::new(MemoryFileSystem::new());
        let result = ConfigStore::open_with(fs, PATH, false);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_open_wrong_root_is_invalid_format() {
        let fs = memory_fs(r#"<settings><setting name="a" value="1"/></settings>"#);
        let result = ConfigStore::open_with(fs, PATH, false);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_open_non_utf8_is_invalid_format() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.insert(PATH, vec![0xff, 0xfe, 0x00]);
        let result = ConfigStore::open_with(fs, PATH, false);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_open_empty_path_is_invalid_argument() {
        let fs = Arc::new(MemoryFileSystem::new());
        let result = ConfigStore::open_with(fs, "  ", false);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_create_new_writes_empty_document() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = ConfigStore::open_with(fs.clone(), PATH, true).unwrap();

        assert!(store.is_empty());
        assert!(!store.is_changed());
        assert_eq!(fs.write_count(), 1);

        let written = fs.contents(Path::new(PATH)).unwrap();
        assert!(ConfigDocument::parse(&written).unwrap().is_empty());
    }

    #[test]
    fn test_create_new_over_existing_file_fails() {
        let fs = memory_fs(SAMPLE);
        let result = ConfigStore::open_with(fs.clone(), PATH, true);

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(fs.write_count(), 0);
        assert_eq!(fs.contents(Path::new(PATH)).as_deref(), Some(SAMPLE));
    }

    #[test]
    fn test_create_new_write_failure_is_surfaced() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.set_fail_writes(true);
        let result = ConfigStore::open_with(fs, PATH, true);
        assert!(matches!(result, Err(StoreError::Write { .. })));
    }

    #[test]
    fn test_add_then_get() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add("font", "mono").unwrap();

        assert_eq!(store.get("font").unwrap().as_deref(), Some("mono"));
        assert!(store.contains("font").unwrap());
        assert!(store.is_changed());
        assert_eq!(store.entries().last(), Some(&ConfigEntry::new("font", "mono")));
        assert_consistent(&store);
    }

    #[test]
    fn test_add_existing_fails_and_leaves_value() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        let result = store.add("theme", "light");

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));
        assert!(!store.is_changed());
    }

    #[test]
    fn test_update_missing_fails_and_leaves_map() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);
        let before = store.snapshot();

        let result = store.update("missing", "x");

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(store.snapshot(), before);
        assert!(!store.is_changed());
    }

    #[test]
    fn test_update_keeps_document_position() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.update("theme", "light").unwrap();

        assert_eq!(store.entries()[0], ConfigEntry::new("theme", "light"));
        assert!(store.is_changed());
        assert_consistent(&store);
    }

    #[test]
    fn test_add_or_update_is_idempotent() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add_or_update("font", "mono").unwrap();
        let once = store.entries();
        store.add_or_update("font", "mono").unwrap();

        assert_eq!(store.entries(), once);
        assert_eq!(store.len(), 3);
        assert_consistent(&store);
    }

    #[test]
    fn test_remove() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        assert!(!store.remove("missing").unwrap());
        assert!(!store.is_changed());

        assert!(store.remove("theme").unwrap());
        assert!(!store.contains("theme").unwrap());
        assert_eq!(store.get("theme").unwrap(), None);
        assert!(store.is_changed());
        assert_consistent(&store);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        for name in ["", "   ", "\t\n"] {
            assert!(matches!(store.get(name), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.contains(name), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.add(name, "v"), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.update(name, "v"), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.add_or_update(name, "v"), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.remove(name), Err(StoreError::InvalidArgument(_))));
        }
        assert!(!store.is_changed());
    }

    #[test]
    fn test_non_xml_characters_are_rejected() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        assert!(matches!(store.add("bad\u{1}", "v"), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(store.add("ok", "nul\u{0}"), Err(StoreError::InvalidArgument(_))));
        assert!(!store.contains("ok").unwrap());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        let mut snapshot = store.snapshot();
        snapshot.insert("theme".to_string(), "changed".to_string());
        snapshot.remove("language");

        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));
        assert!(store.contains("language").unwrap());
    }

    #[test]
    fn test_save_writes_only_when_dirty() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        assert!(!store.save().unwrap());
        assert_eq!(fs.write_count(), 0);

        store.add("font", "mono").unwrap();
        assert!(store.save().unwrap());
        assert_eq!(fs.write_count(), 1);
        assert!(!store.is_changed());

        assert!(!store.save().unwrap());
        assert_eq!(fs.write_count(), 1);
    }

    #[test]
    fn test_save_drops_skipped_entries_and_keeps_order() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add("font", "mono").unwrap();
        store.save().unwrap();

        let written = fs.contents(Path::new(PATH)).unwrap();
        assert!(!written.contains("broken"));
        let parsed = ConfigDocument::parse(&written).unwrap();
        let names: Vec<&str> = parsed.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["theme", "language", "font"]);
    }

    #[test]
    fn test_failed_save_stays_dirty_and_can_retry() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);
        store.add("font", "mono").unwrap();

        fs.set_fail_writes(true);
        assert!(matches!(store.save(), Err(StoreError::Write { .. })));
        assert!(store.is_changed());
        assert_eq!(fs.contents(Path::new(PATH)).as_deref(), Some(SAMPLE));

        fs.set_fail_writes(false);
        assert!(store.save().unwrap());
        assert!(!store.is_changed());
    }

    #[test]
    fn test_round_trip_through_reload_and_reopen() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add("a", "1").unwrap();
        store.save().unwrap();
        store.reload().unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        let reopened = open(&fs);
        assert_eq!(reopened.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(reopened.entries(), store.entries());
    }

    #[test]
    fn test_multiline_values_are_saved_portably() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add("k0", "a\nb").unwrap();
        store.add("k1", "a\r\nb").unwrap();
        store.save().unwrap();

        let written = fs.contents(Path::new(PATH)).unwrap();
        assert!(written.contains(r#"value="a&#xA;b""#));
        assert!(written.contains(r#"value="a&#xD;&#xA;b""#));

        let reopened = open(&fs);
        assert_eq!(reopened.get("k0").unwrap().as_deref(), Some("a\nb"));
        assert_eq!(reopened.get("k1").unwrap().as_deref(), Some("a\r\nb"));
    }

    #[test]
    fn test_reload_discards_unsaved_changes() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        store.add("x", "1").unwrap();
        store.remove("theme").unwrap();
        store.reload().unwrap();

        assert!(!store.contains("x").unwrap());
        assert!(store.contains("theme").unwrap());
        assert!(!store.is_changed());
        assert_consistent(&store);
    }

    #[test]
    fn test_reload_picks_up_external_changes() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);

        fs.insert(PATH, r#"<configurations><setting name="only" value="1"/></configurations>"#);
        store.reload().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("only").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_failed_reload_keeps_previous_state() {
        let fs = memory_fs(SAMPLE);
        let store = open(&fs);
        store.add("pending", "1").unwrap();

        fs.insert(PATH, "<not-settings/>");
        assert!(matches!(store.reload(), Err(StoreError::InvalidFormat(_))));
        assert!(store.contains("pending").unwrap());
        assert!(store.is_changed());

        fs.delete(Path::new(PATH));
        assert!(matches!(store.reload(), Err(StoreError::NotFound(_))));
        assert_eq!(store.len(), 3);
        assert_consistent(&store);
    }

    #[test]
    fn test_concurrent_add_or_update_leaves_single_entry() {
        let fs = memory_fs(SAMPLE);
        let store = Arc::new(open(&fs));

        let handles: Vec<_> = (0..16)
            .map(|id| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.add_or_update("counter", &id.to_string()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let counters: Vec<ConfigEntry> = store
            .entries()
            .into_iter()
            .filter(|e| e.name == "counter")
            .collect();
        assert_eq!(counters.len(), 1);
        let id: u32 = counters[0].value.parse().unwrap();
        assert!(id < 16);
        assert_consistent(&store);
    }

    #[test]
    fn test_concurrent_writers_and_savers() {
        let fs = memory_fs(SAMPLE);
        let store = Arc::new(open(&fs));

        let handles: Vec<_> = (0..8)
            .map(|id| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..20 {
                        store.add(&format!("key-{}-{}", id, i), "v").unwrap();
                        if i % 5 == 0 {
                            store.save().unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.save().unwrap();

        assert_eq!(store.len(), 2 + 8 * 20);
        let on_disk = ConfigDocument::parse(&fs.contents(Path::new(PATH)).unwrap()).unwrap();
        assert_eq!(on_disk.to_map(), store.snapshot());
    }
}
