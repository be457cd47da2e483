// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory config store for tests that must not touch the filesystem.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use strand_app_core::config::{ConfigError, ConfigStore};

/// [`ConfigStore`] backed by a shared map. Clones share state, so a test
/// can hand one clone to a `ConfigService` and inspect the other.
///
/// # Example
///
/// ```
/// use strand_app_core::config::ConfigService;
/// use strand_app_core::prefs::{ConsolePrefs, CONSOLE_PREFS_KEY};
/// use strand_dry_tests::InMemoryConfigStore;
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
/// let prefs: ConsolePrefs = service.load_or_init(CONSOLE_PREFS_KEY).unwrap();
///
/// assert_eq!(prefs, ConsolePrefs::default());
/// assert!(store.contains_key(CONSOLE_PREFS_KEY));
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<String, Vec<u8>>,
    loads: usize,
    saves: usize,
    fail_on_load: bool,
    fail_on_save: bool,
}

impl InMemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding `raw` under `key`.
    pub fn with_entry(key: &str, raw: impl Into<Vec<u8>>) -> Self {
        let store = Self::new();
        store.lock().data.insert(key.to_owned(), raw.into());
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent load fail.
    pub fn set_fail_on_load(&self, fail: bool) {
        self.lock().fail_on_load = fail;
    }

    /// Make every subsequent save fail.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.lock().fail_on_save = fail;
    }

    /// Load attempts so far, failed ones included.
    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    /// Save attempts so far, failed ones included.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    /// Whether `key` holds a blob.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().data.contains_key(key)
    }

    /// Stored blob for `key` as UTF-8, for asserting on serialized output.
    pub fn text(&self, key: &str) -> Option<String> {
        self.lock()
            .data
            .get(key)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut inner = self.lock();
        inner.loads += 1;
        if inner.fail_on_load {
            return Err(ConfigError::Io(io::Error::other("simulated load failure")));
        }
        inner.data.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.lock();
        inner.saves += 1;
        if inner.fail_on_save {
            return Err(ConfigError::Io(io::Error::other("simulated save failure")));
        }
        inner.data.insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}
