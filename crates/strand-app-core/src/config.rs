// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed preferences over a byte-oriented storage port.
//!
//! Stores only move bytes under a logical key; [`ConfigService`] owns the
//! JSON encoding. Decode failures carry the key so a tool can say which
//! file to fix.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Where preference blobs live (a directory, a test map, ...).
pub trait ConfigStore {
    /// Bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace whatever is stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failures reading or writing preferences.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("not found")]
    NotFound,
    /// The store cannot hold this key (empty, path-like, ...).
    #[error("invalid config key `{0}`")]
    InvalidKey(String),
    /// The store has no place to live on this platform.
    #[error("no config directory available: {0}")]
    NoStore(String),
    /// Backend I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes under `key` are not a valid document.
    #[error("config `{key}` is unreadable: {source}")]
    Corrupt {
        /// Offending key.
        key: String,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// A value could not be encoded.
    #[error("encode error: {0}")]
    Encode(serde_json::Error),
}

/// JSON codec over a [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrow the inner store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Value stored under `key`; `Ok(None)` when absent or empty.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConfigError::Corrupt {
                key: key.to_owned(),
                source,
            })
    }

    /// Store `value` under `key` as pretty JSON.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value).map_err(ConfigError::Encode)?;
        self.store.save_raw(key, &data)
    }

    /// Load `key`, or persist and return the default when it is absent.
    ///
    /// A stored value that fails to parse is reported, not overwritten.
    pub fn load_or_init<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(value) = self.load(key)? {
            return Ok(value);
        }
        let value = T::default();
        self.save(key, &value)?;
        Ok(value)
    }

    /// Load (or default) `key`, apply `edit`, save, and return the result.
    pub fn update<T, F>(&self, key: &str, edit: F) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let mut value = self.load(key)?.unwrap_or_default();
        edit(&mut value);
        self.save(key, &value)?;
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapStore(RefCell<HashMap<String, Vec<u8>>>);

    impl ConfigStore for MapStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn blank_blobs_read_as_absent() {
        let store = MapStore::default();
        store.save_raw("k", b"  \n").unwrap();
        let service = ConfigService::new(store);
        assert_eq!(service.load::<u32>("k").unwrap(), None);
        assert_eq!(service.load::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn corrupt_documents_name_their_key_and_survive() {
        let store = MapStore::default();
        store.save_raw("console", b"{oops").unwrap();
        let service = ConfigService::new(store);
        let err = service.load_or_init::<Vec<u32>>("console").unwrap_err();
        assert!(matches!(&err, ConfigError::Corrupt { key, .. } if key == "console"));
        assert!(err.to_string().contains("console"));
        assert_eq!(service.store().load_raw("console").unwrap(), b"{oops");
    }

    #[test]
    fn update_starts_from_the_default() {
        let service = ConfigService::new(MapStore::default());
        let v: Vec<u32> = service.update("nums", |v: &mut Vec<u32>| v.push(7)).unwrap();
        assert_eq!(v, vec![7]);
        let v: Vec<u32> = service.update("nums", |v: &mut Vec<u32>| v.push(8)).unwrap();
        assert_eq!(v, vec![7, 8]);
    }
}
