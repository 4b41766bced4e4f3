//! Key-value persistence collaborator and the typed keys the engine stores under.
use std::{collections::HashMap, marker::PhantomData, sync::Mutex};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    assignment::Seed, error::PersistenceError, models::Variant, Attributes, ExperimentId,
};

/// Durable key-value storage provided by the host application (e.g., shared preferences).
///
/// Values are JSON documents. A successful `write` must be durable before it returns: the engine
/// only updates its in-memory state after the write succeeds.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value. Returns `None` if the key was never written (or was deleted).
    async fn read(&self, key: &str) -> Result<Option<serde_json::Value>, PersistenceError>;

    /// Write a value, replacing the previous one.
    async fn write(&self, key: &str, value: serde_json::Value) -> Result<(), PersistenceError>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}

/// A key together with the type of the value stored under it.
pub struct StorageKey<T> {
    key: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for StorageKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StorageKey<T> {}

impl<T> StorageKey<T> {
    const fn new(key: &'static str) -> StorageKey<T> {
        StorageKey {
            key,
            _type: PhantomData,
        }
    }

    #[allow(missing_docs)]
    pub fn key(self) -> &'static str {
        self.key
    }

    /// Delete the value from the store.
    pub async fn delete(self, store: &dyn KeyValueStore) -> Result<(), PersistenceError> {
        store.delete(self.key).await
    }
}

impl<T: DeserializeOwned> StorageKey<T> {
    /// Read and decode the value.
    pub async fn read(self, store: &dyn KeyValueStore) -> Result<Option<T>, PersistenceError> {
        let Some(value) = store.read(self.key).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| PersistenceError::Decode {
                key: self.key.to_owned(),
                message: err.to_string(),
            })
    }
}

impl<T: Serialize> StorageKey<T> {
    /// Encode and write the value.
    pub async fn write(self, store: &dyn KeyValueStore, value: &T) -> Result<(), PersistenceError> {
        let value = serde_json::to_value(value).map_err(|err| PersistenceError::Write {
            key: self.key.to_owned(),
            message: err.to_string(),
        })?;
        store.write(self.key, value).await
    }
}

/// Assignment seed in `[0, 100)`.
pub const SEED: StorageKey<Seed> = StorageKey::new("store.seed");

/// Confirmed (sticky) assignments keyed by experiment.
pub const CONFIRMED_ASSIGNMENTS: StorageKey<HashMap<ExperimentId, Variant>> =
    StorageKey::new("store.confirmedAssignments");

/// User attributes set through the orchestrator.
pub const USER_ATTRIBUTES: StorageKey<Attributes> = StorageKey::new("store.userAttributes");

/// Identifier of the identified user, if any.
pub const APP_USER_ID: StorageKey<String> = StorageKey::new("store.appUserId");

/// In-memory key-value store backed by a `HashMap<key, json>`.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl InMemoryKeyValueStore {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
        key: &str,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, serde_json::Value>>, PersistenceError>
    {
        self.values.lock().map_err(|_| PersistenceError::Read {
            key: key.to_owned(),
            message: "store lock is poisoned".to_owned(),
        })
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn read(&self, key: &str) -> Result<Option<serde_json::Value>, PersistenceError> {
        Ok(self.lock(key)?.get(key).cloned())
    }

    async fn write(&self, key: &str, value: serde_json::Value) -> Result<(), PersistenceError> {
        self.lock(key)?.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.lock(key)?.remove(key);
        Ok(())
    }
}
