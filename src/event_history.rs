//! Event history collaborator.
//!
//! The host application owns the event store (usually a local database). The engine only appends
//! events and asks two kinds of questions: how many times an event happened in a time range and
//! when it happened last.
use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{error::StoreError, models::Timestamp, Attributes};

/// A placement or occurrence event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub timestamp: Timestamp,
    /// Event parameters, exposed to expressions under `params`.
    pub parameters: Attributes,
}

impl EventRecord {
    /// Create an event that happened now, without parameters.
    pub fn new(name: impl Into<String>) -> EventRecord {
        EventRecord {
            name: name.into(),
            timestamp: chrono::Utc::now(),
            parameters: Attributes::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn at(mut self, timestamp: Timestamp) -> EventRecord {
        self.timestamp = timestamp;
        self
    }

    #[allow(missing_docs)]
    pub fn with_parameters(mut self, parameters: Attributes) -> EventRecord {
        self.parameters = parameters;
        self
    }
}

/// Append-only store of events.
///
/// Guarantees expected by the engine:
/// - `count_in_range(name, start, end)` counts events with `start <= timestamp <= end`.
/// - `most_recent(name)` returns the largest timestamp recorded for `name`.
/// - An event is visible to reads once `append` returned.
#[async_trait]
pub trait EventHistoryStore: Send + Sync {
    /// Record an event.
    async fn append(&self, event: &EventRecord) -> Result<(), StoreError>;

    /// Number of events named `name` within the inclusive time range.
    async fn count_in_range(
        &self,
        name: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64, StoreError>;

    /// Timestamp of the last event named `name`, or `None` if it never happened.
    async fn most_recent(&self, name: &str) -> Result<Option<Timestamp>, StoreError>;
}

/// In-memory event history backed by a `HashMap<name, timestamps>`.
#[derive(Debug, Default)]
pub struct InMemoryEventHistory {
    events: Mutex<HashMap<String, Vec<Timestamp>>>,
}

impl InMemoryEventHistory {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded events named `name`.
    pub fn len(&self, name: &str) -> usize {
        self.events
            .lock()
            .map(|events| events.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Timestamp>>>, StoreError> {
        self.events
            .lock()
            .map_err(|_| StoreError("event history lock is poisoned".to_owned()))
    }
}

#[async_trait]
impl EventHistoryStore for InMemoryEventHistory {
    async fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
        self.lock()?
            .entry(event.name.clone())
            .or_default()
            .push(event.timestamp);
        Ok(())
    }

    async fn count_in_range(
        &self,
        name: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64, StoreError> {
        let events = self.lock()?;
        let count = events.get(name).map_or(0, |timestamps| {
            timestamps
                .iter()
                .filter(|ts| start <= **ts && **ts <= end)
                .count()
        });
        Ok(count as u64)
    }

    async fn most_recent(&self, name: &str) -> Result<Option<Timestamp>, StoreError> {
        let events = self.lock()?;
        Ok(events
            .get(name)
            .and_then(|timestamps| timestamps.iter().max().copied()))
    }
}
