//! A thread-safe in-memory storage for the currently active rule set. [`RuleStore`] provides
//! concurrent access for readers (placement evaluation) and writers (the config-fetch layer).
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{RuleSet, TriggerConfig};

/// Source of the active rule set.
///
/// Every evaluation takes one snapshot and uses it throughout, even if the rules are replaced
/// while the evaluation is in progress.
pub trait RuleSource: Send + Sync {
    /// Get the currently active rule set.
    fn rule_set(&self) -> Arc<RuleSet>;
}

/// `RuleStore` provides a thread-safe (`Sync`) storage for the rule set that allows concurrent
/// access for readers and writers.
///
/// `RuleSet` itself is always immutable and can only be replaced completely. Each replacement
/// gets a new generation number.
#[derive(Default)]
pub struct RuleStore {
    rules: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    /// Create a new store with an empty rule set (generation 0).
    pub fn new() -> Self {
        RuleStore::default()
    }

    /// Compile and activate a new trigger configuration. Returns the new snapshot.
    pub fn set_config(&self, config: TriggerConfig) -> Arc<RuleSet> {
        let mut slot = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule_set = Arc::new(RuleSet::from_config(config, slot.generation + 1));
        *slot = rule_set.clone();
        log::debug!(target: "paywall_trigger", generation = rule_set.generation; "activated new rule set");
        rule_set
    }
}

impl RuleSource for RuleStore {
    fn rule_set(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
