//! Sticky assignment state: the seed and confirmed assignments.
//!
//! Writes go to the [`KeyValueStore`] first and only then replace the in-memory snapshot, so a
//! failed write leaves both sides unchanged. All writes are issued from the orchestrator worker,
//! one at a time; readers on other threads get consistent snapshots.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    assignment::Seed,
    error::{AssignmentError, Error, PersistenceError},
    models::{RuleSet, ServerAssignment, Variant},
    persistence::{KeyValueStore, CONFIRMED_ASSIGNMENTS, SEED},
    ExperimentId,
};

#[derive(Debug, Clone)]
struct AssignmentState {
    seed: Seed,
    confirmed: Arc<HashMap<ExperimentId, Variant>>,
}

/// Confirmed assignment cache backed by a [`KeyValueStore`].
///
/// State is loaded lazily on first use. If loading fails, the error is returned and loading is
/// retried on the next call.
pub struct ConfirmedAssignmentCache {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<Option<AssignmentState>>,
}

impl ConfirmedAssignmentCache {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn KeyValueStore>) -> ConfirmedAssignmentCache {
        ConfirmedAssignmentCache {
            store,
            state: RwLock::new(None),
        }
    }

    fn snapshot(&self) -> Option<AssignmentState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, state: AssignmentState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    fn invalidate(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn load(&self) -> Result<AssignmentState, PersistenceError> {
        if let Some(state) = self.snapshot() {
            return Ok(state);
        }

        let seed = match SEED.read(&*self.store).await? {
            Some(seed) => seed,
            None => {
                let seed = Seed::generate();
                SEED.write(&*self.store, &seed).await?;
                log::debug!(target: "paywall_trigger", seed = seed.value(); "generated new assignment seed");
                seed
            }
        };
        let confirmed = CONFIRMED_ASSIGNMENTS
            .read(&*self.store)
            .await?
            .unwrap_or_default();

        let state = AssignmentState {
            seed,
            confirmed: Arc::new(confirmed),
        };
        self.replace(state.clone());
        Ok(state)
    }

    /// Current seed, loading it from the store (or generating it) if needed.
    pub async fn seed(&self) -> Result<Seed, PersistenceError> {
        self.load().await.map(|state| state.seed)
    }

    /// Snapshot of confirmed assignments. Empty until the cache is loaded.
    pub fn confirmed_assignments(&self) -> Arc<HashMap<ExperimentId, Variant>> {
        self.snapshot()
            .map(|state| state.confirmed)
            .unwrap_or_default()
    }

    /// Get the confirmed variant for the experiment, or pick one with `assign` and confirm it.
    pub async fn get_or_assign(
        &self,
        experiment_id: &ExperimentId,
        assign: impl FnOnce(Seed) -> Result<Variant, AssignmentError>,
    ) -> Result<Variant, Error> {
        let state = self.load().await?;
        if let Some(variant) = state.confirmed.get(experiment_id) {
            return Ok(variant.clone());
        }

        let variant = assign(state.seed)?;
        self.confirm(experiment_id.clone(), variant.clone()).await?;
        Ok(variant)
    }

    /// Same as [`get_or_assign`](Self::get_or_assign) but never writes.
    pub async fn peek_or_assign(
        &self,
        experiment_id: &ExperimentId,
        assign: impl FnOnce(Seed) -> Result<Variant, AssignmentError>,
    ) -> Result<Variant, Error> {
        let state = self.load().await?;
        match state.confirmed.get(experiment_id) {
            Some(variant) => Ok(variant.clone()),
            None => Ok(assign(state.seed)?),
        }
    }

    /// Record a confirmed assignment.
    ///
    /// Confirming the same variant again is a no-op. Confirming a different variant for an
    /// already-confirmed experiment fails with [`Error::ConcurrencyInvariantViolation`] and keeps
    /// the existing assignment.
    pub async fn confirm(&self, experiment_id: ExperimentId, variant: Variant) -> Result<(), Error> {
        let state = self.load().await?;
        match state.confirmed.get(&experiment_id) {
            Some(existing) if *existing == variant => return Ok(()),
            Some(existing) => {
                log::error!(target: "paywall_trigger",
                            experiment_id,
                            existing = existing.id,
                            attempted = variant.id;
                            "conflicting assignment confirmation");
                return Err(Error::ConcurrencyInvariantViolation {
                    experiment_id,
                    existing: existing.id.to_string(),
                    attempted: variant.id.to_string(),
                });
            }
            None => {}
        }

        let mut confirmed = HashMap::clone(&state.confirmed);
        confirmed.insert(experiment_id, variant);
        CONFIRMED_ASSIGNMENTS.write(&*self.store, &confirmed).await?;

        self.replace(AssignmentState {
            seed: state.seed,
            confirmed: Arc::new(confirmed),
        });
        Ok(())
    }

    /// Clear confirmed assignments and draw a new seed.
    ///
    /// If a write fails, the in-memory state is dropped and reloaded from the store on next use,
    /// so memory never disagrees with what was persisted.
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let seed = Seed::generate();
        let confirmed = HashMap::new();
        let persisted = match SEED.write(&*self.store, &seed).await {
            Ok(()) => CONFIRMED_ASSIGNMENTS.write(&*self.store, &confirmed).await,
            Err(err) => Err(err),
        };
        if let Err(err) = persisted {
            self.invalidate();
            return Err(err);
        }

        self.replace(AssignmentState {
            seed,
            confirmed: Arc::new(confirmed),
        });
        log::debug!(target: "paywall_trigger", seed = seed.value(); "assignments reset");
        Ok(())
    }

    /// Replace the seed, keeping confirmed assignments.
    pub async fn set_seed(&self, seed: Seed) -> Result<(), PersistenceError> {
        let state = self.load().await?;
        if state.seed == seed {
            return Ok(());
        }
        SEED.write(&*self.store, &seed).await?;
        self.replace(AssignmentState { seed, ..state });
        Ok(())
    }

    /// Merge authoritative server assignments into the cache, overwriting local ones.
    ///
    /// Assignments referencing experiments or variants that are not in `rules` are skipped.
    /// Returns the number of assignments applied.
    pub async fn restore(
        &self,
        assignments: &[ServerAssignment],
        rules: &RuleSet,
    ) -> Result<usize, PersistenceError> {
        let state = self.load().await?;
        let mut confirmed = HashMap::clone(&state.confirmed);
        let mut applied = 0;
        for assignment in assignments {
            match rules.find_variant(&assignment.experiment_id, &assignment.variant_id) {
                Some(option) => {
                    confirmed.insert(assignment.experiment_id.clone(), option.to_variant());
                    applied += 1;
                }
                None => {
                    log::debug!(target: "paywall_trigger",
                                experiment_id = assignment.experiment_id,
                                variant_id = assignment.variant_id;
                                "skipping server assignment for unknown variant");
                }
            }
        }

        CONFIRMED_ASSIGNMENTS.write(&*self.store, &confirmed).await?;
        self.replace(AssignmentState {
            seed: state.seed,
            confirmed: Arc::new(confirmed),
        });
        Ok(applied)
    }
}
