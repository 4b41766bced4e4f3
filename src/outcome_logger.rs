use serde::{Deserialize, Serialize};

use crate::models::{Experiment, Timestamp, VariantType};

/// Reported whenever a committed evaluation assigns a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFireEvent {
    /// Placement that was evaluated.
    pub event_name: String,
    /// Matched experiment with the assigned variant.
    pub experiment: Experiment,
    /// `true` if the variant is a holdout and no paywall is going to be shown.
    pub holdout: bool,
    pub timestamp: Timestamp,
}

impl TriggerFireEvent {
    pub(crate) fn new(event_name: &str, experiment: Experiment, timestamp: Timestamp) -> Self {
        TriggerFireEvent {
            event_name: event_name.to_owned(),
            holdout: experiment.variant.variant_type == VariantType::Holdout,
            experiment,
            timestamp,
        }
    }
}

/// A trait for reporting trigger fires to the analytics pipeline.
///
/// Closures taking a [`TriggerFireEvent`] implement this trait.
///
/// # Notes
///
/// This method is called on the orchestrator worker before the outcome is returned to callers, so
/// `log_trigger_fire` should not block.
pub trait OutcomeLogger {
    /// Report a trigger fire. Should not panic.
    fn log_trigger_fire(&self, event: TriggerFireEvent);
}

pub(crate) struct NoopOutcomeLogger;
impl OutcomeLogger for NoopOutcomeLogger {
    fn log_trigger_fire(&self, _event: TriggerFireEvent) {}
}

impl<T: Fn(TriggerFireEvent)> OutcomeLogger for T {
    fn log_trigger_fire(&self, event: TriggerFireEvent) {
        self(event);
    }
}
