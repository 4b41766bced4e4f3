//! Turns an expression result into a rule match and records occurrences of matched rules.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    event_history::{EventHistoryStore, EventRecord},
    models::{Timestamp, TriggerRule},
    ExperimentId,
};

/// Whether an evaluation is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Record the placement and occurrences, confirm assignments and report trigger fires.
    Commit,
    /// Read-only evaluation (e.g., to decide on preloading).
    Preview,
}

/// Why a rule did not produce a paywall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoMatchSource {
    /// The rule's expression evaluated to `false` or failed to evaluate.
    Expression,
    /// The rule was suppressed by an occurrence limit. Rules currently carry no occurrence limit,
    /// so the built-in matcher never reports this.
    Occurrence,
    /// The user is assigned to a holdout variant.
    Holdout,
}

/// A rule that did not match, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedRule {
    /// Why the rule did not match.
    pub source: NoMatchSource,
    /// Experiment of the rule.
    pub experiment_id: ExperimentId,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum RuleMatch {
    Matched(Arc<TriggerRule>),
    NoMatch(UnmatchedRule),
}

/// Matches rules and records an occurrence for each committed match.
pub struct OccurrenceMatcher<'a> {
    history: &'a dyn EventHistoryStore,
}

impl<'a> OccurrenceMatcher<'a> {
    #[allow(missing_docs)]
    pub fn new(history: &'a dyn EventHistoryStore) -> Self {
        OccurrenceMatcher { history }
    }

    /// Decide whether the rule matches given its expression result.
    ///
    /// In [`EvaluationMode::Commit`], a match is recorded in the event history under
    /// [`TriggerRule::occurrence_key`]. Failing to record it is logged and does not affect the
    /// match.
    pub async fn match_rule(
        &self,
        rule: &Arc<TriggerRule>,
        expression_matched: bool,
        mode: EvaluationMode,
        now: Timestamp,
    ) -> RuleMatch {
        if !expression_matched {
            return RuleMatch::NoMatch(UnmatchedRule {
                source: NoMatchSource::Expression,
                experiment_id: rule.experiment_id.clone(),
            });
        }

        if mode == EvaluationMode::Commit {
            let occurrence = EventRecord::new(rule.occurrence_key()).at(now);
            if let Err(err) = self.history.append(&occurrence).await {
                log::warn!(target: "paywall_trigger",
                           experiment_id = rule.experiment_id;
                           "failed to record rule occurrence: {err}");
            }
        }

        RuleMatch::Matched(rule.clone())
    }
}
