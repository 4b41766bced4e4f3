//! On-device trigger evaluation and experiment assignment for paywall placements.
//!
//! # Overview
//!
//! The host application reports placements (named events, optionally with parameters) to an
//! [`Orchestrator`]. For each placement, the orchestrator looks up the server-configured
//! [`TriggerRule`]s, evaluates their expressions against user attributes, device attributes and
//! event parameters, and assigns the user to one of the matched experiment's variants. The result
//! is an [`EvaluationOutcome`]: a paywall to show, a no-match with its reason, or an error.
//!
//! Assignments are sticky: once confirmed, a user keeps the same variant of an experiment until
//! [`Orchestrator::reset`] is called. The confirmed assignments and the assignment seed are
//! persisted through a [`KeyValueStore`] provided by the host.
//!
//! Rule expressions are written in a small CEL-like language (see [`expression`]). Besides plain
//! attributes, expressions can call computed properties such as
//! `platform.placementsInDay("campaign_trigger")`, which are answered from the
//! [`EventHistoryStore`].
//!
//! An [`OutcomeLogger`] should be provided to report trigger fires to your analytics pipeline.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation never returns an error directly:
//! failures are reported as [`EvaluationOutcome::Error`] with an [`ErrorKind`], and expression
//! errors make the affected rule not match.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target
//! `paywall_trigger` and structured key-values. Consider integrating a `log`-compatible logger
//! implementation for better visibility into evaluations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod assignment;
mod assignment_cache;
mod computed;
mod config;
mod error;
mod event_history;
pub mod expression;
mod ids;
mod matcher;
mod models;
mod orchestrator;
mod outcome_logger;
mod persistence;
mod rule_store;
mod value;

pub use assignment::{choose_variant, Seed, SEED_RANGE};
pub use assignment_cache::ConfirmedAssignmentCache;
pub use computed::ComputedPropertyResolver;
pub use config::{DeviceAttributesProvider, OrchestratorConfig};
pub use error::{AssignmentError, Error, ErrorKind, PersistenceError, Result, StoreError};
pub use event_history::{EventHistoryStore, EventRecord, InMemoryEventHistory};
pub use ids::{ExperimentGroupId, ExperimentId, VariantId};
pub use matcher::{EvaluationMode, NoMatchSource, OccurrenceMatcher, RuleMatch, UnmatchedRule};
pub use models::*;
pub use orchestrator::{EvaluationOutcome, Orchestrator, PendingEvaluation};
pub use outcome_logger::{OutcomeLogger, TriggerFireEvent};
pub use persistence::{
    InMemoryKeyValueStore, KeyValueStore, StorageKey, APP_USER_ID, CONFIRMED_ASSIGNMENTS, SEED,
    USER_ATTRIBUTES,
};
pub use rule_store::{RuleSource, RuleStore};
pub use value::{Attributes, Value};
