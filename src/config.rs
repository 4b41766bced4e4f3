use std::sync::Arc;

use crate::{
    event_history::EventHistoryStore,
    orchestrator::Orchestrator,
    outcome_logger::{NoopOutcomeLogger, OutcomeLogger},
    persistence::KeyValueStore,
    rule_store::RuleSource,
    Attributes, Result,
};

/// Provider of device attributes (locale, app version, etc.), exposed to expressions under
/// `device`. Queried once per evaluated rule.
///
/// Closures returning [`Attributes`] implement this trait.
pub trait DeviceAttributesProvider {
    #[allow(missing_docs)]
    fn device_attributes(&self) -> Attributes;
}

pub(crate) struct NoDeviceAttributes;
impl DeviceAttributesProvider for NoDeviceAttributes {
    fn device_attributes(&self) -> Attributes {
        Attributes::new()
    }
}

impl<T: Fn() -> Attributes> DeviceAttributesProvider for T {
    fn device_attributes(&self) -> Attributes {
        self()
    }
}

/// Configuration for [`Orchestrator`].
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use paywall_trigger::{InMemoryEventHistory, InMemoryKeyValueStore, OrchestratorConfig, RuleStore};
/// let rules = Arc::new(RuleStore::new());
/// let orchestrator = OrchestratorConfig::new(
///     Arc::new(InMemoryEventHistory::new()),
///     Arc::new(InMemoryKeyValueStore::new()),
///     rules.clone(),
/// )
/// .outcome_logger(|event| {
///     println!("{:?}", event);
/// })
/// .start()
/// .unwrap();
/// ```
pub struct OrchestratorConfig {
    pub(crate) event_history: Arc<dyn EventHistoryStore>,
    pub(crate) key_value_store: Arc<dyn KeyValueStore>,
    pub(crate) rule_source: Arc<dyn RuleSource>,
    pub(crate) device_attributes: Box<dyn DeviceAttributesProvider + Send + Sync>,
    pub(crate) outcome_logger: Box<dyn OutcomeLogger + Send + Sync>,
    pub(crate) seed_from_user_id: bool,
    pub(crate) thread_name: String,
}

impl OrchestratorConfig {
    /// Default name of the worker thread.
    pub const DEFAULT_THREAD_NAME: &'static str = "paywall-trigger";

    /// Create a configuration with the required collaborators.
    pub fn new(
        event_history: Arc<dyn EventHistoryStore>,
        key_value_store: Arc<dyn KeyValueStore>,
        rule_source: Arc<dyn RuleSource>,
    ) -> Self {
        OrchestratorConfig {
            event_history,
            key_value_store,
            rule_source,
            device_attributes: Box::new(NoDeviceAttributes),
            outcome_logger: Box::new(NoopOutcomeLogger),
            seed_from_user_id: false,
            thread_name: OrchestratorConfig::DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    /// Set provider of device attributes.
    pub fn device_attributes(
        mut self,
        provider: impl DeviceAttributesProvider + Send + Sync + 'static,
    ) -> Self {
        self.device_attributes = Box::new(provider);
        self
    }

    /// Set logger to report trigger fires to your analytics pipeline.
    pub fn outcome_logger(mut self, logger: impl OutcomeLogger + Send + Sync + 'static) -> Self {
        self.outcome_logger = Box::new(logger);
        self
    }

    /// Derive the assignment seed from the user id on
    /// [`identify`](Orchestrator::identify), so that a user gets the same variants on all
    /// devices. Defaults to `false` (random seed per installation).
    pub fn seed_from_user_id(mut self, enabled: bool) -> Self {
        self.seed_from_user_id = enabled;
        self
    }

    /// Override name of the worker thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Start an [`Orchestrator`] using this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the worker thread or its runtime could not be
    /// started.
    pub fn start(self) -> Result<Orchestrator> {
        Orchestrator::start(self)
    }
}
