//! Placement evaluation orchestrator.
//!
//! All work that reads or writes assignment state runs on a single worker thread, one command at a
//! time, in submission order. That gives two guarantees without any further locking:
//!
//! - an evaluation sees every cache write made by evaluations submitted before it;
//! - concurrent identical evaluations (same event name, parameters and rule set) are coalesced
//!   into one. Only the first caller enqueues work; later callers join it and receive the same
//!   outcome.
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    assignment::{choose_variant, Seed},
    assignment_cache::ConfirmedAssignmentCache,
    computed::ComputedPropertyResolver,
    config::{DeviceAttributesProvider, OrchestratorConfig},
    error::{Error, ErrorKind, PersistenceError},
    event_history::{EventHistoryStore, EventRecord},
    expression::EvaluationContext,
    matcher::{EvaluationMode, NoMatchSource, OccurrenceMatcher, RuleMatch},
    models::{
        Experiment, PreloadBehavior, RuleSet, ServerAssignment, TriggerRule, Variant,
        VariantOption, VariantType,
    },
    outcome_logger::{OutcomeLogger, TriggerFireEvent},
    persistence::{KeyValueStore, APP_USER_ID, USER_ATTRIBUTES},
    rule_store::RuleSource,
    Attributes, ExperimentId, Result, Value,
};

/// Result of evaluating a placement.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// A rule matched and the user is assigned to a treatment variant: show its paywall.
    Match {
        #[allow(missing_docs)]
        rule: Arc<TriggerRule>,
        #[allow(missing_docs)]
        variant: Variant,
        #[allow(missing_docs)]
        experiment_id: ExperimentId,
    },
    /// No paywall should be shown. `experiment_id` is the experiment of the matched rule (for
    /// holdouts) or of the last evaluated rule.
    NoMatch {
        #[allow(missing_docs)]
        source: NoMatchSource,
        #[allow(missing_docs)]
        experiment_id: ExperimentId,
    },
    /// There are no rules for this event.
    EventNotFound {
        #[allow(missing_docs)]
        event_name: String,
    },
    /// Evaluation failed and no decision could be made.
    Error {
        #[allow(missing_docs)]
        kind: ErrorKind,
    },
}

impl EvaluationOutcome {
    /// Paywall to show, if any.
    pub fn paywall_id(&self) -> Option<&str> {
        match self {
            EvaluationOutcome::Match { variant, .. } => variant.paywall_id.as_deref(),
            _ => None,
        }
    }

    /// Experiment the outcome is attributed to, if any.
    pub fn experiment_id(&self) -> Option<&ExperimentId> {
        match self {
            EvaluationOutcome::Match { experiment_id, .. }
            | EvaluationOutcome::NoMatch { experiment_id, .. } => Some(experiment_id),
            EvaluationOutcome::EventNotFound { .. } | EvaluationOutcome::Error { .. } => None,
        }
    }

    fn error(err: &Error) -> EvaluationOutcome {
        EvaluationOutcome::Error { kind: err.kind() }
    }
}

/// Requests that are considered identical for coalescing. Event timestamps are ignored: a joined
/// caller gets the outcome computed for the first caller's event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoalesceKey {
    event_name: String,
    /// Parameters serialized with sorted keys.
    parameters: String,
    generation: u64,
}

impl CoalesceKey {
    fn new(event: &EventRecord, generation: u64) -> CoalesceKey {
        let parameters = event.parameters.iter().collect::<BTreeMap<&String, &Value>>();
        CoalesceKey {
            event_name: event.name.clone(),
            parameters: serde_json::to_string(&parameters)
                .unwrap_or_else(|_| format!("{parameters:?}")),
            generation,
        }
    }
}

type InFlight = Mutex<HashMap<CoalesceKey, Vec<oneshot::Sender<EvaluationOutcome>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Command {
    Evaluate {
        key: CoalesceKey,
        event: EventRecord,
        rules: Arc<RuleSet>,
    },
    Preview {
        event: EventRecord,
        rules: Arc<RuleSet>,
        reply: oneshot::Sender<EvaluationOutcome>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    Identify {
        user_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetUserAttributes {
        attributes: Attributes,
        reply: oneshot::Sender<Result<()>>,
    },
    RestoreAssignments {
        assignments: Vec<ServerAssignment>,
        rules: Arc<RuleSet>,
        reply: oneshot::Sender<Result<usize>>,
    },
    PreloadablePaywalls {
        rules: Arc<RuleSet>,
        reply: oneshot::Sender<Result<BTreeSet<String>>>,
    },
}

/// An evaluation submitted with [`Orchestrator::submit`].
///
/// Await it from async code or call [`wait`](PendingEvaluation::wait) from a plain thread.
#[must_use = "the outcome is only available through the pending evaluation"]
pub struct PendingEvaluation {
    receiver: oneshot::Receiver<EvaluationOutcome>,
}

impl PendingEvaluation {
    /// Block the current thread until the outcome is available.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context. Use `.await` there.
    pub fn wait(self) -> EvaluationOutcome {
        self.receiver.blocking_recv().unwrap_or(EvaluationOutcome::Error {
            kind: ErrorKind::WorkerUnavailable,
        })
    }
}

impl Future for PendingEvaluation {
    type Output = EvaluationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EvaluationOutcome> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or(EvaluationOutcome::Error {
                kind: ErrorKind::WorkerUnavailable,
            })
        })
    }
}

/// Evaluates placements against the active rule set and keeps assignments sticky.
///
/// Created with [`OrchestratorConfig::start`]. The orchestrator is `Send + Sync`: wrap it in an
/// `Arc` to share between threads.
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    in_flight: Arc<InFlight>,
    rule_source: Arc<dyn RuleSource>,
    assignments: Arc<ConfirmedAssignmentCache>,
    join_handle: std::thread::JoinHandle<()>,
    panicked: Arc<AtomicBool>,
}

impl Orchestrator {
    pub(crate) fn start(config: OrchestratorConfig) -> Result<Orchestrator> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let in_flight = Arc::new(InFlight::default());
        let assignments = Arc::new(ConfirmedAssignmentCache::new(
            config.key_value_store.clone(),
        ));
        let panicked = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            event_history: config.event_history,
            store: config.key_value_store,
            assignments: assignments.clone(),
            device_attributes: config.device_attributes,
            outcome_logger: config.outcome_logger,
            seed_from_user_id: config.seed_from_user_id,
            in_flight: in_flight.clone(),
            user: None,
        };

        let join_handle = {
            let in_flight = in_flight.clone();
            let panicked = panicked.clone();
            std::thread::Builder::new()
                .name(config.thread_name)
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        runtime.block_on(worker.run(receiver))
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if result.is_err() {
                        log::error!(target: "paywall_trigger", "orchestrator worker panicked");
                        panicked.store(true, Ordering::SeqCst);
                    }

                    // Evaluations still in flight will never complete. Dropping their senders
                    // wakes up the waiting callers.
                    lock(&in_flight).clear();
                })?
        };

        Ok(Orchestrator {
            commands,
            in_flight,
            rule_source: config.rule_source,
            assignments,
            join_handle,
            panicked,
        })
    }

    /// Submit a placement for evaluation.
    ///
    /// The placement is recorded in the event history, the matched rule's occurrence is recorded
    /// and the assigned variant is confirmed. If an identical evaluation is already in flight, this
    /// joins it instead of evaluating again.
    pub fn submit(&self, event: EventRecord) -> PendingEvaluation {
        let rules = self.rule_source.rule_set();
        let key = CoalesceKey::new(&event, rules.generation);
        let (sender, receiver) = oneshot::channel();

        let is_new = match lock(&self.in_flight).entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(sender);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![sender]);
                true
            }
        };

        if is_new {
            log::trace!(target: "paywall_trigger", event_name = event.name.as_str(); "submitting placement");
            let command = Command::Evaluate {
                key: key.clone(),
                event,
                rules,
            };
            if self.commands.send(command).is_err() {
                // Worker is gone. Dropping the senders resolves every waiter with an error.
                lock(&self.in_flight).remove(&key);
            }
        } else {
            log::trace!(target: "paywall_trigger", event_name = event.name.as_str(); "joining in-flight evaluation");
        }

        PendingEvaluation { receiver }
    }

    /// Evaluate a placement. See [`submit`](Self::submit).
    pub async fn evaluate(&self, event: EventRecord) -> EvaluationOutcome {
        self.submit(event).await
    }

    /// Evaluate a placement, blocking the current thread. See [`submit`](Self::submit).
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn evaluate_blocking(&self, event: EventRecord) -> EvaluationOutcome {
        self.submit(event).wait()
    }

    /// Evaluate a placement without side effects: nothing is recorded, no assignment is confirmed
    /// and no trigger fire is reported. Used to decide whether a paywall can be preloaded.
    pub async fn evaluate_preview(&self, event: EventRecord) -> EvaluationOutcome {
        let rules = self.rule_source.rule_set();
        let result = self
            .request(|reply| Command::Preview {
                event,
                rules,
                reply,
            })
            .await;
        result.unwrap_or_else(|err| EvaluationOutcome::error(&err))
    }

    /// Clear confirmed assignments, user attributes and user id, and draw a new seed.
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    /// Associate subsequent evaluations with `user_id`.
    ///
    /// Identifying as a different user than the current one resets assignment state first.
    pub async fn identify(&self, user_id: impl Into<String>) -> Result<()> {
        let user_id = user_id.into();
        self.request(|reply| Command::Identify { user_id, reply })
            .await?
    }

    /// Merge attributes into the persisted user attributes. `Value::Null` removes an attribute.
    pub async fn set_user_attributes(&self, attributes: Attributes) -> Result<()> {
        self.request(|reply| Command::SetUserAttributes { attributes, reply })
            .await?
    }

    /// Merge authoritative assignments from the server into the confirmed assignment cache.
    /// Returns the number of assignments applied.
    pub async fn restore_assignments(&self, assignments: Vec<ServerAssignment>) -> Result<usize> {
        let rules = self.rule_source.rule_set();
        self.request(|reply| Command::RestoreAssignments {
            assignments,
            rules,
            reply,
        })
        .await?
    }

    /// Paywalls worth preloading ahead of their placements.
    ///
    /// Covers the treatment paywall of every experiment in the active rules, using the confirmed
    /// variant if there is one and the variant the user would be assigned otherwise. Each rule's
    /// [`PreloadPolicy`](crate::PreloadPolicy) filters its experiment: `ALWAYS` keeps it, `NEVER`
    /// drops it and `IF_TRUE` keeps it only if the rule's expression currently holds (evaluated
    /// without event parameters). Nothing is recorded or confirmed.
    pub async fn preloadable_paywall_ids(&self) -> Result<BTreeSet<String>> {
        let rules = self.rule_source.rule_set();
        self.request(|reply| Command::PreloadablePaywalls { rules, reply })
            .await?
    }

    /// Snapshot of confirmed assignments.
    pub fn confirmed_assignments(&self) -> Arc<HashMap<ExperimentId, Variant>> {
        self.assignments.confirmed_assignments()
    }

    /// Stop the worker after it has finished all submitted work, and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPanicked`] if the worker thread panicked.
    pub fn shutdown(self) -> Result<()> {
        let Orchestrator {
            commands,
            join_handle,
            panicked,
            ..
        } = self;
        drop(commands);
        join_handle.join().map_err(|_| Error::WorkerPanicked)?;
        if panicked.load(Ordering::SeqCst) {
            return Err(Error::WorkerPanicked);
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::WorkerUnavailable)?;
        receiver.await.map_err(|_| Error::WorkerUnavailable)
    }
}

#[derive(Debug, Default)]
struct UserState {
    attributes: Attributes,
    app_user_id: Option<String>,
}

struct Worker {
    event_history: Arc<dyn EventHistoryStore>,
    store: Arc<dyn KeyValueStore>,
    assignments: Arc<ConfirmedAssignmentCache>,
    device_attributes: Box<dyn DeviceAttributesProvider + Send + Sync>,
    outcome_logger: Box<dyn OutcomeLogger + Send + Sync>,
    seed_from_user_id: bool,
    in_flight: Arc<InFlight>,
    /// Loaded from the store on first use.
    user: Option<UserState>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::debug!(target: "paywall_trigger", "orchestrator worker started");
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        log::debug!(target: "paywall_trigger", "orchestrator worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Evaluate { key, event, rules } => {
                let outcome = self
                    .evaluate(&event, &rules, EvaluationMode::Commit)
                    .await;
                let waiters = lock(&self.in_flight).remove(&key).unwrap_or_default();
                for waiter in waiters {
                    // The caller may have stopped waiting.
                    let _ = waiter.send(outcome.clone());
                }
            }
            Command::Preview {
                event,
                rules,
                reply,
            } => {
                let outcome = self
                    .evaluate(&event, &rules, EvaluationMode::Preview)
                    .await;
                let _ = reply.send(outcome);
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.reset().await);
            }
            Command::Identify { user_id, reply } => {
                let _ = reply.send(self.identify(user_id).await);
            }
            Command::SetUserAttributes { attributes, reply } => {
                let _ = reply.send(self.set_user_attributes(attributes).await);
            }
            Command::RestoreAssignments {
                assignments,
                rules,
                reply,
            } => {
                let result = self
                    .assignments
                    .restore(&assignments, &rules)
                    .await
                    .map_err(Error::from);
                let _ = reply.send(result);
            }
            Command::PreloadablePaywalls { rules, reply } => {
                let _ = reply.send(self.preloadable_paywall_ids(&rules).await);
            }
        }
    }

    async fn load_user(&mut self) -> std::result::Result<&mut UserState, PersistenceError> {
        if self.user.is_none() {
            let attributes = USER_ATTRIBUTES
                .read(&*self.store)
                .await?
                .unwrap_or_default();
            let app_user_id = APP_USER_ID.read(&*self.store).await?;
            self.user = Some(UserState {
                attributes,
                app_user_id,
            });
        }
        Ok(self.user.get_or_insert_with(UserState::default))
    }

    async fn evaluate(
        &mut self,
        event: &EventRecord,
        rules: &RuleSet,
        mode: EvaluationMode,
    ) -> EvaluationOutcome {
        let user_attributes = match self.load_user().await {
            Ok(user) => user.attributes.clone(),
            Err(err) => {
                log::warn!(target: "paywall_trigger", "failed to load user attributes: {err}");
                return EvaluationOutcome::error(&err.into());
            }
        };

        if mode == EvaluationMode::Commit {
            if let Err(err) = self.event_history.append(event).await {
                log::warn!(target: "paywall_trigger",
                           event_name = event.name.as_str();
                           "failed to record placement: {err}");
            }
        }

        let Some(candidates) = rules.rules_for(&event.name) else {
            log::debug!(target: "paywall_trigger", event_name = event.name.as_str(); "no trigger for event");
            return EvaluationOutcome::EventNotFound {
                event_name: event.name.clone(),
            };
        };

        let resolver = ComputedPropertyResolver::new(self.event_history.clone(), event.timestamp);
        let matcher = OccurrenceMatcher::new(&*self.event_history);
        let mut last_unmatched = None;
        for rule in candidates {
            let matched = self
                .evaluate_expression(rule, &event.parameters, &user_attributes, &resolver)
                .await;
            match matcher
                .match_rule(rule, matched, mode, event.timestamp)
                .await
            {
                RuleMatch::Matched(rule) => return self.assign(event, rule, mode).await,
                RuleMatch::NoMatch(unmatched) => {
                    log::trace!(target: "paywall_trigger",
                                experiment_id = unmatched.experiment_id,
                                source:serde = unmatched.source;
                                "rule did not match");
                    last_unmatched = Some(unmatched);
                }
            }
        }

        match last_unmatched {
            Some(unmatched) => EvaluationOutcome::NoMatch {
                source: unmatched.source,
                experiment_id: unmatched.experiment_id,
            },
            None => EvaluationOutcome::EventNotFound {
                event_name: event.name.clone(),
            },
        }
    }

    async fn evaluate_expression(
        &self,
        rule: &TriggerRule,
        parameters: &Attributes,
        user_attributes: &Attributes,
        resolver: &ComputedPropertyResolver,
    ) -> bool {
        let mut device = self.device_attributes.device_attributes();
        device.extend(resolver.prefill(&rule.computed_property_requests).await);
        let ctx = EvaluationContext::new(user_attributes.clone(), device, parameters.clone());

        match rule.evaluate_expression(&ctx, resolver).await {
            Ok(matched) => matched,
            Err(err) => {
                log::warn!(target: "paywall_trigger",
                           experiment_id = rule.experiment_id;
                           "failed to evaluate rule expression: {err}");
                false
            }
        }
    }

    async fn assign(
        &self,
        event: &EventRecord,
        rule: Arc<TriggerRule>,
        mode: EvaluationMode,
    ) -> EvaluationOutcome {
        let choose =
            |seed: Seed| choose_variant(&rule.variants, seed).map(VariantOption::to_variant);
        let result = match mode {
            EvaluationMode::Commit => {
                self.assignments
                    .get_or_assign(&rule.experiment_id, choose)
                    .await
            }
            EvaluationMode::Preview => {
                self.assignments
                    .peek_or_assign(&rule.experiment_id, choose)
                    .await
            }
        };
        let variant = match result {
            Ok(variant) => variant,
            Err(err) => {
                log::warn!(target: "paywall_trigger",
                           experiment_id = rule.experiment_id;
                           "failed to assign variant: {err}");
                return EvaluationOutcome::error(&err);
            }
        };

        log::debug!(target: "paywall_trigger",
                    experiment_id = rule.experiment_id,
                    variant_id = variant.id;
                    "assigned variant");

        if mode == EvaluationMode::Commit {
            let experiment = Experiment {
                id: rule.experiment_id.clone(),
                group_id: rule.experiment_group_id.clone(),
                variant: variant.clone(),
            };
            self.outcome_logger
                .log_trigger_fire(TriggerFireEvent::new(&event.name, experiment, event.timestamp));
        }

        match variant.variant_type {
            VariantType::Holdout => EvaluationOutcome::NoMatch {
                source: NoMatchSource::Holdout,
                experiment_id: rule.experiment_id.clone(),
            },
            VariantType::Treatment => EvaluationOutcome::Match {
                experiment_id: rule.experiment_id.clone(),
                variant,
                rule,
            },
        }
    }

    async fn reset(&mut self) -> Result<()> {
        // Reloaded from the store if any of the steps below fails.
        self.user = None;
        self.assignments.reset().await?;
        USER_ATTRIBUTES.delete(&*self.store).await?;
        APP_USER_ID.delete(&*self.store).await?;
        self.user = Some(UserState::default());
        Ok(())
    }

    async fn preloadable_paywall_ids(&mut self, rules: &RuleSet) -> Result<BTreeSet<String>> {
        let user_attributes = self.load_user().await?.attributes.clone();
        let seed = self.assignments.seed().await?;
        let confirmed = self.assignments.confirmed_assignments();
        let resolver = ComputedPropertyResolver::new(self.event_history.clone(), chrono::Utc::now());
        let no_parameters = Attributes::new();

        let mut variants: HashMap<&ExperimentId, Variant> = HashMap::new();
        let mut skipped: HashSet<&ExperimentId> = HashSet::new();
        for rule in rules.all_rules() {
            let expression_matched = match rule.preload.behavior {
                PreloadBehavior::IfTrue => {
                    self.evaluate_expression(rule, &no_parameters, &user_attributes, &resolver)
                        .await
                }
                PreloadBehavior::Always | PreloadBehavior::Never => true,
            };
            if !rule.preload.allows_preload(expression_matched) {
                skipped.insert(&rule.experiment_id);
            }

            if variants.contains_key(&rule.experiment_id) {
                continue;
            }
            let variant = match confirmed.get(&rule.experiment_id) {
                Some(variant) => Some(variant.clone()),
                None => choose_variant(&rule.variants, seed)
                    .map(VariantOption::to_variant)
                    .ok(),
            };
            if let Some(variant) = variant {
                variants.insert(&rule.experiment_id, variant);
            }
        }

        Ok(variants
            .into_iter()
            .filter(|(experiment_id, variant)| {
                !skipped.contains(experiment_id) && variant.variant_type == VariantType::Treatment
            })
            .filter_map(|(_, variant)| variant.paywall_id)
            .collect())
    }

    async fn identify(&mut self, user_id: String) -> Result<()> {
        let current = self.load_user().await?.app_user_id.clone();
        if current.as_deref() == Some(user_id.as_str()) {
            return Ok(());
        }
        if current.is_some() {
            log::debug!(target: "paywall_trigger", "identified as a different user, resetting");
            self.reset().await?;
        }

        APP_USER_ID.write(&*self.store, &user_id).await?;
        if self.seed_from_user_id {
            self.assignments
                .set_seed(Seed::from_user_id(&user_id))
                .await?;
        }
        let attributes = Attributes::from([("appUserId".to_owned(), Value::from(user_id.as_str()))]);
        self.load_user().await?.app_user_id = Some(user_id);
        self.set_user_attributes(attributes).await
    }

    async fn set_user_attributes(&mut self, attributes: Attributes) -> Result<()> {
        let mut merged = self.load_user().await?.attributes.clone();
        for (key, value) in attributes {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        USER_ATTRIBUTES.write(&*self.store, &merged).await?;
        self.load_user().await?.attributes = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::EvaluationOutcome;
    use crate::{
        assignment::Seed,
        error::{ErrorKind, PersistenceError, StoreError},
        event_history::{EventHistoryStore, EventRecord, InMemoryEventHistory},
        matcher::NoMatchSource,
        models::{Timestamp, TriggerConfig},
        outcome_logger::TriggerFireEvent,
        persistence::{InMemoryKeyValueStore, KeyValueStore, APP_USER_ID, SEED},
        rule_store::RuleStore,
        Attributes, OrchestratorConfig, ServerAssignment, Value,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn rules(config: serde_json::Value) -> Arc<RuleStore> {
        let store = Arc::new(RuleStore::new());
        store.set_config(serde_json::from_value::<TriggerConfig>(config).unwrap());
        store
    }

    fn campaign_rules() -> Arc<RuleStore> {
        rules(serde_json::json!({
            "triggers": [
                {
                    "eventName": "campaign_trigger",
                    "rules": [{
                        "experimentId": "exp-free",
                        "experimentGroupId": "group",
                        "expression": "user.plan == 'free'",
                        "variants": [
                            {"id": "treatment", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-1"}
                        ]
                    }]
                },
                {
                    "eventName": "holdout_trigger",
                    "rules": [{
                        "experimentId": "exp-holdout",
                        "experimentGroupId": "group",
                        "variants": [{"id": "holdout", "type": "HOLDOUT", "percentage": 100}]
                    }]
                },
                {
                    "eventName": "fallthrough",
                    "rules": [
                        {
                            "experimentId": "exp-first",
                            "experimentGroupId": "group",
                            "expression": "params.count > 10",
                            "variants": [{"id": "a", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-a"}]
                        },
                        {
                            "experimentId": "exp-second",
                            "experimentGroupId": "group",
                            "expression": "params.count > 1",
                            "variants": [{"id": "b", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-b"}]
                        }
                    ]
                }
            ]
        }))
    }

    fn free_user() -> Attributes {
        Attributes::from([("plan".to_owned(), Value::from("free"))])
    }

    #[tokio::test]
    async fn matches_and_reports_trigger_fire() {
        init();
        let history = Arc::new(InMemoryEventHistory::new());
        let fired = Arc::new(Mutex::new(Vec::<TriggerFireEvent>::new()));
        let orchestrator = {
            let fired = fired.clone();
            OrchestratorConfig::new(
                history.clone(),
                Arc::new(InMemoryKeyValueStore::new()),
                campaign_rules(),
            )
            .outcome_logger(move |event| fired.lock().unwrap().push(event))
            .start()
            .unwrap()
        };
        orchestrator.set_user_attributes(free_user()).await.unwrap();

        let outcome = orchestrator
            .evaluate(EventRecord::new("campaign_trigger"))
            .await;

        assert_eq!(outcome.paywall_id(), Some("pw-1"));
        assert_eq!(outcome.experiment_id().map(|id| id.as_str()), Some("exp-free"));
        assert_eq!(history.len("campaign_trigger"), 1);
        assert_eq!(history.len("$occurrence:exp-free"), 1);
        assert_eq!(orchestrator.confirmed_assignments().len(), 1);

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_name, "campaign_trigger");
        assert!(!fired[0].holdout);
    }

    #[tokio::test]
    async fn unmatched_expression_reports_no_match() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();
        orchestrator
            .set_user_attributes(Attributes::from([("plan".to_owned(), Value::from("pro"))]))
            .await
            .unwrap();

        let outcome = orchestrator
            .evaluate(EventRecord::new("campaign_trigger"))
            .await;

        assert_eq!(
            outcome,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Expression,
                experiment_id: "exp-free".into(),
            }
        );
        assert!(orchestrator.confirmed_assignments().is_empty());
    }

    #[tokio::test]
    async fn missing_attribute_is_no_match() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();

        let outcome = orchestrator
            .evaluate(EventRecord::new("campaign_trigger"))
            .await;

        assert!(matches!(
            outcome,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Expression,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn holdout_is_confirmed_and_reported() {
        let fired = Arc::new(Mutex::new(0));
        let orchestrator = {
            let fired = fired.clone();
            OrchestratorConfig::new(
                Arc::new(InMemoryEventHistory::new()),
                Arc::new(InMemoryKeyValueStore::new()),
                campaign_rules(),
            )
            .outcome_logger(move |event: TriggerFireEvent| {
                assert!(event.holdout);
                *fired.lock().unwrap() += 1;
            })
            .start()
            .unwrap()
        };

        let outcome = orchestrator
            .evaluate(EventRecord::new("holdout_trigger"))
            .await;

        assert_eq!(
            outcome,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Holdout,
                experiment_id: "exp-holdout".into(),
            }
        );
        assert!(orchestrator
            .confirmed_assignments()
            .contains_key("exp-holdout"));
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();
        let event = |count: i64| {
            EventRecord::new("fallthrough")
                .with_parameters(Attributes::from([("count".to_owned(), Value::Int(count))]))
        };

        assert_eq!(orchestrator.evaluate(event(5)).await.paywall_id(), Some("pw-b"));
        assert_eq!(orchestrator.evaluate(event(50)).await.paywall_id(), Some("pw-a"));
        assert_eq!(
            orchestrator.evaluate(event(0)).await,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Expression,
                experiment_id: "exp-second".into(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_event_is_not_found_but_recorded() {
        let history = Arc::new(InMemoryEventHistory::new());
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();

        let outcome = orchestrator.evaluate(EventRecord::new("app_open")).await;

        assert_eq!(
            outcome,
            EvaluationOutcome::EventNotFound {
                event_name: "app_open".to_owned()
            }
        );
        assert_eq!(history.len("app_open"), 1);
    }

    #[tokio::test]
    async fn preview_has_no_side_effects() {
        let history = Arc::new(InMemoryEventHistory::new());
        let fired = Arc::new(Mutex::new(0));
        let orchestrator = {
            let fired = fired.clone();
            OrchestratorConfig::new(
                history.clone(),
                Arc::new(InMemoryKeyValueStore::new()),
                campaign_rules(),
            )
            .outcome_logger(move |_| *fired.lock().unwrap() += 1)
            .start()
            .unwrap()
        };
        orchestrator.set_user_attributes(free_user()).await.unwrap();

        let outcome = orchestrator
            .evaluate_preview(EventRecord::new("campaign_trigger"))
            .await;

        assert_eq!(outcome.paywall_id(), Some("pw-1"));
        assert_eq!(history.len("campaign_trigger"), 0);
        assert_eq!(history.len("$occurrence:exp-free"), 0);
        assert!(orchestrator.confirmed_assignments().is_empty());
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn computed_properties_see_recorded_placements() {
        let store = rules(serde_json::json!({
            "triggers": [{
                "eventName": "campaign_trigger",
                "rules": [{
                    "experimentId": "exp",
                    "experimentGroupId": "group",
                    "expression": "platform.placementsInDay('campaign_trigger') >= 3 && device.daysSince_signup < 7",
                    "computedPropertyRequests": [{"type": "DAYS_SINCE", "eventName": "signup"}],
                    "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw"}]
                }]
            }]
        }));
        let history = Arc::new(InMemoryEventHistory::new());
        history
            .append(&EventRecord::new("signup").at(chrono::Utc::now() - chrono::Duration::days(2)))
            .await
            .unwrap();
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .start()
        .unwrap();

        // The placement being evaluated counts too.
        let first = orchestrator.evaluate(EventRecord::new("campaign_trigger")).await;
        let second = orchestrator.evaluate(EventRecord::new("campaign_trigger")).await;
        let third = orchestrator.evaluate(EventRecord::new("campaign_trigger")).await;

        assert!(matches!(first, EvaluationOutcome::NoMatch { .. }));
        assert!(matches!(second, EvaluationOutcome::NoMatch { .. }));
        assert_eq!(third.paywall_id(), Some("pw"));
    }

    #[tokio::test]
    async fn never_seen_event_counts_as_zero_days_ago() {
        let store = rules(serde_json::json!({
            "triggers": [{
                "eventName": "e",
                "rules": [{
                    "experimentId": "exp",
                    "experimentGroupId": "group",
                    "expression": "platform.daysSince('signup') >= 3",
                    "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw"}]
                }]
            }]
        }));
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .start()
        .unwrap();

        assert_eq!(
            orchestrator.evaluate(EventRecord::new("e")).await,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Expression,
                experiment_id: "exp".into(),
            }
        );
    }

    #[tokio::test]
    async fn device_attributes_are_visible_to_expressions() {
        let store = rules(serde_json::json!({
            "triggers": [{
                "eventName": "e",
                "rules": [{
                    "experimentId": "exp",
                    "experimentGroupId": "group",
                    "expression": "device.appVersion >= '2.10.0'",
                    "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw"}]
                }]
            }]
        }));
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .device_attributes(|| Attributes::from([("appVersion".to_owned(), Value::from("2.10.1"))]))
        .start()
        .unwrap();

        assert_eq!(
            orchestrator.evaluate(EventRecord::new("e")).await.paywall_id(),
            Some("pw")
        );
    }

    /// Event history whose appends and range counts wait for permits. Counts reads.
    struct GatedHistory {
        inner: InMemoryEventHistory,
        appends: Semaphore,
        counts: Semaphore,
        reads: AtomicUsize,
    }

    impl GatedHistory {
        fn new(append_permits: usize, count_permits: usize) -> Arc<GatedHistory> {
            Arc::new(GatedHistory {
                inner: InMemoryEventHistory::new(),
                appends: Semaphore::new(append_permits),
                counts: Semaphore::new(count_permits),
                reads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHistoryStore for GatedHistory {
        async fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
            let _permit = self
                .appends
                .acquire()
                .await
                .map_err(|err| StoreError(err.to_string()))?;
            self.inner.append(event).await
        }

        async fn count_in_range(
            &self,
            name: &str,
            start: Timestamp,
            end: Timestamp,
        ) -> Result<u64, StoreError> {
            let _permit = self
                .counts
                .acquire()
                .await
                .map_err(|err| StoreError(err.to_string()))?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.count_in_range(name, start, end).await
        }

        async fn most_recent(&self, name: &str) -> Result<Option<Timestamp>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.most_recent(name).await
        }
    }

    #[tokio::test]
    async fn coalesces_identical_concurrent_evaluations() {
        let history = GatedHistory::new(0, Semaphore::MAX_PERMITS);
        let fired = Arc::new(Mutex::new(0));
        let orchestrator = {
            let fired = fired.clone();
            OrchestratorConfig::new(
                history.clone(),
                Arc::new(InMemoryKeyValueStore::new()),
                campaign_rules(),
            )
            .outcome_logger(move |_| *fired.lock().unwrap() += 1)
            .start()
            .unwrap()
        };

        // The worker is stuck on the first append until the gate opens, so every submission below
        // finds the first one in flight.
        let pending = (0..5)
            .map(|_| orchestrator.submit(EventRecord::new("holdout_trigger")))
            .collect::<Vec<_>>();
        history.appends.add_permits(100);

        let mut outcomes = Vec::new();
        for pending in pending {
            outcomes.push(pending.await);
        }

        assert!(outcomes.iter().all(|outcome| outcome == &outcomes[0]));
        assert!(matches!(outcomes[0], EvaluationOutcome::NoMatch { .. }));
        assert_eq!(history.inner.len("holdout_trigger"), 1);
        assert_eq!(history.inner.len("$occurrence:exp-holdout"), 1);
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn different_parameters_are_not_coalesced() {
        let history = GatedHistory::new(0, Semaphore::MAX_PERMITS);
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();

        let event = |source: &str| {
            EventRecord::new("holdout_trigger")
                .with_parameters(Attributes::from([("source".to_owned(), Value::from(source))]))
        };
        let first = orchestrator.submit(event("a"));
        let second = orchestrator.submit(event("b"));
        history.appends.add_permits(100);
        first.await;
        second.await;

        assert_eq!(history.inner.len("holdout_trigger"), 2);
    }

    #[tokio::test]
    async fn later_evaluations_see_earlier_assignments() {
        // Both events share one experiment, but with weights that would pick different variants.
        // Only A reads a computed property.
        let store = rules(serde_json::json!({
            "triggers": [
                {
                    "eventName": "a",
                    "rules": [{
                        "experimentId": "exp",
                        "experimentGroupId": "group",
                        "expression": "platform.placementsInDay('a') >= 0",
                        "variants": [
                            {"id": "v1", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-1"},
                            {"id": "v2", "type": "TREATMENT", "percentage": 0, "paywallId": "pw-2"}
                        ]
                    }]
                },
                {
                    "eventName": "b",
                    "rules": [{
                        "experimentId": "exp",
                        "experimentGroupId": "group",
                        "variants": [
                            {"id": "v1", "type": "TREATMENT", "percentage": 0, "paywallId": "pw-1"},
                            {"id": "v2", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-2"}
                        ]
                    }]
                }
            ]
        }));
        let history = GatedHistory::new(Semaphore::MAX_PERMITS, 0);
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .start()
        .unwrap();

        let a = orchestrator.submit(EventRecord::new("a"));
        let mut b = orchestrator.submit(EventRecord::new("b"));

        // A is stuck on its computed property and B waits behind it.
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut b)
            .await
            .is_err());
        history.counts.add_permits(1);

        assert_eq!(a.await.paywall_id(), Some("pw-1"));
        assert_eq!(b.await.paywall_id(), Some("pw-1"));
    }

    #[tokio::test]
    async fn reset_clears_assignments_and_attributes() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            kv.clone(),
            campaign_rules(),
        )
        .start()
        .unwrap();
        orchestrator.set_user_attributes(free_user()).await.unwrap();
        orchestrator
            .evaluate(EventRecord::new("campaign_trigger"))
            .await;
        assert_eq!(orchestrator.confirmed_assignments().len(), 1);

        orchestrator.reset().await.unwrap();
        orchestrator.reset().await.unwrap();

        assert!(orchestrator.confirmed_assignments().is_empty());
        assert_eq!(kv.read("store.userAttributes").await.unwrap(), None);
        // user.plan is gone, so the rule no longer matches
        assert!(matches!(
            orchestrator
                .evaluate(EventRecord::new("campaign_trigger"))
                .await,
            EvaluationOutcome::NoMatch { .. }
        ));
    }

    #[tokio::test]
    async fn set_user_attributes_merges_and_removes_nulls() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            kv.clone(),
            campaign_rules(),
        )
        .start()
        .unwrap();

        orchestrator
            .set_user_attributes(Attributes::from([
                ("plan".to_owned(), Value::from("free")),
                ("age".to_owned(), Value::Int(30)),
            ]))
            .await
            .unwrap();
        orchestrator
            .set_user_attributes(Attributes::from([("age".to_owned(), Value::Null)]))
            .await
            .unwrap();

        assert_eq!(
            kv.read("store.userAttributes").await.unwrap(),
            Some(serde_json::json!({"plan": "free"}))
        );
    }

    #[tokio::test]
    async fn identify_resets_on_user_change_and_seeds_from_user_id() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            kv.clone(),
            campaign_rules(),
        )
        .seed_from_user_id(true)
        .start()
        .unwrap();

        orchestrator.identify("user-1").await.unwrap();
        orchestrator
            .set_user_attributes(free_user())
            .await
            .unwrap();
        orchestrator
            .evaluate(EventRecord::new("campaign_trigger"))
            .await;
        assert_eq!(
            SEED.read(&*kv).await.unwrap(),
            Some(Seed::from_user_id("user-1"))
        );

        // Same user: nothing changes.
        orchestrator.identify("user-1").await.unwrap();
        assert_eq!(orchestrator.confirmed_assignments().len(), 1);

        orchestrator.identify("user-2").await.unwrap();
        assert!(orchestrator.confirmed_assignments().is_empty());
        assert_eq!(
            SEED.read(&*kv).await.unwrap(),
            Some(Seed::from_user_id("user-2"))
        );
        assert_eq!(
            kv.read("store.userAttributes").await.unwrap(),
            Some(serde_json::json!({"appUserId": "user-2"}))
        );
    }

    #[tokio::test]
    async fn restores_server_assignments() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            campaign_rules(),
        )
        .start()
        .unwrap();

        let applied = orchestrator
            .restore_assignments(vec![
                ServerAssignment {
                    experiment_id: "exp-holdout".into(),
                    variant_id: "holdout".into(),
                },
                ServerAssignment {
                    experiment_id: "exp-gone".into(),
                    variant_id: "v".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(applied, 1);
        assert!(orchestrator
            .confirmed_assignments()
            .contains_key("exp-holdout"));
    }

    #[tokio::test]
    async fn overly_long_rule_falls_through_to_next_rule() {
        let store = rules(serde_json::json!({
            "triggers": [{
                "eventName": "e",
                "rules": [
                    {
                        "experimentId": "exp-long",
                        "experimentGroupId": "group",
                        "expression": vec!["true"; 10_000].join(" && "),
                        "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-long"}]
                    },
                    {
                        "experimentId": "exp-short",
                        "experimentGroupId": "group",
                        "expression": "true && true",
                        "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw-short"}]
                    }
                ]
            }]
        }));
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .start()
        .unwrap();

        assert_eq!(
            orchestrator.evaluate(EventRecord::new("e")).await.paywall_id(),
            Some("pw-short")
        );
        orchestrator.shutdown().unwrap();
    }

    #[tokio::test]
    async fn computed_properties_are_read_once_per_evaluation() {
        let rule = |experiment_id: &str| {
            serde_json::json!({
                "experimentId": experiment_id,
                "experimentGroupId": "group",
                "expression": "platform.daysSince('signup') > 100",
                "computedPropertyRequests": [{"type": "DAYS_SINCE", "eventName": "signup"}],
                "variants": [{"id": "v", "type": "TREATMENT", "percentage": 100, "paywallId": "pw"}]
            })
        };
        let store = rules(serde_json::json!({
            "triggers": [{"eventName": "e", "rules": [rule("exp-1"), rule("exp-2")]}]
        }));
        let history = GatedHistory::new(Semaphore::MAX_PERMITS, Semaphore::MAX_PERMITS);
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            store,
        )
        .start()
        .unwrap();

        let outcome = orchestrator.evaluate(EventRecord::new("e")).await;

        assert!(matches!(outcome, EvaluationOutcome::NoMatch { .. }));
        assert_eq!(history.reads.load(Ordering::SeqCst), 1);
    }

    fn preload_rules() -> Arc<RuleStore> {
        let rule = |experiment_id: &str, behavior: &str, paywall_id: &str| {
            serde_json::json!({
                "experimentId": experiment_id,
                "experimentGroupId": "group",
                "expression": "user.plan == 'free'",
                "preload": {"behavior": behavior},
                "variants": [
                    {"id": "a", "type": "TREATMENT", "percentage": 100, "paywallId": format!("{paywall_id}-a")},
                    {"id": "b", "type": "TREATMENT", "percentage": 0, "paywallId": format!("{paywall_id}-b")},
                    {"id": "h", "type": "HOLDOUT", "percentage": 0}
                ]
            })
        };
        rules(serde_json::json!({
            "triggers": [
                {"eventName": "always", "rules": [rule("exp-always", "ALWAYS", "always")]},
                {"eventName": "never", "rules": [rule("exp-never", "NEVER", "never")]},
                {"eventName": "if_true", "rules": [rule("exp-if-true", "IF_TRUE", "if-true")]}
            ]
        }))
    }

    fn paywalls(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn preloads_according_to_policy() {
        let history = Arc::new(InMemoryEventHistory::new());
        let orchestrator = OrchestratorConfig::new(
            history.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            preload_rules(),
        )
        .start()
        .unwrap();

        // IF_TRUE rule's expression does not hold yet.
        assert_eq!(
            orchestrator.preloadable_paywall_ids().await.unwrap(),
            paywalls(&["always-a"])
        );

        orchestrator.set_user_attributes(free_user()).await.unwrap();
        assert_eq!(
            orchestrator.preloadable_paywall_ids().await.unwrap(),
            paywalls(&["always-a", "if-true-a"])
        );

        assert!(orchestrator.confirmed_assignments().is_empty());
        assert_eq!(history.len("$occurrence:exp-always"), 0);
    }

    #[tokio::test]
    async fn preload_uses_confirmed_assignments() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(InMemoryKeyValueStore::new()),
            preload_rules(),
        )
        .start()
        .unwrap();

        let applied = orchestrator
            .restore_assignments(vec![
                ServerAssignment {
                    experiment_id: "exp-always".into(),
                    variant_id: "b".into(),
                },
                ServerAssignment {
                    experiment_id: "exp-if-true".into(),
                    variant_id: "h".into(),
                },
                ServerAssignment {
                    experiment_id: "exp-never".into(),
                    variant_id: "b".into(),
                },
            ])
            .await
            .unwrap();
        orchestrator.set_user_attributes(free_user()).await.unwrap();

        assert_eq!(applied, 3);
        // Holdouts have nothing to preload and NEVER wins over a confirmed treatment.
        assert_eq!(
            orchestrator.preloadable_paywall_ids().await.unwrap(),
            paywalls(&["always-b"])
        );
    }

    /// Key-value store whose deletes of one key fail.
    struct FailingDeleteStore {
        inner: InMemoryKeyValueStore,
        key: &'static str,
    }

    #[async_trait]
    impl KeyValueStore for FailingDeleteStore {
        async fn read(&self, key: &str) -> Result<Option<serde_json::Value>, PersistenceError> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: serde_json::Value) -> Result<(), PersistenceError> {
            self.inner.write(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
            if key == self.key {
                return Err(PersistenceError::Write {
                    key: key.to_owned(),
                    message: "locked".to_owned(),
                });
            }
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_reset_does_not_keep_stale_user_state() {
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(FailingDeleteStore {
                inner: InMemoryKeyValueStore::new(),
                key: APP_USER_ID.key(),
            }),
            campaign_rules(),
        )
        .start()
        .unwrap();
        orchestrator.set_user_attributes(free_user()).await.unwrap();
        assert!(matches!(
            orchestrator
                .evaluate(EventRecord::new("campaign_trigger"))
                .await,
            EvaluationOutcome::Match { .. }
        ));

        assert!(orchestrator.reset().await.is_err());

        // User attributes were deleted from the store before the failure, so user.plan is gone.
        assert!(orchestrator.confirmed_assignments().is_empty());
        assert_eq!(
            orchestrator
                .evaluate(EventRecord::new("campaign_trigger"))
                .await,
            EvaluationOutcome::NoMatch {
                source: NoMatchSource::Expression,
                experiment_id: "exp-free".into(),
            }
        );
    }

    /// Key-value store that fails every write.
    struct ReadOnlyStore;

    #[async_trait]
    impl KeyValueStore for ReadOnlyStore {
        async fn read(&self, _key: &str) -> Result<Option<serde_json::Value>, PersistenceError> {
            Ok(None)
        }

        async fn write(&self, key: &str, _value: serde_json::Value) -> Result<(), PersistenceError> {
            Err(PersistenceError::Write {
                key: key.to_owned(),
                message: "read-only".to_owned(),
            })
        }

        async fn delete(&self, _key: &str) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_reported() {
        init();
        let orchestrator = OrchestratorConfig::new(
            Arc::new(InMemoryEventHistory::new()),
            Arc::new(ReadOnlyStore),
            campaign_rules(),
        )
        .start()
        .unwrap();

        let outcome = orchestrator
            .evaluate(EventRecord::new("holdout_trigger"))
            .await;

        assert_eq!(
            outcome,
            EvaluationOutcome::Error {
                kind: ErrorKind::Persistence
            }
        );
    }

    #[test]
    fn evaluates_from_plain_threads_and_drains_on_shutdown() {
        let history = Arc::new(InMemoryEventHistory::new());
        let orchestrator = Arc::new(
            OrchestratorConfig::new(
                history.clone(),
                Arc::new(InMemoryKeyValueStore::new()),
                campaign_rules(),
            )
            .thread_name("test-worker")
            .start()
            .unwrap(),
        );

        let threads = (0..4)
            .map(|i| {
                let orchestrator = orchestrator.clone();
                std::thread::spawn(move || {
                    orchestrator.evaluate_blocking(
                        EventRecord::new("holdout_trigger").with_parameters(Attributes::from([(
                            "thread".to_owned(),
                            Value::Int(i),
                        )])),
                    )
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            assert!(matches!(
                thread.join().unwrap(),
                EvaluationOutcome::NoMatch {
                    source: NoMatchSource::Holdout,
                    ..
                }
            ));
        }

        let pending = orchestrator.submit(EventRecord::new("app_open"));
        let orchestrator = Arc::into_inner(orchestrator).unwrap();
        orchestrator.shutdown().unwrap();

        assert!(matches!(
            pending.wait(),
            EvaluationOutcome::EventNotFound { .. }
        ));
        assert_eq!(history.len("holdout_trigger"), 4);
    }
}
