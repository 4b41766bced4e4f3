//! Server-delivered rule configuration and assignment types.
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{expression::Expr, ExperimentGroupId, ExperimentId, VariantId};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Prefix of event names under which rule occurrences are recorded in the event history.
pub const OCCURRENCE_EVENT_PREFIX: &str = "$occurrence:";

/// Trigger configuration as delivered by the config-fetch layer.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Triggers, at most one per event name.
    pub triggers: Vec<Trigger>,
}

/// All rules attached to one placement (event name).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Name of the placement that fires this trigger.
    pub event_name: String,
    /// Rules in evaluation order.
    ///
    /// Each rule is wrapped in `TryParse` so that if we fail to parse one rule (e.g., new server
    /// format), other rules are still usable.
    pub rules: Vec<TryParse<TriggerRule>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Server-configured condition and variant list associated with one experiment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    pub experiment_id: ExperimentId,
    pub experiment_group_id: ExperimentGroupId,
    /// Expression source text. Mutually exclusive with `expression_ast`.
    #[serde(default)]
    pub expression: Option<String>,
    /// Pre-parsed expression tree. Mutually exclusive with `expression`.
    #[serde(default)]
    pub expression_ast: Option<Expr>,
    pub variants: Vec<VariantOption>,
    #[serde(default)]
    pub computed_property_requests: Vec<ComputedPropertyRequest>,
    #[serde(default)]
    pub preload: PreloadPolicy,
}

impl TriggerRule {
    /// Create an unconditional rule with the given variants.
    pub fn new(
        experiment_id: impl Into<ExperimentId>,
        experiment_group_id: impl Into<ExperimentGroupId>,
        variants: Vec<VariantOption>,
    ) -> TriggerRule {
        TriggerRule {
            experiment_id: experiment_id.into(),
            experiment_group_id: experiment_group_id.into(),
            expression: None,
            expression_ast: None,
            variants,
            computed_property_requests: Vec::new(),
            preload: PreloadPolicy::default(),
        }
    }

    /// Set expression source text.
    pub fn with_expression(mut self, expression: impl Into<String>) -> TriggerRule {
        self.expression = Some(expression.into());
        self
    }

    /// Add a computed property that should be resolved before evaluating the expression.
    pub fn with_computed_property(mut self, request: ComputedPropertyRequest) -> TriggerRule {
        self.computed_property_requests.push(request);
        self
    }

    /// Event name under which occurrences of this rule are recorded.
    pub fn occurrence_key(&self) -> String {
        format!("{OCCURRENCE_EVENT_PREFIX}{}", self.experiment_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum VariantType {
    /// Shows a paywall.
    Treatment,
    /// Intentionally withholds a paywall for measurement.
    Holdout,
}

/// A weighted variant option of an experiment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantOption {
    pub id: VariantId,
    #[serde(rename = "type")]
    pub variant_type: VariantType,
    /// Relative weight. Weights of one experiment do not need to sum to 100.
    #[serde(rename = "percentage")]
    pub percentage_weight: u32,
    #[serde(default)]
    pub paywall_id: Option<String>,
}

impl VariantOption {
    #[allow(missing_docs)]
    pub fn treatment(id: impl Into<VariantId>, weight: u32, paywall_id: &str) -> VariantOption {
        VariantOption {
            id: id.into(),
            variant_type: VariantType::Treatment,
            percentage_weight: weight,
            paywall_id: Some(paywall_id.to_owned()),
        }
    }

    #[allow(missing_docs)]
    pub fn holdout(id: impl Into<VariantId>, weight: u32) -> VariantOption {
        VariantOption {
            id: id.into(),
            variant_type: VariantType::Holdout,
            percentage_weight: weight,
            paywall_id: None,
        }
    }

    /// Drop the weight, producing the variant that gets assigned and persisted.
    pub fn to_variant(&self) -> Variant {
        Variant {
            id: self.id.clone(),
            variant_type: self.variant_type,
            paywall_id: self.paywall_id.clone(),
        }
    }
}

/// A variant assigned to a user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variant {
    pub id: VariantId,
    #[serde(rename = "type")]
    pub variant_type: VariantType,
    #[serde(default)]
    pub paywall_id: Option<String>,
}

/// Experiment with the variant the user is assigned to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Experiment {
    pub id: ExperimentId,
    pub group_id: ExperimentGroupId,
    pub variant: Variant,
}

/// Authoritative assignment returned by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ServerAssignment {
    pub experiment_id: ExperimentId,
    pub variant_id: VariantId,
}

/// Kind of derived value that can be computed from the local event history.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ComputedPropertyType {
    MinutesSince,
    HoursSince,
    DaysSince,
    MonthsSince,
    PlacementsInHour,
    PlacementsInDay,
    PlacementsInWeek,
    PlacementsInMonth,
    PlacementsSinceInstall,
}

impl ComputedPropertyType {
    #[allow(missing_docs)]
    pub const ALL: [ComputedPropertyType; 9] = [
        ComputedPropertyType::MinutesSince,
        ComputedPropertyType::HoursSince,
        ComputedPropertyType::DaysSince,
        ComputedPropertyType::MonthsSince,
        ComputedPropertyType::PlacementsInHour,
        ComputedPropertyType::PlacementsInDay,
        ComputedPropertyType::PlacementsInWeek,
        ComputedPropertyType::PlacementsInMonth,
        ComputedPropertyType::PlacementsSinceInstall,
    ];

    /// Name of the function exposed to expressions (e.g., `daysSince`).
    pub fn function_name(self) -> &'static str {
        match self {
            ComputedPropertyType::MinutesSince => "minutesSince",
            ComputedPropertyType::HoursSince => "hoursSince",
            ComputedPropertyType::DaysSince => "daysSince",
            ComputedPropertyType::MonthsSince => "monthsSince",
            ComputedPropertyType::PlacementsInHour => "placementsInHour",
            ComputedPropertyType::PlacementsInDay => "placementsInDay",
            ComputedPropertyType::PlacementsInWeek => "placementsInWeek",
            ComputedPropertyType::PlacementsInMonth => "placementsInMonth",
            ComputedPropertyType::PlacementsSinceInstall => "placementsSinceInstall",
        }
    }

    /// Look up a computed property by its function name.
    pub fn from_function_name(name: &str) -> Option<ComputedPropertyType> {
        Self::ALL.into_iter().find(|ty| ty.function_name() == name)
    }

    /// Prefix of the device attribute a pre-computed value is exposed under.
    pub fn prefix(self) -> String {
        format!("{}_", self.function_name())
    }
}

/// A request to compute a device property associated with an event at evaluation time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ComputedPropertyRequest {
    #[serde(rename = "type")]
    pub property_type: ComputedPropertyType,
    pub event_name: String,
}

impl ComputedPropertyRequest {
    #[allow(missing_docs)]
    pub fn new(property_type: ComputedPropertyType, event_name: impl Into<String>) -> Self {
        ComputedPropertyRequest {
            property_type,
            event_name: event_name.into(),
        }
    }

    /// Device attribute name the resolved value is exposed under, e.g. `daysSince_signup`.
    pub fn attribute_name(&self) -> String {
        format!("{}{}", self.property_type.prefix(), self.event_name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum PreloadBehavior {
    #[default]
    IfTrue,
    Always,
    Never,
}

/// Whether the paywall of a rule may be preloaded ahead of the placement.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreloadPolicy {
    #[serde(default)]
    pub behavior: PreloadBehavior,
    /// Whether the rule must be evaluated again at presentation time even if it was evaluated for
    /// preloading.
    #[serde(default)]
    pub requires_re_evaluation: bool,
}

impl PreloadPolicy {
    /// Decide whether to preload given the result of a preview evaluation.
    pub fn allows_preload(&self, expression_matched: bool) -> bool {
        match self.behavior {
            PreloadBehavior::Always => true,
            PreloadBehavior::Never => false,
            PreloadBehavior::IfTrue => expression_matched,
        }
    }
}

/// Immutable compiled snapshot of all triggers, keyed by event name.
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Generation assigned by the [`RuleStore`](crate::RuleStore). Two snapshots with the same
    /// generation are the same snapshot.
    pub generation: u64,
    triggers: HashMap<String, Arc<[Arc<TriggerRule>]>>,
}

impl RuleSet {
    /// Compile a trigger configuration, dropping rules that failed to parse.
    pub fn from_config(config: TriggerConfig, generation: u64) -> RuleSet {
        let triggers = config
            .triggers
            .into_iter()
            .map(|trigger| {
                let rules = trigger
                    .rules
                    .into_iter()
                    .filter_map(|rule| match rule {
                        TryParse::Parsed(rule) => Some(Arc::new(rule)),
                        TryParse::ParseFailed(value) => {
                            log::warn!(target: "paywall_trigger",
                                       event_name = trigger.event_name.as_str();
                                       "failed to parse trigger rule, skipping it: {value}");
                            None
                        }
                    })
                    .collect::<Vec<_>>();
                (trigger.event_name, Arc::from(rules))
            })
            .collect();

        RuleSet {
            generation,
            triggers,
        }
    }

    /// Rules for the given event name in evaluation order. Returns `None` if there's no trigger for
    /// the event.
    pub fn rules_for(&self, event_name: &str) -> Option<&[Arc<TriggerRule>]> {
        self.triggers.get(event_name).map(|rules| &rules[..])
    }

    /// Iterate over every rule of every trigger.
    pub fn all_rules(&self) -> impl Iterator<Item = &Arc<TriggerRule>> {
        self.triggers.values().flat_map(|rules| rules.iter())
    }

    /// Find a variant option by experiment and variant id.
    pub fn find_variant(
        &self,
        experiment_id: &ExperimentId,
        variant_id: &VariantId,
    ) -> Option<&VariantOption> {
        self.all_rules()
            .filter(|rule| &rule.experiment_id == experiment_id)
            .flat_map(|rule| rule.variants.iter())
            .find(|variant| &variant.id == variant_id)
    }
}
