//! Computed properties: values derived from the event history at evaluation time.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, Utc};

use crate::{
    event_history::EventHistoryStore,
    expression::HostFunctions,
    models::{ComputedPropertyRequest, ComputedPropertyType, Timestamp},
    Attributes, Value,
};

/// Resolves computed properties against the event history, relative to a fixed evaluation time.
///
/// Failing reads are not fatal: the property resolves to its default (`0`) and a warning is
/// logged.
///
/// One resolver serves one evaluation. Each distinct property is read from the store once; later
/// requests (from prefill, from expressions, from other rules of the same trigger) reuse the value.
pub struct ComputedPropertyResolver {
    history: Arc<dyn EventHistoryStore>,
    now: Timestamp,
    resolved: Mutex<HashMap<(ComputedPropertyType, String), Value>>,
}

impl ComputedPropertyResolver {
    #[allow(missing_docs)]
    pub fn new(history: Arc<dyn EventHistoryStore>, now: Timestamp) -> ComputedPropertyResolver {
        ComputedPropertyResolver {
            history,
            now,
            resolved: Mutex::default(),
        }
    }

    /// Compute a property for `event_name`.
    ///
    /// Time-since properties are `0` if the event never happened.
    pub async fn compute(&self, property: ComputedPropertyType, event_name: &str) -> Value {
        let key = (property, event_name.to_owned());
        if let Some(value) = self.resolved_value(&key) {
            return value;
        }

        let value = self.query(property, event_name).await;
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.clone());
        value
    }

    fn resolved_value(&self, key: &(ComputedPropertyType, String)) -> Option<Value> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn query(&self, property: ComputedPropertyType, event_name: &str) -> Value {
        let result = match property {
            ComputedPropertyType::MinutesSince
            | ComputedPropertyType::HoursSince
            | ComputedPropertyType::DaysSince
            | ComputedPropertyType::MonthsSince => self
                .history
                .most_recent(event_name)
                .await
                .map(|last| last.map_or(0, |last| self.time_since(property, last))),

            ComputedPropertyType::PlacementsInHour
            | ComputedPropertyType::PlacementsInDay
            | ComputedPropertyType::PlacementsInWeek
            | ComputedPropertyType::PlacementsInMonth
            | ComputedPropertyType::PlacementsSinceInstall => {
                let start = match property {
                    ComputedPropertyType::PlacementsInHour => self.now - Duration::hours(1),
                    ComputedPropertyType::PlacementsInDay => self.now - Duration::days(1),
                    ComputedPropertyType::PlacementsInWeek => self.now - Duration::weeks(1),
                    ComputedPropertyType::PlacementsInMonth => self.now - Duration::days(30),
                    _ => DateTime::<Utc>::MIN_UTC,
                };
                self.history
                    .count_in_range(event_name, start, self.now)
                    .await
                    .map(|count| i64::try_from(count).unwrap_or(i64::MAX))
            }
        };

        match result {
            Ok(value) => Value::Int(value),
            Err(err) => {
                log::warn!(target: "paywall_trigger",
                           property:serde = property,
                           event_name;
                           "failed to compute property, using default: {err}");
                Value::Int(0)
            }
        }
    }

    fn time_since(&self, property: ComputedPropertyType, last: Timestamp) -> i64 {
        let elapsed = (self.now - last).max(Duration::zero());
        match property {
            ComputedPropertyType::MinutesSince => elapsed.num_minutes(),
            ComputedPropertyType::HoursSince => elapsed.num_hours(),
            ComputedPropertyType::DaysSince => elapsed.num_days(),
            _ => whole_months_between(last, self.now),
        }
    }

    /// Compute all requested properties, keyed by their device attribute name (e.g.
    /// `daysSince_signup`).
    pub async fn prefill(&self, requests: &[ComputedPropertyRequest]) -> Attributes {
        let mut attributes = Attributes::with_capacity(requests.len());
        for request in requests {
            let value = self
                .compute(request.property_type, &request.event_name)
                .await;
            attributes.insert(request.attribute_name(), value);
        }
        attributes
    }
}

/// Number of whole calendar months from `from` to `to` (0 if `to` is earlier).
fn whole_months_between(from: Timestamp, to: Timestamp) -> i64 {
    if to <= from {
        return 0;
    }
    let mut months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    // One month after Jan 31 is Feb 28/29, so the candidate can overshoot by one.
    while months > 0 {
        match from.checked_add_months(Months::new(months as u32)) {
            Some(date) if date <= to => break,
            _ => months -= 1,
        }
    }
    i64::from(months.max(0))
}

#[async_trait]
impl HostFunctions for ComputedPropertyResolver {
    async fn call(&self, name: &str, args: &[Value]) -> Value {
        let Some(property) = ComputedPropertyType::from_function_name(name) else {
            log::debug!(target: "paywall_trigger", function = name; "unknown host function");
            return Value::Bool(false);
        };
        match args {
            [Value::String(event_name)] => self.compute(property, event_name).await,
            _ => {
                log::debug!(target: "paywall_trigger", function = name; "host function expects one string argument");
                Value::Bool(false)
            }
        }
    }
}
