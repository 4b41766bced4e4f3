//! Identifier types.
//!
//! Identifiers are handed around a lot (stored in outcomes, cache keys, log records), so they are
//! backed by `Arc<str>` and cloned cheaply.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

macro_rules! arc_str_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> $name {
                $name(value.into())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> $name {
                $name(value.into())
            }
        }

        impl From<Arc<str>> for $name {
            fn from(value: Arc<str>) -> $name {
                $name(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl log::kv::ToValue for $name {
            fn to_value(&self) -> log::kv::Value {
                log::kv::Value::from_display(self)
            }
        }
    };
}

arc_str_id!(
    /// Server-assigned experiment identifier.
    ExperimentId
);

arc_str_id!(
    /// Identifier of a group of experiments (a campaign). Rules of one trigger share a group.
    ExperimentGroupId
);

arc_str_id!(
    /// Identifier of a variant within an experiment.
    VariantId
);
