//! String identifiers for tasks, agents and batches.
//!
//! Ids arrive from external collaborators as arbitrary strings, so every
//! identifier is a transparent `String` newtype. Locally generated ids use
//! a `<prefix>-<uuid v4>` form.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier.
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Shortened form for log lines: the generated prefix plus the
            /// first 8 characters of the uuid, or the whole id if it was
            /// supplied externally and is already short.
            pub fn short(&self) -> &str {
                let prefixed = concat!($prefix, "-").len();
                if self.0.starts_with(concat!($prefix, "-")) && self.0.len() > prefixed + 8 {
                    &self.0[..prefixed + 8]
                } else {
                    &self.0
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of an atomic task.
    TaskId,
    "task"
);

string_id!(
    /// Identifier of a registered agent.
    AgentId,
    "agent"
);

string_id!(
    /// Identifier of a batch (execution stage).
    BatchId,
    "batch"
);
