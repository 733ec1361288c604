//! Strongly typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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
    /// Tagged identifier of a registered pipeline stage.
    StageId
);

string_id!(
    /// Identifies one logical batch of work, e.g. a calendar date.
    WorkKey
);

string_id!(
    /// Identifies one expected sub-component of a work unit, e.g. one game.
    SubKey
);

string_id!(
    /// Identifies an entity processed by a batch worker.
    EntityId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversions() {
        let stage = StageId::from("scrape");
        assert_eq!(stage.to_string(), "scrape");
        assert_eq!(stage.as_str(), "scrape");

        let key: WorkKey = String::from("2024-01-15").into();
        assert_eq!(key, WorkKey::new("2024-01-15"));
    }

    #[test]
    fn test_serializes_transparently() {
        let sub = SubKey::new("game-1");
        let json = serde_json::to_string(&sub).unwrap();
        assert_eq!(json, r#""game-1""#);

        let back: SubKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sub);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut keys = vec![SubKey::new("c"), SubKey::new("a"), SubKey::new("b")];
        keys.sort();
        assert_eq!(keys, vec![SubKey::new("a"), SubKey::new("b"), SubKey::new("c")]);
    }
}
