//! Shared identifier wrappers for vetdispatch.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let parsed = Uuid::parse_str(value.trim())
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(parsed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

/// Identifiers minted outside this system (roster keys, practice numbers).
///
/// Accepts any non-empty, whitespace-free string up to 128 bytes.
macro_rules! define_text_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            const MAX_LENGTH: usize = 128;

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let value = value.trim();
                if value.is_empty() {
                    return Err(IdParseError::new(format!("{} cannot be empty", $label)));
                }
                if value.len() > Self::MAX_LENGTH {
                    return Err(IdParseError::new(format!(
                        "{} exceeds {} characters",
                        $label,
                        Self::MAX_LENGTH
                    )));
                }
                if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err(IdParseError::new(format!(
                        "{} contains whitespace or control characters",
                        $label
                    )));
                }
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_uuid_id!(CaseId, "case ID");
define_text_id!(CandidateId, "candidate ID");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_id_round_trips_through_parse() {
        let id = CaseId::new();
        let parsed = CaseId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn case_id_rejects_garbage() {
        assert!(CaseId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn candidate_id_trims_and_validates() {
        assert_eq!(CandidateId::parse("  vet-17 ").unwrap().as_str(), "vet-17");
        assert!(CandidateId::parse("").is_err());
        assert!(CandidateId::parse("vet 17").is_err());
        assert!(CandidateId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn candidate_id_deserialize_is_validated() {
        let ok: CandidateId = serde_json::from_str("\"dr-khan\"").unwrap();
        assert_eq!(ok.as_str(), "dr-khan");
        assert!(serde_json::from_str::<CandidateId>("\"\"").is_err());
    }
}
