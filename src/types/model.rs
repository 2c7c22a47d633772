//! Model and stage identifiers shared across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type-safe wrapper for model ids (e.g. `openai/gpt-4o`)
///
/// Ordering is lexical, which the selector relies on for tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ModelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pipeline stage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Initial,
    PeerReview,
    Synthesis,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::PeerReview => write!(f, "peer_review"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Which stages a registered model may serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    /// Initial answers and peer review only
    Panel,
    /// Final synthesis only
    Synthesizer,
    /// Any stage
    #[default]
    Any,
}

impl ModelRole {
    /// Whether this role may answer in Initial / PeerReview
    pub fn serves_panel(&self) -> bool {
        matches!(self, Self::Panel | Self::Any)
    }

    /// Whether this role may be picked for Synthesis
    pub fn serves_synthesis(&self) -> bool {
        matches!(self, Self::Synthesizer | Self::Any)
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panel => write!(f, "panel"),
            Self::Synthesizer => write!(f, "synthesizer"),
            Self::Any => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for ModelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "panel" => Ok(Self::Panel),
            "synthesizer" => Ok(Self::Synthesizer),
            "any" => Ok(Self::Any),
            _ => Err(format!(
                "Unknown model role: {}. Valid values: panel, synthesizer, any",
                s
            )),
        }
    }
}
