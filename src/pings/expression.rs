//! Watched expressions and their persisted string encoding.
//!
//! The encoding is a two-character discriminator followed by the inner text:
//! `T-<text>` for exact match, `C-<text>` for containment. Persisted watch-sets
//! depend on it, so it is written by hand rather than derived.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const EXACT_MATCH_PREFIX: &str = "T-";
const CONTAINS_PREFIX: &str = "C-";

/// How an expression is compared against a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ExpressionKind {
    /// Contiguous run of whole tokens.
    #[default]
    ExactMatch,
    /// Literal substring of the folded message.
    Contains,
}

impl ExpressionKind {
    /// Parse the user-facing mode keyword (`exact` / `contains`).
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "exact" | "exact-match" | "match" => Some(Self::ExactMatch),
            "contains" | "containment" => Some(Self::Contains),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ExactMatch => "Exact Match",
            Self::Contains => "Containment",
        }
    }
}

/// A watched text pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expression {
    ExactMatch(String),
    Contains(String),
}

/// The persisted string did not start with a known discriminator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown expression encoding: {0:?}")]
pub struct DecodeError(pub String);

impl Expression {
    pub fn new(kind: ExpressionKind, text: impl Into<String>) -> Self {
        match kind {
            ExpressionKind::ExactMatch => Self::ExactMatch(text.into()),
            ExpressionKind::Contains => Self::Contains(text.into()),
        }
    }

    pub fn kind(&self) -> ExpressionKind {
        match self {
            Self::ExactMatch(_) => ExpressionKind::ExactMatch,
            Self::Contains(_) => ExpressionKind::Contains,
        }
    }

    pub fn inner(&self) -> &str {
        match self {
            Self::ExactMatch(text) | Self::Contains(text) => text,
        }
    }

    /// Encode to the persisted `T-`/`C-` form.
    pub fn encode(&self) -> String {
        match self {
            Self::ExactMatch(text) => format!("{EXACT_MATCH_PREFIX}{text}"),
            Self::Contains(text) => format!("{CONTAINS_PREFIX}{text}"),
        }
    }

    /// Decode the persisted `T-`/`C-` form.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        if let Some(text) = raw.strip_prefix(EXACT_MATCH_PREFIX) {
            Ok(Self::ExactMatch(text.to_owned()))
        } else if let Some(text) = raw.strip_prefix(CONTAINS_PREFIX) {
            Ok(Self::Contains(text.to_owned()))
        } else {
            Err(DecodeError(raw.to_owned()))
        }
    }

    /// The same expression with its inner text folded and trimmed, the form
    /// it is stored and matched in.
    pub fn folded(&self) -> Self {
        Self::new(self.kind(), super::fold::fold(self.inner()).trim())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inner())
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(serde::de::Error::custom)
    }
}
