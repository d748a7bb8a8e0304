//! Shared data types for the assembly engine: member fingerprints, questions and readiness.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable member identifier: hex SHA-256 of the member's verification key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Derive the fingerprint of a serialized verification key.
    pub fn of_key(verification_key: &[u8]) -> Self {
        Fingerprint(hex::encode(Sha256::digest(verification_key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a question is answered yes/no or with free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Closed,
    Open,
}

/// A question put to the assembly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub kind: QuestionKind,
}

impl Question {
    pub fn closed(text: impl Into<String>) -> Self {
        Question { text: text.into(), kind: QuestionKind::Closed }
    }

    pub fn open(text: impl Into<String>) -> Self {
        Question { text: text.into(), kind: QuestionKind::Open }
    }
}

/// Per-member flag gating harvest initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Answering,
    Ready,
    Blocking,
}
