//! Fixed-length ballots.
//!
//! Every ballot of a given kind serializes to the same number of bytes, so the
//! relay cannot tell answers apart by size. Content is padded with random
//! characters up to `max_text_size + min_random_padding + empty_len`.

use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};
use crate::types::{Question, QuestionKind};

/// Size budget shared by all members of an assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallotConfig {
    pub max_text_size: usize,
    pub min_random_padding: usize,
}

impl Default for BallotConfig {
    fn default() -> Self {
        BallotConfig { max_text_size: 1024, min_random_padding: 32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BallotKind {
    Question,
    ClosedAnswer,
    OpenAnswer,
}

impl BallotKind {
    /// The ballot kind a harvest over `question` collects.
    pub fn expected_for(question: Option<&Question>) -> Self {
        match question.map(|q| q.kind) {
            None => BallotKind::Question,
            Some(QuestionKind::Closed) => BallotKind::ClosedAnswer,
            Some(QuestionKind::Open) => BallotKind::OpenAnswer,
        }
    }
}

/// Sealed content a member contributes to one harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ballot {
    Question { question: Option<Question>, padding: String },
    ClosedAnswer { answer: bool, padding: String },
    OpenAnswer { answer: String, padding: String },
}

/// Commitment to a ballot: hex BLAKE3 of its serialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BallotHash(pub String);

impl fmt::Display for BallotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ballot {
    /// Propose a question, or explicitly propose nothing.
    pub fn question(question: Option<Question>, config: &BallotConfig) -> Result<Self> {
        Self::padded(Ballot::Question { question, padding: String::new() }, config)
    }

    pub fn closed(answer: bool, config: &BallotConfig) -> Result<Self> {
        Self::padded(Ballot::ClosedAnswer { answer, padding: String::new() }, config)
    }

    pub fn open(answer: impl Into<String>, config: &BallotConfig) -> Result<Self> {
        Self::padded(Ballot::OpenAnswer { answer: answer.into(), padding: String::new() }, config)
    }

    pub fn kind(&self) -> BallotKind {
        match self {
            Ballot::Question { .. } => BallotKind::Question,
            Ballot::ClosedAnswer { .. } => BallotKind::ClosedAnswer,
            Ballot::OpenAnswer { .. } => BallotKind::OpenAnswer,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn hash(&self) -> Result<BallotHash> {
        Ok(BallotHash(blake3::hash(&self.to_bytes()?).to_hex().to_string()))
    }

    /// Serialized length every ballot of `kind` must have.
    pub fn target_len(kind: BallotKind, config: &BallotConfig) -> Result<usize> {
        let empty = match kind {
            BallotKind::Question => Ballot::Question { question: None, padding: String::new() },
            BallotKind::ClosedAnswer => Ballot::ClosedAnswer { answer: false, padding: String::new() },
            BallotKind::OpenAnswer => Ballot::OpenAnswer { answer: String::new(), padding: String::new() },
        };
        Ok(config.max_text_size + config.min_random_padding + empty.to_bytes()?.len())
    }

    fn padding_mut(&mut self) -> &mut String {
        match self {
            Ballot::Question { padding, .. }
            | Ballot::ClosedAnswer { padding, .. }
            | Ballot::OpenAnswer { padding, .. } => padding,
        }
    }

    fn padded(mut ballot: Ballot, config: &BallotConfig) -> Result<Self> {
        let target = Self::target_len(ballot.kind(), config)?;
        let current = ballot.to_bytes()?.len();

        // Step 1: check the content leaves room for the minimum padding
        let remaining = target.saturating_sub(current);
        if current > target || remaining < config.min_random_padding {
            let excess = (current + config.min_random_padding).saturating_sub(target);
            return Err(AssemblyError::Oversize(excess));
        }

        // Step 2: pad with exactly `remaining` single-byte characters
        *ballot.padding_mut() = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(remaining)
            .map(char::from)
            .collect();

        // Step 3: the padded form must land exactly on target
        let actual = ballot.to_bytes()?.len();
        if actual != target {
            return Err(AssemblyError::Internal(format!(
                "ballot length {actual} differs from target {target}"
            )));
        }

        Ok(ballot)
    }
}
