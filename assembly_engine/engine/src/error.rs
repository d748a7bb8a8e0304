//! Centralized assembly engine error types.

use std::fmt;

use thiserror::Error;

use crate::ballot::BallotKind;
use crate::types::Fingerprint;

/// Which check of an identity proof failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    Fingerprint,
    EncryptionKeySignature,
    NicknameSignature,
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IntegrityCheck::Fingerprint => "fingerprint mismatch",
            IntegrityCheck::EncryptionKeySignature => "encryption key signature",
            IntegrityCheck::NicknameSignature => "nickname signature",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    /// The key primitive produced an unusable key.
    #[error("Key generation error: {0}")]
    KeyGeneration(String),
    /// A peer identity proof failed one of its checks.
    #[error("Integrity error: {0}")]
    Integrity(IntegrityCheck),
    /// Our own commitment is missing from the final hash set.
    #[error("Censorship error: {0}")]
    Censorship(String),
    /// A participant has no valid cross-signature (or more than one).
    #[error("Validation error: no single valid signature from {0}")]
    Validation(Fingerprint),
    /// Revealed ballots do not match the validated commitments.
    #[error("Mismatch error: {0}")]
    Mismatch(String),
    #[error("Kind mismatch: harvest expects {expected:?}, ballot is {actual:?}")]
    KindMismatch { expected: BallotKind, actual: BallotKind },
    #[error("Wrong harvest: {0}")]
    WrongHarvest(String),
    /// State machine misuse: field already set, or step taken out of order.
    #[error("Protocol state error: {0}")]
    ProtocolState(String),
    /// Ballot content does not fit the fixed-length budget.
    #[error("Ballot content exceeds the size budget by {0} bytes")]
    Oversize(usize),
    #[error("Connection error: {0}")]
    Connection(String),
    /// The relay refused the session (bad secret, unknown member, ...).
    #[error("Rejected by relay: {0}")]
    Rejected(String),
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AssemblyError {
    /// Failures that abort the current harvest but leave the session running.
    pub fn is_harvest_fault(&self) -> bool {
        matches!(
            self,
            AssemblyError::Censorship(_) | AssemblyError::Validation(_) | AssemblyError::Mismatch(_)
        )
    }

    /// Failures the reconnection policy is allowed to retry.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, AssemblyError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, AssemblyError>;
