//! Wire messages exchanged with the assembly relay.
//!
//! Everything is JSON, internally tagged with `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assembly::Status;
use crate::ballot::{Ballot, BallotHash};
use crate::identity::IdentityProof;
use crate::types::{Fingerprint, Question, Readiness};

/// Full picture of an assembly, sent once the handshake completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub questions: Vec<Question>,
    pub present: Vec<Fingerprint>,
    pub absent: Vec<(Fingerprint, DateTime<Utc>)>,
    pub status: Status,
    #[serde(default)]
    pub identities: Vec<IdentityProof>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { id: String, secret: String, member: Fingerprint },
    Proof { signature: String, identity_proof: Option<IdentityProof> },
    Event(MemberEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Challenge { challenge: String, identity_proof_needed: bool },
    Established { state: StateSnapshot },
    Event(AssemblyEvent),
    Error { fatal: bool, reason: String },
}

/// Everything `AssemblyState::update` consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AssemblyEvent {
    State { state: StateSnapshot },
    Status { status: Status },
    Public { public: PublicEvent },
    Harvesting { harvesting: HarvestingEvent },
    Protocol { protocol: ProtocolEvent },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublicEvent {
    MemberPresence {
        member: Fingerprint,
        present: bool,
        at: DateTime<Utc>,
        identity: Option<IdentityProof>,
    },
    MemberBlocking { member: Fingerprint, readiness: Readiness },
    NewQuestions { questions: Vec<Question> },
    QuestionDone { next_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarvestingEvent {
    Accepted { member: Fingerprint },
    Refused { member: Fingerprint },
    Invalid { reason: String },
}

/// Steps of the commit/reveal exchange. Relay payloads are base64 sealed boxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Our turn in the hash relay; `previous` is absent for the first participant.
    Hash { previous: Option<String>, remaining: Vec<Fingerprint> },
    /// Final commitment set, asking for our validation signature.
    Validate { hashes: Vec<BallotHash> },
    /// Collected validation signatures.
    Validity { signatures: Vec<(Fingerprint, String)> },
    /// Our turn in the ballot relay.
    Ballot { previous: Option<String>, remaining: Vec<Fingerprint> },
    /// Final revealed ballots.
    Ballots { ballots: Vec<Ballot> },
}

/// Outbound member events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberEvent {
    Blocking { readiness: Readiness },
    Accept,
    Refuse,
    HashRelay { to: Fingerprint, remaining: Vec<Fingerprint>, payload: String },
    HashSet { hashes: Vec<BallotHash> },
    Validation { signature: String },
    BallotRelay { to: Fingerprint, remaining: Vec<Fingerprint>, payload: String },
    BallotSet { ballots: Vec<Ballot> },
    /// Our own checks rejected the running harvest.
    Invalid { reason: String },
}
