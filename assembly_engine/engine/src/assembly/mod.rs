//! Assembly presence/consent state machine.

pub mod state;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::harvest::{Harvest, HarvestResult};
use crate::protocol::MemberEvent;
use crate::types::{Fingerprint, Question, Readiness};

pub use state::AssemblyState;

/// Consent tracking inside a harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    /// Participants that have not accepted yet.
    Proposed { remaining: BTreeSet<Fingerprint> },
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Waiting {
        id: String,
        question: Option<Question>,
        readiness: BTreeMap<Fingerprint, Readiness>,
    },
    Harvesting { harvest: Harvest, phase: Phase },
    /// Local member is not participant-eligible yet.
    Hidden,
}

impl Status {
    pub fn is_waiting(&self) -> bool {
        matches!(self, Status::Waiting { .. })
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Status::Harvesting { phase: Phase::Started, .. })
    }

    /// Id of the round in progress, if any.
    pub fn round_id(&self) -> Option<&str> {
        match self {
            Status::Waiting { id, .. } => Some(id),
            Status::Harvesting { harvest, .. } => Some(&harvest.id),
            Status::Hidden => None,
        }
    }

    /// Question of the round in progress; `None` for proposal rounds and `Hidden`.
    pub fn round_question(&self) -> Option<&Question> {
        match self {
            Status::Waiting { question, .. } => question.as_ref(),
            Status::Harvesting { harvest, .. } => harvest.question.as_ref(),
            Status::Hidden => None,
        }
    }
}

/// What subscribers hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status(Status),
    HarvestCompleted { harvest: Harvest, result: HarvestResult },
    /// The harvest was aborted by a protocol integrity failure; assembly is back to Waiting.
    HarvestFailed { reason: String },
    Connection(crate::session::ConnectionState),
    /// Non-fatal error reported by the relay.
    ServerError { reason: String },
    /// The session stopped for good.
    Fatal { reason: String },
}

/// Side effects of one state mutation.
#[derive(Debug, Default)]
pub struct Outcome {
    pub outbound: Vec<MemberEvent>,
    pub notifications: Vec<Notification>,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.notifications.is_empty()
    }
}
