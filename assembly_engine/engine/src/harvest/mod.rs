//! Harvest descriptor and results.

pub mod state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ballot::{Ballot, BallotKind};
use crate::types::{Fingerprint, Question};

pub use state::HarvestState;

/// One round of anonymous collection over a fixed participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Harvest {
    pub id: String,
    pub question: Option<Question>,
    /// Sorted ascending, no duplicates.
    pub participants: Vec<Fingerprint>,
}

impl Harvest {
    pub fn new(id: impl Into<String>, question: Option<Question>, participants: impl IntoIterator<Item = Fingerprint>) -> Self {
        let mut participants: Vec<Fingerprint> = participants.into_iter().collect();
        participants.sort();
        participants.dedup();

        Harvest { id: id.into(), question, participants }
    }

    pub fn expected_kind(&self) -> BallotKind {
        BallotKind::expected_for(self.question.as_ref())
    }

    pub fn is_participant(&self, member: &Fingerprint) -> bool {
        self.participants.binary_search(member).is_ok()
    }
}

/// The object every participant signs once the commitments are fixed.
#[derive(Serialize)]
pub struct ValidationProof<'a, H: Serialize> {
    pub harvest: &'a Harvest,
    pub hashes: &'a [H],
}

/// Where a relay list goes after the local member added its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStep<T> {
    /// Hand the list to the next participant; `remaining` follow after it.
    Forward { to: Fingerprint, remaining: Vec<Fingerprint>, items: Vec<T> },
    /// Everyone contributed; publish the final list.
    Broadcast(Vec<T>),
}

/// Accepted outcome of a verified harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarvestResult {
    /// Proposed questions, sorted; empty proposals dropped.
    Questions { questions: Vec<Question> },
    Closed { yes: usize, no: usize },
    /// Open answers, sorted.
    Open { answers: Vec<String> },
}

impl HarvestResult {
    pub(crate) fn tally(kind: BallotKind, ballots: &[Ballot]) -> Self {
        match kind {
            BallotKind::Question => {
                let mut questions: Vec<Question> = ballots
                    .iter()
                    .filter_map(|b| match b {
                        Ballot::Question { question, .. } => question.clone(),
                        _ => None,
                    })
                    .collect();
                questions.sort();
                HarvestResult::Questions { questions }
            }
            BallotKind::ClosedAnswer => {
                let yes = ballots
                    .iter()
                    .filter(|b| matches!(b, Ballot::ClosedAnswer { answer: true, .. }))
                    .count();
                HarvestResult::Closed { yes, no: ballots.len() - yes }
            }
            BallotKind::OpenAnswer => {
                let mut answers: Vec<String> = ballots
                    .iter()
                    .filter_map(|b| match b {
                        Ballot::OpenAnswer { answer, .. } => Some(answer.clone()),
                        _ => None,
                    })
                    .collect();
                answers.sort();
                HarvestResult::Open { answers }
            }
        }
    }
}

/// Count occurrences, for multiset comparisons.
pub(crate) fn multiset<T: Ord + Clone>(items: &[T]) -> BTreeMap<T, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.clone()).or_insert(0) += 1;
    }
    counts
}
