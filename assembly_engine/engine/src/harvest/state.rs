use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::ballot::{Ballot, BallotHash, BallotKind};
use crate::error::{AssemblyError, Result};
use crate::harvest::{Harvest, HarvestResult, RelayStep, ValidationProof, multiset};
use crate::identity::Me;
use crate::registry::ProofCache;
use crate::types::{Fingerprint, Question};

/// Represents one member's progress through one harvest.
///
/// Progression is `ballot -> harvest -> hashes -> validations -> ballots`.
/// Each field is written once; setting it again or skipping ahead fails.
pub struct HarvestState {
    me: Arc<Me>,
    expected_id: String,                              // id of the round this state belongs to
    expected_question: Option<Question>,              // question of that round, None for proposals
    ballot: Option<(Ballot, BallotHash)>,             // our committed ballot and its hash
    harvest: Option<Harvest>,                         // confirmed descriptor
    hash_contributed: bool,                           // we already added our hash to the relay
    hashes: Option<Vec<BallotHash>>,                  // final sorted commitment set
    validations: Option<BTreeMap<Fingerprint, String>>, // participant -> signature over the proof
    ballot_contributed: bool,                         // we already added our ballot to the relay
    ballots: Option<Vec<Ballot>>,                     // verified revealed ballots
    result: Option<HarvestResult>,
}

fn already(field: &str) -> AssemblyError {
    AssemblyError::ProtocolState(format!("{field} already set"))
}

fn missing(field: &str) -> AssemblyError {
    AssemblyError::ProtocolState(format!("{field} not set yet"))
}

impl HarvestState {
    pub fn new(me: Arc<Me>, expected_id: &str, expected_question: Option<Question>) -> Self {
        HarvestState {
            me,
            expected_id: expected_id.to_string(),
            expected_question,
            ballot: None,
            harvest: None,
            hash_contributed: false,
            hashes: None,
            validations: None,
            ballot_contributed: false,
            ballots: None,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.expected_id
    }

    pub fn expected_kind(&self) -> BallotKind {
        BallotKind::expected_for(self.expected_question.as_ref())
    }

    pub fn ballot(&self) -> Option<&Ballot> {
        self.ballot.as_ref().map(|(b, _)| b)
    }

    pub fn harvest(&self) -> Option<&Harvest> {
        self.harvest.as_ref()
    }

    pub fn hashes(&self) -> Option<&[BallotHash]> {
        self.hashes.as_deref()
    }

    pub fn result(&self) -> Option<&HarvestResult> {
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    /// Commit the local ballot.
    pub fn set_ballot(&mut self, ballot: Ballot) -> Result<()> {
        if self.ballot.is_some() {
            return Err(already("ballot"));
        }
        let expected = self.expected_kind();
        if ballot.kind() != expected {
            return Err(AssemblyError::KindMismatch { expected, actual: ballot.kind() });
        }

        let hash = ballot.hash()?;
        debug!(harvest = %self.expected_id, "Ballot committed");
        self.ballot = Some((ballot, hash));
        Ok(())
    }

    /// Confirm the descriptor the assembly agreed on.
    pub fn set_harvest(&mut self, harvest: Harvest) -> Result<()> {
        if self.ballot.is_none() {
            return Err(missing("ballot"));
        }
        if self.harvest.is_some() {
            return Err(already("harvest"));
        }
        if harvest.id != self.expected_id {
            return Err(AssemblyError::WrongHarvest(format!(
                "expected id {}, got {}",
                self.expected_id, harvest.id
            )));
        }
        if harvest.question != self.expected_question {
            return Err(AssemblyError::WrongHarvest(format!("question differs for {}", harvest.id)));
        }
        if !harvest.is_participant(self.me.fingerprint()) {
            return Err(AssemblyError::WrongHarvest(format!("not a participant of {}", harvest.id)));
        }

        self.harvest = Some(harvest);
        Ok(())
    }

    fn own_hash(&self) -> Result<&BallotHash> {
        self.ballot.as_ref().map(|(_, h)| h).ok_or_else(|| missing("ballot"))
    }

    fn own_ballot(&self) -> Result<&Ballot> {
        self.ballot.as_ref().map(|(b, _)| b).ok_or_else(|| missing("ballot"))
    }

    fn confirmed_harvest(&self) -> Result<&Harvest> {
        self.harvest.as_ref().ok_or_else(|| missing("harvest"))
    }

    /// Fold our commitment into the running hash list.
    pub fn next_hash(
        &mut self,
        mut previous: Vec<BallotHash>,
        remaining: Vec<Fingerprint>,
    ) -> Result<RelayStep<BallotHash>> {
        self.confirmed_harvest()?;
        if self.hash_contributed || self.hashes.is_some() {
            return Err(already("hash contribution"));
        }

        previous.push(self.own_hash()?.clone());
        // sorted so the position of our hash says nothing about when we added it
        previous.sort();
        self.hash_contributed = true;

        Ok(relay_step(previous, remaining))
    }

    /// Accept the final commitment set.
    pub fn set_hashes(&mut self, hashes: Vec<BallotHash>) -> Result<()> {
        let harvest = self.confirmed_harvest()?;
        if self.hashes.is_some() {
            return Err(already("hashes"));
        }

        let own = self.own_hash()?;
        if !hashes.contains(own) {
            warn!(harvest = %harvest.id, "Own ballot hash missing from final set");
            return Err(AssemblyError::Censorship(format!(
                "own ballot hash missing from harvest {}",
                harvest.id
            )));
        }
        if hashes.len() != harvest.participants.len() {
            return Err(AssemblyError::Censorship(format!(
                "harvest {} has {} hashes for {} participants",
                harvest.id,
                hashes.len(),
                harvest.participants.len()
            )));
        }

        let mut hashes = hashes;
        hashes.sort();
        self.hashes = Some(hashes);
        Ok(())
    }

    /// Canonical bytes every participant signs: `{harvest, hashes}` encoded once.
    pub fn proof_bytes(&self) -> Result<Vec<u8>> {
        let harvest = self.confirmed_harvest()?;
        let hashes = self.hashes.as_ref().ok_or_else(|| missing("hashes"))?;
        Ok(serde_json::to_vec(&ValidationProof { harvest, hashes })?)
    }

    /// Our signature over the validation proof.
    pub fn my_validation(&self) -> Result<String> {
        Ok(self.me.sign(&self.proof_bytes()?))
    }

    /// Check every participant signed the same proof exactly once.
    pub fn set_validations(&mut self, signatures: &[(Fingerprint, String)], proofs: &ProofCache) -> Result<()> {
        if self.validations.is_some() {
            return Err(already("validations"));
        }
        let message = self.proof_bytes()?;
        let harvest = self.confirmed_harvest()?;

        let mut valid = BTreeMap::new();
        for (member, signature) in signatures {
            if !harvest.is_participant(member) || valid.contains_key(member) {
                return Err(AssemblyError::Validation(member.clone()));
            }
            let proof = proofs
                .get(member)
                .ok_or_else(|| AssemblyError::Validation(member.clone()))?;
            proof
                .verify(&message, signature)
                .map_err(|_| AssemblyError::Validation(member.clone()))?;
            valid.insert(member.clone(), signature.clone());
        }

        if let Some(absent) = harvest.participants.iter().find(|p| !valid.contains_key(*p)) {
            return Err(AssemblyError::Validation(absent.clone()));
        }

        info!(harvest = %harvest.id, signatures = valid.len(), "Commitments validated");
        self.validations = Some(valid);
        Ok(())
    }

    /// Add our plaintext ballot at a random position of the running list.
    pub fn next_ballot(
        &mut self,
        mut previous: Vec<Ballot>,
        remaining: Vec<Fingerprint>,
    ) -> Result<RelayStep<Ballot>> {
        if self.validations.is_none() {
            return Err(missing("validations"));
        }
        if self.ballot_contributed || self.ballots.is_some() {
            return Err(already("ballot contribution"));
        }

        let position = rand::thread_rng().gen_range(0..=previous.len());
        previous.insert(position, self.own_ballot()?.clone());
        self.ballot_contributed = true;

        Ok(relay_step(previous, remaining))
    }

    /// Verify the revealed ballots against the validated commitments.
    pub fn set_ballots(&mut self, revealed: Vec<Ballot>) -> Result<&HarvestResult> {
        if self.validations.is_none() {
            return Err(missing("validations"));
        }
        if self.ballots.is_some() {
            return Err(already("ballots"));
        }
        let harvest = self.confirmed_harvest()?;
        let hashes = self.hashes.as_ref().ok_or_else(|| missing("hashes"))?;

        verify_ballots(harvest.expected_kind(), hashes, &revealed)?;

        let result = HarvestResult::tally(harvest.expected_kind(), &revealed);
        info!(harvest = %harvest.id, ballots = revealed.len(), "Harvest verified");
        self.ballots = Some(revealed);
        Ok(self.result.insert(result))
    }
}

fn relay_step<T>(items: Vec<T>, mut remaining: Vec<Fingerprint>) -> RelayStep<T> {
    if remaining.is_empty() {
        RelayStep::Broadcast(items)
    } else {
        let to = remaining.remove(0);
        RelayStep::Forward { to, remaining, items }
    }
}

/// Every revealed ballot must consume exactly one validated hash, and none may be left over.
pub fn verify_ballots(kind: BallotKind, hashes: &[BallotHash], revealed: &[Ballot]) -> Result<()> {
    if revealed.len() != hashes.len() {
        return Err(AssemblyError::Mismatch(format!(
            "{} ballots revealed for {} commitments",
            revealed.len(),
            hashes.len()
        )));
    }

    let mut expected = multiset(hashes);
    for ballot in revealed {
        if ballot.kind() != kind {
            return Err(AssemblyError::Mismatch(format!("revealed {:?} ballot in a {kind:?} harvest", ballot.kind())));
        }
        let hash = ballot.hash()?;
        match expected.get_mut(&hash) {
            Some(count) if *count > 0 => *count -= 1,
            _ => return Err(AssemblyError::Mismatch(format!("revealed ballot {hash} was never committed"))),
        }
    }

    if let Some((hash, _)) = expected.iter().find(|(_, count)| **count > 0) {
        return Err(AssemblyError::Mismatch(format!("commitment {hash} left unmatched")));
    }
    Ok(())
}
