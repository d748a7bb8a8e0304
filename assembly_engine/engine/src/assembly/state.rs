use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::assembly::{Notification, Outcome, Phase, Status};
use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::ballot::{Ballot, BallotHash};
use crate::config::AssemblyConfig;
use crate::crypto::signing::{decode_b64, encode_b64};
use crate::error::{AssemblyError, Result};
use crate::harvest::{Harvest, HarvestState, RelayStep};
use crate::identity::{IdentityProof, Me};
use crate::protocol::{AssemblyEvent, HarvestingEvent, MemberEvent, ProtocolEvent, PublicEvent, StateSnapshot};
use crate::registry::ProofCache;
use crate::types::{Fingerprint, Question, Readiness};

/// Local view of one assembly. Only `update` and the user actions mutate it,
/// and callers serialize both behind one lock.
pub struct AssemblyState {
    config: AssemblyConfig,
    me: Arc<Me>,
    proofs: Arc<ProofCache>,
    audit: Arc<AuditTracker>,
    questions: VecDeque<Question>,
    present: BTreeSet<Fingerprint>,
    absent: BTreeMap<Fingerprint, DateTime<Utc>>,
    status: Status,
    harvest: Option<HarvestState>,
}

impl AssemblyState {
    pub fn new(config: AssemblyConfig, me: Arc<Me>, proofs: Arc<ProofCache>, audit: Arc<AuditTracker>) -> Self {
        AssemblyState {
            config,
            me,
            proofs,
            audit,
            questions: VecDeque::new(),
            present: BTreeSet::new(),
            absent: BTreeMap::new(),
            status: Status::Hidden,
            harvest: None,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter()
    }

    pub fn present(&self) -> &BTreeSet<Fingerprint> {
        &self.present
    }

    pub fn absent(&self) -> &BTreeMap<Fingerprint, DateTime<Utc>> {
        &self.absent
    }

    pub fn harvest_state(&self) -> Option<&HarvestState> {
        self.harvest.as_ref()
    }

    pub fn me(&self) -> &Me {
        &self.me
    }

    /// Apply one inbound event. On error the assembly is already back to Waiting.
    pub fn update(&mut self, event: AssemblyEvent) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        match self.apply(event, &mut outcome) {
            Ok(()) => Ok(outcome),
            Err(e) => {
                let harvest_id = self.status.round_id().map(str::to_string);
                self.audit.log(AuditRecord::new(AuditEventType::Failure, harvest_id.as_deref(), e.to_string()));
                self.force_waiting(None);
                Err(e)
            }
        }
    }

    fn apply(&mut self, event: AssemblyEvent, out: &mut Outcome) -> Result<()> {
        match event {
            AssemblyEvent::State { state } => self.apply_snapshot(state, out),
            AssemblyEvent::Status { status } => {
                self.replace_status(status)?;
                self.after_mutation(out)
            }
            AssemblyEvent::Public { public } => self.apply_public(public, out),
            AssemblyEvent::Harvesting { harvesting } => self.apply_harvesting(harvesting, out),
            AssemblyEvent::Protocol { protocol } => self.apply_protocol(protocol, out),
        }
    }

    fn apply_snapshot(&mut self, state: StateSnapshot, out: &mut Outcome) -> Result<()> {
        for proof in state.identities {
            self.trust(proof)?;
        }
        self.questions = state.questions.into_iter().collect();
        self.present = state.present.into_iter().collect();
        self.absent = state.absent.into_iter().collect();
        self.replace_status(state.status)?;
        self.after_mutation(out)
    }

    fn replace_status(&mut self, status: Status) -> Result<()> {
        // keep local progress only if it belongs to the same, still running round
        let same_round = self.harvest.as_ref().map(|h| h.id()) == status.round_id();
        let aborted = status.is_waiting() && self.harvest.as_ref().is_some_and(|h| h.harvest().is_some());
        if !same_round || aborted {
            self.harvest = None;
        }
        if let Status::Harvesting { harvest, .. } = &status {
            if let Some(state) = self.harvest.as_mut() {
                if state.harvest().is_none() && harvest.is_participant(self.me.fingerprint()) {
                    state.set_harvest(harvest.clone())?;
                }
            }
        }
        self.status = status;
        Ok(())
    }

    fn trust(&self, proof: IdentityProof) -> Result<()> {
        self.proofs.insert(proof).map(|_| ())
    }

    fn apply_public(&mut self, event: PublicEvent, out: &mut Outcome) -> Result<()> {
        match event {
            PublicEvent::MemberPresence { member, present: true, identity, .. } => {
                if let Some(proof) = identity {
                    if proof.fingerprint != member {
                        return Err(AssemblyError::Integrity(crate::error::IntegrityCheck::Fingerprint));
                    }
                    self.trust(proof)?;
                }
                self.absent.remove(&member);
                self.present.insert(member.clone());
                if let Status::Waiting { readiness, .. } = &mut self.status {
                    readiness.entry(member).or_insert(Readiness::Answering);
                }
                self.after_mutation(out)
            }
            PublicEvent::MemberPresence { member, present: false, at, .. } => {
                self.present.remove(&member);
                self.absent.insert(member.clone(), at);
                let participant_left = match &mut self.status {
                    Status::Waiting { readiness, .. } => {
                        readiness.remove(&member);
                        false
                    }
                    Status::Harvesting { harvest, .. } => harvest.is_participant(&member),
                    Status::Hidden => false,
                };
                if participant_left {
                    info!(member = %member.short(), "Participant left mid-harvest");
                    self.revert_to_waiting(None, out);
                    return Ok(());
                }
                self.after_mutation(out)
            }
            PublicEvent::MemberBlocking { member, readiness: value } => {
                match &mut self.status {
                    Status::Waiting { readiness, .. } => {
                        if let Some(slot) = readiness.get_mut(&member) {
                            *slot = value;
                        } else {
                            debug!(member = %member.short(), "Readiness from a member not present");
                        }
                    }
                    _ => debug!(member = %member.short(), "Ignoring readiness outside Waiting"),
                }
                self.after_mutation(out)
            }
            PublicEvent::NewQuestions { questions } => {
                info!(count = questions.len(), "New questions queued");
                self.questions.extend(questions);
                Ok(())
            }
            PublicEvent::QuestionDone { next_id } => {
                if self.status.round_question().is_some() {
                    self.questions.pop_front();
                }
                self.harvest = None;
                self.status = Status::Waiting {
                    id: next_id,
                    question: self.questions.front().cloned(),
                    readiness: self.fresh_readiness(None),
                };
                out.notifications.push(Notification::Status(self.status.clone()));
                Ok(())
            }
        }
    }

    fn apply_harvesting(&mut self, event: HarvestingEvent, out: &mut Outcome) -> Result<()> {
        match event {
            HarvestingEvent::Accepted { member } => {
                if let Status::Harvesting { phase: Phase::Proposed { remaining }, .. } = &mut self.status {
                    remaining.remove(&member);
                    self.maybe_start(out);
                } else {
                    debug!(member = %member.short(), "Ignoring accept outside Proposed");
                }
                Ok(())
            }
            HarvestingEvent::Refused { member } => {
                if matches!(self.status, Status::Harvesting { phase: Phase::Proposed { .. }, .. }) {
                    info!(member = %member.short(), "Harvest refused");
                    self.revert_to_waiting(Some(&member), out);
                } else {
                    debug!(member = %member.short(), "Ignoring refusal outside Proposed");
                }
                Ok(())
            }
            HarvestingEvent::Invalid { reason } => {
                if matches!(self.status, Status::Harvesting { .. }) {
                    warn!(%reason, "Relay declared harvest invalid");
                    self.revert_to_waiting(None, out);
                    out.notifications.push(Notification::HarvestFailed { reason });
                }
                Ok(())
            }
        }
    }

    fn apply_protocol(&mut self, event: ProtocolEvent, out: &mut Outcome) -> Result<()> {
        // traffic of a harvest we already left
        if !matches!(self.status, Status::Harvesting { .. }) {
            debug!("Dropping protocol event outside a harvest");
            return Ok(());
        }
        if !self.status.is_started() {
            return Err(AssemblyError::ProtocolState("protocol event before harvest started".into()));
        }
        let me = self.me.clone();
        let proofs = self.proofs.clone();
        let audit = self.audit.clone();
        let state = self
            .harvest
            .as_mut()
            .filter(|h| h.harvest().is_some())
            .ok_or_else(|| AssemblyError::ProtocolState("no harvest in progress locally".into()))?;
        let harvest_id = state.id().to_string();

        match event {
            ProtocolEvent::Hash { previous, remaining } => {
                let previous: Vec<BallotHash> = open_relay(&me, previous)?;
                let event = match state.next_hash(previous, remaining)? {
                    RelayStep::Forward { to, remaining, items } => MemberEvent::HashRelay {
                        payload: seal_relay(&proofs, &to, &items)?,
                        to,
                        remaining,
                    },
                    RelayStep::Broadcast(hashes) => MemberEvent::HashSet { hashes },
                };
                audit.log(AuditRecord::new(AuditEventType::Commit, Some(&harvest_id), "hash relayed"));
                out.outbound.push(event);
            }
            ProtocolEvent::Validate { hashes } => {
                state.set_hashes(hashes)?;
                out.outbound.push(MemberEvent::Validation { signature: state.my_validation()? });
            }
            ProtocolEvent::Validity { signatures } => {
                state.set_validations(&signatures, &proofs)?;
                audit.log(AuditRecord::new(
                    AuditEventType::Validation,
                    Some(&harvest_id),
                    format!("{} signatures verified", signatures.len()),
                ));
            }
            ProtocolEvent::Ballot { previous, remaining } => {
                let previous: Vec<Ballot> = open_relay(&me, previous)?;
                let event = match state.next_ballot(previous, remaining)? {
                    RelayStep::Forward { to, remaining, items } => MemberEvent::BallotRelay {
                        payload: seal_relay(&proofs, &to, &items)?,
                        to,
                        remaining,
                    },
                    RelayStep::Broadcast(ballots) => MemberEvent::BallotSet { ballots },
                };
                audit.log(AuditRecord::new(AuditEventType::Reveal, Some(&harvest_id), "ballot relayed"));
                out.outbound.push(event);
            }
            ProtocolEvent::Ballots { ballots } => {
                let result = state.set_ballots(ballots)?.clone();
                let harvest = state.harvest().cloned().ok_or_else(|| {
                    AssemblyError::Internal("verified harvest without descriptor".into())
                })?;
                audit.log(AuditRecord::new(
                    AuditEventType::Verification,
                    Some(&harvest_id),
                    format!("{result:?}"),
                ));
                out.notifications.push(Notification::HarvestCompleted { harvest, result });
            }
        }
        Ok(())
    }

    /// Commit the local ballot for the current Waiting round and mark ourselves ready.
    pub fn choose(&mut self, ballot: Ballot) -> Result<Outcome> {
        let me = self.me.fingerprint().clone();
        let (id, question) = match &self.status {
            Status::Waiting { id, question, readiness } if readiness.contains_key(&me) => {
                (id.clone(), question.clone())
            }
            _ => return Err(AssemblyError::ProtocolState("can only choose while present and Waiting".into())),
        };

        if let Some(existing) = &self.harvest {
            if existing.id() == id && existing.ballot().is_some() {
                return Err(AssemblyError::ProtocolState("ballot already set".into()));
            }
        }
        let mut state = HarvestState::new(self.me.clone(), &id, question);
        state.set_ballot(ballot)?;
        self.harvest = Some(state);
        self.audit.log(AuditRecord::new(AuditEventType::Commit, Some(&id), "ballot chosen"));

        let mut out = Outcome::default();
        self.set_own_readiness(Readiness::Ready, &mut out)?;
        Ok(out)
    }

    /// Block or unblock the start of the next harvest.
    pub fn set_blocking(&mut self, blocking: bool) -> Result<Outcome> {
        let readiness = if blocking {
            Readiness::Blocking
        } else if self.has_ballot_for_round() {
            Readiness::Ready
        } else {
            Readiness::Answering
        };

        let mut out = Outcome::default();
        self.set_own_readiness(readiness, &mut out)?;
        Ok(out)
    }

    pub fn accept(&mut self) -> Result<Outcome> {
        let me = self.me.fingerprint().clone();
        let mut out = Outcome::default();
        let accepted = match &mut self.status {
            Status::Harvesting { phase: Phase::Proposed { remaining }, .. } => remaining.remove(&me),
            _ => false,
        };
        if !accepted {
            return Err(AssemblyError::ProtocolState("nothing to accept".into()));
        }

        out.outbound.push(MemberEvent::Accept);
        self.maybe_start(&mut out);
        Ok(out)
    }

    pub fn refuse(&mut self) -> Result<Outcome> {
        let me = self.me.fingerprint().clone();
        let refusable = matches!(
            &self.status,
            Status::Harvesting { harvest, phase: Phase::Proposed { .. } } if harvest.is_participant(&me)
        );
        if !refusable {
            return Err(AssemblyError::ProtocolState("nothing to refuse".into()));
        }

        let mut out = Outcome::default();
        out.outbound.push(MemberEvent::Refuse);
        self.revert_to_waiting(Some(&me), &mut out);
        Ok(out)
    }

    /// Revert to Waiting after a failure raised outside `update`.
    pub fn force_waiting(&mut self, trigger: Option<&Fingerprint>) -> Outcome {
        let mut out = Outcome::default();
        if matches!(self.status, Status::Harvesting { .. }) {
            self.revert_to_waiting(trigger, &mut out);
        }
        out
    }

    fn has_ballot_for_round(&self) -> bool {
        match (&self.harvest, self.status.round_id()) {
            (Some(state), Some(id)) => state.id() == id && state.ballot().is_some(),
            _ => false,
        }
    }

    fn set_own_readiness(&mut self, value: Readiness, out: &mut Outcome) -> Result<()> {
        let me = self.me.fingerprint().clone();
        match &mut self.status {
            Status::Waiting { readiness, .. } if readiness.contains_key(&me) => {
                readiness.insert(me, value);
            }
            _ => return Err(AssemblyError::ProtocolState("readiness only changes while present and Waiting".into())),
        }
        out.outbound.push(MemberEvent::Blocking { readiness: value });
        self.after_mutation(out)
    }

    fn fresh_readiness(&self, trigger: Option<&Fingerprint>) -> BTreeMap<Fingerprint, Readiness> {
        self.present
            .iter()
            .map(|member| {
                let value = if Some(member) == trigger { Readiness::Blocking } else { Readiness::Answering };
                (member.clone(), value)
            })
            .collect()
    }

    /// Abort the harvest and go back to Waiting on the same round.
    fn revert_to_waiting(&mut self, trigger: Option<&Fingerprint>, out: &mut Outcome) {
        let (id, question) = match &self.status {
            Status::Harvesting { harvest, .. } => (harvest.id.clone(), harvest.question.clone()),
            _ => return,
        };

        self.harvest = None;
        self.status = Status::Waiting { id: id.clone(), question, readiness: self.fresh_readiness(trigger) };

        let cause = trigger.map_or_else(|| "no trigger".to_string(), |t| format!("triggered by {}", t.short()));
        self.audit.log(AuditRecord::new(AuditEventType::Revert, Some(&id), cause));
        out.notifications.push(Notification::Status(self.status.clone()));
    }

    /// The one place the harvest trigger is evaluated, after every presence or readiness change.
    fn after_mutation(&mut self, out: &mut Outcome) -> Result<()> {
        let (id, question) = match &self.status {
            Status::Waiting { id, question, readiness } => {
                let enough = self.present.len() >= self.config.min_participants;
                let all_ready = self.present.iter().all(|m| readiness.get(m) == Some(&Readiness::Ready));
                if !(enough && all_ready) {
                    return Ok(());
                }
                (id.clone(), question.clone())
            }
            _ => return Ok(()),
        };

        let harvest = Harvest::new(id, question, self.present.iter().cloned());
        let mut remaining: BTreeSet<Fingerprint> = harvest.participants.iter().cloned().collect();
        let me = self.me.fingerprint().clone();

        if harvest.is_participant(&me) {
            let state = self
                .harvest
                .as_mut()
                .filter(|s| s.id() == harvest.id)
                .ok_or_else(|| AssemblyError::ProtocolState("participant without a committed ballot".into()))?;
            state.set_harvest(harvest.clone())?;

            if self.config.auto_accept {
                remaining.remove(&me);
                out.outbound.push(MemberEvent::Accept);
            }
        }

        info!(harvest = %harvest.id, participants = harvest.participants.len(), "Harvest proposed");
        self.status = Status::Harvesting { harvest, phase: Phase::Proposed { remaining } };
        out.notifications.push(Notification::Status(self.status.clone()));
        self.maybe_start(out);
        Ok(())
    }

    fn maybe_start(&mut self, out: &mut Outcome) {
        if let Status::Harvesting { harvest, phase } = &mut self.status {
            if matches!(phase, Phase::Proposed { remaining } if remaining.is_empty()) {
                *phase = Phase::Started;
                info!(harvest = %harvest.id, "Harvest started");
                out.notifications.push(Notification::Status(self.status.clone()));
            }
        }
    }
}

fn open_relay<T: serde::de::DeserializeOwned>(me: &Me, payload: Option<String>) -> Result<Vec<T>> {
    match payload {
        None => Ok(Vec::new()),
        Some(encoded) => {
            let plaintext = me.decrypt(&decode_b64(&encoded)?)?;
            Ok(serde_json::from_slice(&plaintext)?)
        }
    }
}

fn seal_relay<T: serde::Serialize>(proofs: &ProofCache, to: &Fingerprint, items: &[T]) -> Result<String> {
    let recipient = proofs.require(to)?;
    let sealed = recipient.encrypt_for(&serde_json::to_vec(items)?)?;
    Ok(encode_b64(&sealed))
}
