//! In-process assembly relay.
//!
//! Routes handshakes, presence and harvest traffic between sessions of the same
//! assembly. It only forwards what members hand it: relay payloads stay sealed and
//! every check that matters is done again on the member side.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembly::{Phase, Status};
use crate::ballot::Ballot;
use crate::crypto::signing::encode_b64;
use crate::error::{AssemblyError, Result};
use crate::harvest::{Harvest, HarvestResult};
use crate::membership::AssemblyDescriptor;
use crate::protocol::{
    AssemblyEvent, ClientMessage, HarvestingEvent, MemberEvent, ProtocolEvent, PublicEvent, ServerMessage,
    StateSnapshot,
};
use crate::registry::ProofCache;
use crate::session::{Channel, Connector, RemoteEnd};
use crate::types::{Fingerprint, Question, Readiness};

type Outbox = tokio::sync::mpsc::UnboundedSender<ServerMessage>;

/// Shared handle; clones talk to the same relay.
#[derive(Clone)]
pub struct LocalRelay {
    core: Arc<RelayCore>,
}

struct RelayCore {
    assembly: AssemblyDescriptor,
    min_participants: usize,
    proofs: ProofCache,
    reachable: AtomicBool,
    state: Mutex<RelayState>,
}

struct RelayState {
    next_connection: u64,
    connections: HashMap<Fingerprint, (u64, Outbox)>,
    questions: VecDeque<Question>,
    absent: BTreeMap<Fingerprint, chrono::DateTime<Utc>>,
    status: Status,
    validations: BTreeMap<Fingerprint, String>,
    censor_next_hash_set: bool,
}

impl LocalRelay {
    /// Open a relay for `assembly`; the first round asks the first of `questions`, or collects proposals.
    pub fn new(assembly: AssemblyDescriptor, min_participants: usize, questions: Vec<Question>) -> Self {
        let proofs = ProofCache::new(&assembly.id);
        let questions: VecDeque<Question> = questions.into();
        LocalRelay {
            core: Arc::new(RelayCore {
                assembly,
                min_participants,
                proofs,
                reachable: AtomicBool::new(true),
                state: Mutex::new(RelayState {
                    next_connection: 0,
                    connections: HashMap::new(),
                    absent: BTreeMap::new(),
                    status: Status::Waiting {
                        id: Uuid::new_v4().to_string(),
                        question: questions.front().cloned(),
                        readiness: BTreeMap::new(),
                    },
                    questions,
                    validations: BTreeMap::new(),
                    censor_next_hash_set: false,
                }),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(RelayConnector { core: self.core.clone() })
    }

    /// While false, every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.core.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop a member's connection as if the network went away.
    pub fn disconnect(&self, member: &Fingerprint) {
        let mut state = self.core.lock();
        if state.connections.remove(member).is_some() {
            info!(member = %member.short(), "Relay dropped connection");
            self.core.leave(&mut state, member);
        }
    }

    /// Queue questions as if a proposal harvest produced them.
    pub fn push_questions(&self, questions: Vec<Question>) {
        let mut state = self.core.lock();
        state.questions.extend(questions.iter().cloned());
        broadcast_all(&state, public(PublicEvent::NewQuestions { questions }));
    }

    /// Drop one hash from the next final commitment set before passing it on.
    pub fn censor_next_hash_set(&self) {
        self.core.lock().censor_next_hash_set = true;
    }

    pub fn status(&self) -> Status {
        self.core.lock().status.clone()
    }

    pub fn present(&self) -> Vec<Fingerprint> {
        self.core.lock().connections.keys().cloned().collect()
    }
}

struct RelayConnector {
    core: Arc<RelayCore>,
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self) -> Result<Channel> {
        if !self.core.reachable.load(Ordering::SeqCst) {
            return Err(AssemblyError::Connection("relay unreachable".into()));
        }
        let (channel, remote) = Channel::pair();
        let core = self.core.clone();
        tokio::spawn(async move { core.serve(remote).await });
        Ok(channel)
    }
}

fn public(event: PublicEvent) -> ServerMessage {
    ServerMessage::Event(AssemblyEvent::Public { public: event })
}

fn harvesting(event: HarvestingEvent) -> ServerMessage {
    ServerMessage::Event(AssemblyEvent::Harvesting { harvesting: event })
}

fn protocol(event: ProtocolEvent) -> ServerMessage {
    ServerMessage::Event(AssemblyEvent::Protocol { protocol: event })
}

fn broadcast_all(state: &RelayState, message: ServerMessage) {
    for (_, tx) in state.connections.values() {
        let _ = tx.send(message.clone());
    }
}

fn broadcast_others(state: &RelayState, except: &Fingerprint, message: ServerMessage) {
    for (member, (_, tx)) in &state.connections {
        if member != except {
            let _ = tx.send(message.clone());
        }
    }
}

fn send_to(state: &RelayState, member: &Fingerprint, message: ServerMessage) {
    match state.connections.get(member) {
        Some((_, tx)) => {
            let _ = tx.send(message);
        }
        None => debug!(member = %member.short(), "Dropping message for absent member"),
    }
}

fn fresh_readiness(state: &RelayState, trigger: Option<&Fingerprint>) -> BTreeMap<Fingerprint, Readiness> {
    state
        .connections
        .keys()
        .map(|m| {
            let value = if Some(m) == trigger { Readiness::Blocking } else { Readiness::Answering };
            (m.clone(), value)
        })
        .collect()
}

impl RelayCore {
    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn serve(self: Arc<Self>, remote: RemoteEnd) {
        let RemoteEnd { mut inbound, outbound } = remote;
        let member = match self.handshake(&mut inbound, &outbound).await {
            Ok(member) => member,
            Err(e) => {
                warn!(error = %e, "Relay handshake failed");
                let reason = match e {
                    AssemblyError::Rejected(reason) => reason,
                    other => other.to_string(),
                };
                let _ = outbound.send(ServerMessage::Error { fatal: true, reason });
                return;
            }
        };
        let connection = self.join(&member, outbound);

        while let Some(message) = inbound.recv().await {
            match message {
                ClientMessage::Event(event) => self.on_member_event(&member, event),
                other => debug!(member = %member.short(), "Ignoring {other:?} after handshake"),
            }
        }

        let mut state = self.lock();
        if state.connections.get(&member).is_some_and(|(id, _)| *id == connection) {
            state.connections.remove(&member);
            self.leave(&mut state, &member);
        }
    }

    async fn handshake(
        &self,
        inbound: &mut tokio::sync::mpsc::UnboundedReceiver<ClientMessage>,
        outbound: &Outbox,
    ) -> Result<Fingerprint> {
        let member = match inbound.recv().await {
            Some(ClientMessage::Hello { id, secret, member }) => {
                if id != self.assembly.id || secret != self.assembly.secret {
                    return Err(AssemblyError::Rejected("unknown assembly or wrong secret".into()));
                }
                member
            }
            _ => return Err(AssemblyError::ProtocolState("expected hello".into())),
        };

        let mut challenge = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut challenge);
        let identity_proof_needed = !self.proofs.contains(&member);
        outbound
            .send(ServerMessage::Challenge { challenge: encode_b64(&challenge), identity_proof_needed })
            .map_err(|_| AssemblyError::Connection("member went away".into()))?;

        let (signature, identity_proof) = match inbound.recv().await {
            Some(ClientMessage::Proof { signature, identity_proof }) => (signature, identity_proof),
            _ => return Err(AssemblyError::ProtocolState("expected proof".into())),
        };
        if let Some(proof) = identity_proof {
            if proof.fingerprint != member {
                return Err(AssemblyError::Rejected("identity proof is for another member".into()));
            }
            self.proofs.insert(proof)?;
        }
        let proof = self
            .proofs
            .get(&member)
            .ok_or_else(|| AssemblyError::Rejected("no identity proof on file".into()))?;
        proof
            .verify(&challenge, &signature)
            .map_err(|_| AssemblyError::Rejected("challenge signature invalid".into()))?;

        Ok(member)
    }

    fn join(&self, member: &Fingerprint, outbound: Outbox) -> u64 {
        let mut state = self.lock();
        state.next_connection += 1;
        let connection = state.next_connection;
        let rejoined = state.connections.insert(member.clone(), (connection, outbound)).is_some();

        if !rejoined {
            state.absent.remove(member);
            if let Status::Waiting { readiness, .. } = &mut state.status {
                readiness.entry(member.clone()).or_insert(Readiness::Answering);
            }
            broadcast_others(
                &state,
                member,
                public(PublicEvent::MemberPresence {
                    member: member.clone(),
                    present: true,
                    at: Utc::now(),
                    identity: self.proofs.get(member),
                }),
            );
        }

        let snapshot = StateSnapshot {
            questions: state.questions.iter().cloned().collect(),
            present: state.connections.keys().cloned().collect(),
            absent: state.absent.iter().map(|(m, at)| (m.clone(), *at)).collect(),
            status: state.status.clone(),
            identities: self.proofs.all(),
        };
        send_to(&state, member, ServerMessage::Established { state: snapshot });
        info!(member = %member.short(), present = state.connections.len(), "Member joined");

        self.check_trigger(&mut state);
        connection
    }

    fn leave(&self, state: &mut RelayState, member: &Fingerprint) {
        let at = Utc::now();
        state.absent.insert(member.clone(), at);
        broadcast_all(
            state,
            public(PublicEvent::MemberPresence { member: member.clone(), present: false, at, identity: None }),
        );

        let participant = match &mut state.status {
            Status::Waiting { readiness, .. } => {
                readiness.remove(member);
                false
            }
            Status::Harvesting { harvest, .. } => harvest.is_participant(member),
            Status::Hidden => false,
        };
        if participant {
            self.revert(state, None);
        } else {
            self.check_trigger(state);
        }
    }

    fn on_member_event(&self, member: &Fingerprint, event: MemberEvent) {
        let mut state = self.lock();
        let state = &mut *state;
        match event {
            MemberEvent::Blocking { readiness: value } => {
                if let Status::Waiting { readiness, .. } = &mut state.status {
                    readiness.insert(member.clone(), value);
                    broadcast_others(
                        state,
                        member,
                        public(PublicEvent::MemberBlocking { member: member.clone(), readiness: value }),
                    );
                    self.check_trigger(state);
                }
            }
            MemberEvent::Accept => {
                if let Status::Harvesting { phase: Phase::Proposed { remaining }, .. } = &mut state.status {
                    remaining.remove(member);
                    broadcast_all(state, harvesting(HarvestingEvent::Accepted { member: member.clone() }));
                    self.maybe_start(state);
                }
            }
            MemberEvent::Refuse => {
                let proposed = matches!(
                    &state.status,
                    Status::Harvesting { harvest, phase: Phase::Proposed { .. } } if harvest.is_participant(member)
                );
                if !proposed {
                    debug!(member = %member.short(), "Ignoring refusal outside Proposed");
                    return;
                }
                broadcast_others(state, member, harvesting(HarvestingEvent::Refused { member: member.clone() }));
                self.revert(state, Some(member));
            }
            MemberEvent::Invalid { reason } => {
                if Self::current_harvest(state).is_some_and(|h| h.is_participant(member)) {
                    warn!(member = %member.short(), %reason, "Participant rejected the harvest");
                    broadcast_others(state, member, harvesting(HarvestingEvent::Invalid { reason }));
                    self.revert(state, None);
                }
            }
            event if !Self::started_by(state, member) => {
                debug!(member = %member.short(), "Dropping {event:?} outside a started harvest");
            }
            MemberEvent::HashRelay { to, remaining, payload } => {
                if Self::started_by(state, &to) {
                    send_to(state, &to, protocol(ProtocolEvent::Hash { previous: Some(payload), remaining }));
                }
            }
            MemberEvent::HashSet { mut hashes } => {
                if std::mem::take(&mut state.censor_next_hash_set) && !hashes.is_empty() {
                    warn!("Censoring one commitment");
                    hashes.remove(0);
                }
                self.to_participants(state, protocol(ProtocolEvent::Validate { hashes }));
            }
            MemberEvent::Validation { signature } => self.on_validation(state, member, signature),
            MemberEvent::BallotRelay { to, remaining, payload } => {
                if Self::started_by(state, &to) {
                    send_to(state, &to, protocol(ProtocolEvent::Ballot { previous: Some(payload), remaining }));
                }
            }
            MemberEvent::BallotSet { ballots } => self.on_ballots(state, ballots),
        }
    }

    fn current_harvest(state: &RelayState) -> Option<&Harvest> {
        match &state.status {
            Status::Harvesting { harvest, .. } => Some(harvest),
            _ => None,
        }
    }

    /// True while a harvest is Started and `member` takes part in it.
    fn started_by(state: &RelayState, member: &Fingerprint) -> bool {
        matches!(&state.status, Status::Harvesting { harvest, phase: Phase::Started } if harvest.is_participant(member))
    }

    fn to_participants(&self, state: &RelayState, message: ServerMessage) {
        if let Some(harvest) = Self::current_harvest(state) {
            for participant in &harvest.participants {
                send_to(state, participant, message.clone());
            }
        }
    }

    /// Same trigger the members evaluate: everyone present is Ready and there are enough of them.
    fn check_trigger(&self, state: &mut RelayState) {
        let (id, question) = match &state.status {
            Status::Waiting { id, question, readiness } => {
                let enough = state.connections.len() >= self.min_participants;
                let all_ready = state.connections.keys().all(|m| readiness.get(m) == Some(&Readiness::Ready));
                if !(enough && all_ready) {
                    return;
                }
                (id.clone(), question.clone())
            }
            _ => return,
        };

        let harvest = Harvest::new(id, question, state.connections.keys().cloned());
        let remaining: BTreeSet<Fingerprint> = harvest.participants.iter().cloned().collect();
        info!(harvest = %harvest.id, participants = harvest.participants.len(), "Relay saw harvest proposed");
        state.validations.clear();
        state.status = Status::Harvesting { harvest, phase: Phase::Proposed { remaining } };
    }

    fn maybe_start(&self, state: &mut RelayState) {
        let first = match &mut state.status {
            Status::Harvesting { harvest, phase } => {
                if !matches!(&*phase, Phase::Proposed { remaining } if remaining.is_empty()) {
                    return;
                }
                *phase = Phase::Started;
                harvest.participants.split_first().map(|(first, rest)| (first.clone(), rest.to_vec()))
            }
            _ => return,
        };

        if let Some((first, remaining)) = first {
            info!(first = %first.short(), "Relay starting hash relay");
            send_to(state, &first, protocol(ProtocolEvent::Hash { previous: None, remaining }));
        }
    }

    fn on_validation(&self, state: &mut RelayState, member: &Fingerprint, signature: String) {
        let Some(harvest) = Self::current_harvest(state) else {
            return;
        };
        if !harvest.is_participant(member) {
            return;
        }
        let participants = harvest.participants.clone();
        state.validations.insert(member.clone(), signature);
        if state.validations.len() < participants.len() {
            return;
        }

        let signatures: Vec<(Fingerprint, String)> = std::mem::take(&mut state.validations).into_iter().collect();
        self.to_participants(state, protocol(ProtocolEvent::Validity { signatures }));
        if let Some((first, rest)) = participants.split_first() {
            send_to(state, first, protocol(ProtocolEvent::Ballot { previous: None, remaining: rest.to_vec() }));
        }
    }

    fn on_ballots(&self, state: &mut RelayState, ballots: Vec<Ballot>) {
        let Some(harvest) = Self::current_harvest(state).cloned() else {
            return;
        };
        self.to_participants(state, protocol(ProtocolEvent::Ballots { ballots: ballots.clone() }));

        if let HarvestResult::Questions { questions } = HarvestResult::tally(harvest.expected_kind(), &ballots) {
            if !questions.is_empty() {
                state.questions.extend(questions.iter().cloned());
                broadcast_all(state, public(PublicEvent::NewQuestions { questions }));
            }
        }
        if harvest.question.is_some() {
            state.questions.pop_front();
        }

        let next_id = Uuid::new_v4().to_string();
        state.status = Status::Waiting {
            id: next_id.clone(),
            question: state.questions.front().cloned(),
            readiness: fresh_readiness(state, None),
        };
        info!(harvest = %harvest.id, next = %next_id, "Round closed");
        broadcast_all(state, public(PublicEvent::QuestionDone { next_id }));
    }

    fn revert(&self, state: &mut RelayState, trigger: Option<&Fingerprint>) {
        let (id, question) = match &state.status {
            Status::Harvesting { harvest, .. } => (harvest.id.clone(), harvest.question.clone()),
            _ => return,
        };
        state.validations.clear();
        state.status = Status::Waiting { id, question, readiness: fresh_readiness(state, trigger) };
    }
}

