use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::assembly::{Notification, Status};
use crate::ballot::{Ballot, BallotConfig};
use crate::config::AssemblyConfig;
use crate::crypto::signing::decode_b64;
use crate::error::{AssemblyError, Result};
use crate::harvest::HarvestResult;
use crate::membership::{AssemblyDescriptor, Membership};
use crate::protocol::{ClientMessage, MemberEvent, ServerMessage};
use crate::relay::LocalRelay;
use crate::session::{Channel, ConnectionState, Connector, Session};
use crate::store::CredentialStore;
use crate::types::{Fingerprint, Question, Readiness};

fn descriptor() -> AssemblyDescriptor {
    AssemblyDescriptor { id: "assembly-1".into(), secret: "s3cret".into(), name: "Tenants".into() }
}

fn fast_config() -> AssemblyConfig {
    AssemblyConfig {
        auto_accept: true,
        reconnect_delay_ms: 20,
        handshake_timeout_ms: 2_000,
        ..AssemblyConfig::default()
    }
}

async fn expect<F>(rx: &mut broadcast::Receiver<Notification>, wanted: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(n) if wanted(&n) => return n,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("notification channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn wait_for_status<F>(session: &Session, wanted: F)
where
    F: Fn(&Status) -> bool,
{
    for _ in 0..1_000 {
        if wanted(&session.status().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never reached, last: {:?}", session.status().await);
}

/// Start `count` sessions and wait until each sees everyone present.
async fn join(relay: &LocalRelay, count: usize) -> Vec<Session> {
    let mut sessions = Vec::new();
    for i in 0..count {
        let membership = Membership::create(descriptor(), &format!("member-{i}")).unwrap();
        let session = Session::new(membership, fast_config(), relay.connector()).unwrap();
        session.start().await;
        sessions.push(session);
    }
    for session in &sessions {
        wait_for_status(session, |s| matches!(s, Status::Waiting { readiness, .. } if readiness.len() == count)).await;
    }
    sessions
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_members_answer_closed_question() {
    let question = Question::closed("Repaint the hall?");
    let relay = LocalRelay::new(descriptor(), 2, vec![question.clone()]);
    let sessions = join(&relay, 3).await;
    let mut receivers: Vec<_> = sessions.iter().map(Session::subscribe).collect();

    for (session, answer) in sessions.iter().zip([true, false, true]) {
        session.choose(Ballot::closed(answer, &BallotConfig::default()).unwrap()).await.unwrap();
    }

    for rx in &mut receivers {
        let done = expect(rx, |n| matches!(n, Notification::HarvestCompleted { .. })).await;
        assert_matches!(done, Notification::HarvestCompleted { harvest, result } => {
            assert_eq!(harvest.question, Some(question.clone()));
            assert_eq!(harvest.participants.len(), 3);
            assert_eq!(result, HarvestResult::Closed { yes: 2, no: 1 });
        });
    }

    for session in &sessions {
        wait_for_status(session, |s| matches!(s, Status::Waiting { question: None, .. })).await;
        assert!(session.audit().recent(50).iter().any(|r| r.event_type_label() == "VERIFY"));
        session.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proposal_round_queues_questions() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let sessions = join(&relay, 2).await;
    let mut rx = sessions[0].subscribe();
    let proposal = Question::open("Where should the party be?");
    let config = BallotConfig::default();

    sessions[0].choose(Ballot::question(Some(proposal.clone()), &config).unwrap()).await.unwrap();
    sessions[1].choose(Ballot::question(None, &config).unwrap()).await.unwrap();

    let done = expect(&mut rx, |n| matches!(n, Notification::HarvestCompleted { .. })).await;
    assert_matches!(done, Notification::HarvestCompleted { result: HarvestResult::Questions { questions }, .. } => {
        assert_eq!(questions, vec![proposal.clone()]);
    });

    for session in &sessions {
        wait_for_status(session, |s| s.round_question() == Some(&proposal)).await;
        session.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_censored_commitment_fails_harvest() {
    let relay = LocalRelay::new(descriptor(), 2, vec![Question::closed("Quiet hours?")]);
    let sessions = join(&relay, 2).await;
    let mut receivers: Vec<_> = sessions.iter().map(Session::subscribe).collect();
    relay.censor_next_hash_set();

    for session in &sessions {
        session.choose(Ballot::closed(true, &BallotConfig::default()).unwrap()).await.unwrap();
    }

    for rx in &mut receivers {
        let failed = expect(rx, |n| matches!(n, Notification::HarvestFailed { .. })).await;
        assert_matches!(failed, Notification::HarvestFailed { reason } if reason.contains("Censorship"));
    }
    for session in &sessions {
        assert!(session.status().await.is_waiting());
        assert!(session.audit().last_failure().is_some());
        assert_eq!(session.connection_state(), ConnectionState::Established);
    }

    // the relay went back to Waiting too, so the same round can run again
    for _ in 0..500 {
        if relay.status().is_waiting() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(relay.status().is_waiting());
    for session in &sessions {
        session.choose(Ballot::closed(false, &BallotConfig::default()).unwrap()).await.unwrap();
    }
    for rx in &mut receivers {
        let done = expect(rx, |n| matches!(n, Notification::HarvestCompleted { .. })).await;
        assert_matches!(done, Notification::HarvestCompleted { result, .. } => {
            assert_eq!(result, HarvestResult::Closed { yes: 0, no: 2 });
        });
    }
    for session in &sessions {
        session.stop().await;
    }
}

/// Connect without a `Session`, answering the handshake by hand.
async fn connect_raw(relay: &LocalRelay, membership: &Membership) -> Channel {
    let me = &membership.me;
    let mut channel = relay.connector().connect().await.unwrap();
    channel
        .outbound
        .send(ClientMessage::Hello {
            id: membership.assembly.id.clone(),
            secret: membership.assembly.secret.clone(),
            member: me.fingerprint().clone(),
        })
        .unwrap();
    let challenge = match channel.inbound.recv().await {
        Some(ServerMessage::Challenge { challenge, .. }) => challenge,
        other => panic!("expected challenge, got {other:?}"),
    };
    channel
        .outbound
        .send(ClientMessage::Proof {
            signature: me.sign(&decode_b64(&challenge).unwrap()),
            identity_proof: Some(me.identity_proof()),
        })
        .unwrap();
    assert_matches!(channel.inbound.recv().await, Some(ServerMessage::Established { .. }));
    channel
}

async fn wait_for_relay<F>(relay: &LocalRelay, wanted: F)
where
    F: Fn(&Status) -> bool,
{
    for _ in 0..1_000 {
        if wanted(&relay.status()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay status never reached, last: {:?}", relay.status());
}

/// Two sessions and one hand-driven member, all three inside a started harvest.
/// The hand-driven member never relays, so the harvest stays started.
async fn started_with_raw_member(relay: &LocalRelay) -> (Vec<Session>, Channel, Fingerprint) {
    let sessions = join(relay, 2).await;
    let raw = Membership::create(descriptor(), "silent").unwrap();
    let raw_fp = raw.me.fingerprint().clone();
    let channel = connect_raw(relay, &raw).await;
    for session in &sessions {
        wait_for_status(session, |s| matches!(s, Status::Waiting { readiness, .. } if readiness.len() == 3)).await;
    }

    let event = |e| ClientMessage::Event(e);
    channel.outbound.send(event(MemberEvent::Blocking { readiness: Readiness::Ready })).unwrap();
    for session in &sessions {
        session.choose(Ballot::closed(true, &BallotConfig::default()).unwrap()).await.unwrap();
    }
    wait_for_relay(relay, |s| matches!(s, Status::Harvesting { .. })).await;
    channel.outbound.send(event(MemberEvent::Accept)).unwrap();

    wait_for_relay(relay, Status::is_started).await;
    for session in &sessions {
        wait_for_status(session, Status::is_started).await;
    }
    (sessions, channel, raw_fp)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refusal_after_start_is_ignored_by_relay() {
    let relay = LocalRelay::new(descriptor(), 2, vec![Question::closed("New lock?")]);
    let (sessions, channel, _) = started_with_raw_member(&relay).await;

    channel.outbound.send(ClientMessage::Event(MemberEvent::Refuse)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(relay.status().is_started());
    for session in &sessions {
        assert!(session.status().await.is_started());
        session.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_relay_traffic_after_departure_is_harmless() {
    let relay = LocalRelay::new(descriptor(), 2, vec![Question::closed("New lock?")]);
    let (sessions, channel, raw_fp) = started_with_raw_member(&relay).await;
    let mut receivers: Vec<_> = sessions.iter().map(Session::subscribe).collect();
    let target = sessions[0].membership().me.fingerprint().clone();

    // the relay forgets the member, but messages it already sent keep arriving
    relay.disconnect(&raw_fp);
    for session in &sessions {
        wait_for_status(session, Status::is_waiting).await;
    }
    let stale = [
        MemberEvent::HashRelay { to: target.clone(), remaining: Vec::new(), payload: "AAAA".into() },
        MemberEvent::HashSet { hashes: Vec::new() },
        MemberEvent::BallotRelay { to: target, remaining: Vec::new(), payload: "AAAA".into() },
        MemberEvent::BallotSet { ballots: Vec::new() },
    ];
    for event in stale {
        channel.outbound.send(ClientMessage::Event(event)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for session in &sessions {
        assert_eq!(session.connection_state(), ConnectionState::Established);
        assert!(session.status().await.is_waiting());
    }

    // the two remaining members can still finish the round
    for (session, answer) in sessions.iter().zip([true, false]) {
        session.choose(Ballot::closed(answer, &BallotConfig::default()).unwrap()).await.unwrap();
    }
    for rx in &mut receivers {
        let done = expect(rx, |n| matches!(n, Notification::HarvestCompleted { .. })).await;
        assert_matches!(done, Notification::HarvestCompleted { result, .. } => {
            assert_eq!(result, HarvestResult::Closed { yes: 1, no: 1 });
        });
    }
    for session in &sessions {
        assert!(session.audit().last_failure().is_none());
        session.stop().await;
    }
}

struct Unreachable {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connector for Unreachable {
    async fn connect(&self) -> Result<Channel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AssemblyError::Connection("connection refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_never_established_is_fatal_without_retry() {
    let connector = Arc::new(Unreachable { attempts: AtomicUsize::new(0) });
    let membership = Membership::create(descriptor(), "alice").unwrap();
    let session = Session::new(membership, fast_config(), connector.clone()).unwrap();
    let mut rx = session.subscribe();

    session.start().await;
    let fatal = expect(&mut rx, |n| matches!(n, Notification::Fatal { .. })).await;
    assert_matches!(fatal, Notification::Fatal { reason } if reason.contains("connection refused"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(session.connection_state(), ConnectionState::Closed);
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_secret_is_rejected() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let wrong = AssemblyDescriptor { secret: "guess".into(), ..descriptor() };
    let session = Session::new(Membership::create(wrong, "mallory").unwrap(), fast_config(), relay.connector()).unwrap();
    let mut rx = session.subscribe();

    session.start().await;
    let fatal = expect(&mut rx, |n| matches!(n, Notification::Fatal { .. })).await;
    assert_matches!(fatal, Notification::Fatal { reason } if reason.contains("Rejected"));
    assert!(relay.present().is_empty());
    session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_connection_reconnects() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let sessions = join(&relay, 2).await;
    let me = sessions[0].membership().me.fingerprint().clone();
    let mut rx = sessions[0].subscribe();

    relay.disconnect(&me);
    expect(&mut rx, |n| *n == Notification::Connection(ConnectionState::Closed)).await;
    expect(&mut rx, |n| *n == Notification::Connection(ConnectionState::Established)).await;

    wait_for_status(&sessions[1], |s| matches!(s, Status::Waiting { readiness, .. } if readiness.contains_key(&me))).await;
    assert!(relay.present().contains(&me));
    for session in &sessions {
        session.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_relay_retried_after_delay() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let sessions = join(&relay, 1).await;
    let me = sessions[0].membership().me.fingerprint().clone();
    let mut rx = sessions[0].subscribe();

    relay.set_reachable(false);
    relay.disconnect(&me);
    expect(&mut rx, |n| *n == Notification::Connection(ConnectionState::Closed)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sessions[0].connection_state(), ConnectionState::Closed);

    relay.set_reachable(true);
    expect(&mut rx, |n| *n == Notification::Connection(ConnectionState::Established)).await;
    sessions[0].stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_actions_need_an_established_session() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let session = Session::new(Membership::create(descriptor(), "alice").unwrap(), fast_config(), relay.connector()).unwrap();

    assert_matches!(session.set_blocking(true).await, Err(AssemblyError::Connection(_)));
    assert_matches!(session.accept().await, Err(AssemblyError::Connection(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_learned_proofs_are_persisted() {
    let relay = LocalRelay::new(descriptor(), 2, Vec::new());
    let store = CredentialStore::in_memory();
    let alice = Membership::create(descriptor(), "alice").unwrap();
    let bob = Membership::create(descriptor(), "bob").unwrap();
    let bob_fp = bob.me.fingerprint().clone();

    let first = Session::with_store(alice, fast_config(), relay.connector(), store.clone()).unwrap();
    first.start().await;
    let second = Session::new(bob, fast_config(), relay.connector()).unwrap();
    second.start().await;
    wait_for_status(&first, |s| matches!(s, Status::Waiting { readiness, .. } if readiness.len() == 2)).await;

    first.stop().await;
    second.stop().await;
    let reloaded = store.load_proofs("assembly-1").unwrap();
    assert_eq!(reloaded.len(), 2);
    assert!(reloaded.contains(&bob_fp));
}
