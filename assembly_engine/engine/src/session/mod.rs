//! Session orchestration: handshake with the relay, event dispatch and reconnection.
//!
//! A `Session` owns one `AssemblyState` behind an async lock. Every inbound event and
//! every user action goes through that lock, so the state machine sees them one at a time.

pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assembly::{AssemblyState, Notification, Outcome, Status};
use crate::audit::{AuditEventType, AuditRecord, AuditTracker};
use crate::ballot::Ballot;
use crate::config::AssemblyConfig;
use crate::crypto::signing::decode_b64;
use crate::error::{AssemblyError, Result};
use crate::membership::Membership;
use crate::protocol::{AssemblyEvent, ClientMessage, MemberEvent, ServerMessage, StateSnapshot};
use crate::registry::ProofCache;
use crate::store::CredentialStore;

pub use transport::{Channel, Connector, RemoteEnd};

/// Where the connection to the relay stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    /// Transport is up, handshake still running.
    Opened,
    Established,
}

const NOTIFICATION_CAPACITY: usize = 256;

/// Handle to one membership's live session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    membership: Membership,
    config: AssemblyConfig,
    connector: Arc<dyn Connector>,
    store: Option<CredentialStore>,
    proofs: Arc<ProofCache>,
    audit: Arc<AuditTracker>,
    state: Mutex<AssemblyState>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    connection: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Notification>,
    ever_established: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(membership: Membership, config: AssemblyConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let proofs = ProofCache::new(&membership.assembly.id);
        Self::build(membership, config, connector, None, proofs)
    }

    /// Same as `new`, but seeds the proof cache from `store` and writes learned proofs back.
    pub fn with_store(
        membership: Membership,
        config: AssemblyConfig,
        connector: Arc<dyn Connector>,
        store: CredentialStore,
    ) -> Result<Self> {
        let proofs = store.load_proofs(&membership.assembly.id)?;
        Self::build(membership, config, connector, Some(store), proofs)
    }

    fn build(
        membership: Membership,
        config: AssemblyConfig,
        connector: Arc<dyn Connector>,
        store: Option<CredentialStore>,
        proofs: ProofCache,
    ) -> Result<Self> {
        config.validate()?;
        // our own proof is needed to check our own validation signature
        proofs.insert(membership.me.identity_proof())?;

        let proofs = Arc::new(proofs);
        let audit = Arc::new(AuditTracker::new(config.audit_capacity));
        let state = AssemblyState::new(config.clone(), membership.me.clone(), proofs.clone(), audit.clone());
        let (connection, _) = watch::channel(ConnectionState::Closed);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Session {
            inner: Arc::new(Inner {
                membership,
                config,
                connector,
                store,
                proofs,
                audit,
                state: Mutex::new(state),
                outbound: StdMutex::new(None),
                connection,
                notifications,
                ever_established: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn membership(&self) -> &Membership {
        &self.inner.membership
    }

    pub fn audit(&self) -> &AuditTracker {
        &self.inner.audit
    }

    pub fn proofs(&self) -> &ProofCache {
        &self.inner.proofs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub async fn status(&self) -> Status {
        self.inner.state.lock().await.status().clone()
    }

    /// Connect and keep the session alive until `stop`. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Session already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        lifecycle.task = Some(tokio::spawn(async move { inner.run(stop_rx).await }));
        lifecycle.stop = Some(stop_tx);
        info!(assembly = %self.inner.membership.assembly.id, "Session started");
    }

    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(stop) = lifecycle.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = lifecycle.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
        self.inner.drop_connection();
        self.inner.persist_proofs();
        info!(assembly = %self.inner.membership.assembly.id, "Session stopped");
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.inner.ever_established.store(false, Ordering::SeqCst);
        self.start().await;
    }

    /// Commit a ballot for the current round.
    pub async fn choose(&self, ballot: Ballot) -> Result<()> {
        self.act(|state| state.choose(ballot)).await
    }

    pub async fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.act(|state| state.set_blocking(blocking)).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.act(AssemblyState::accept).await
    }

    pub async fn refuse(&self) -> Result<()> {
        self.act(AssemblyState::refuse).await
    }

    async fn act<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(&mut AssemblyState) -> Result<Outcome>,
    {
        let mut state = self.inner.state.lock().await;
        if self.connection_state() != ConnectionState::Established {
            return Err(AssemblyError::Connection("session is not established".into()));
        }
        let outcome = action(&mut *state)?;
        self.inner.dispatch(outcome)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let attempt = tokio::select! {
                ended = self.attempt() => Some(ended),
                _ = stop.changed() => None,
            };
            self.drop_connection();
            let Some((established, reason)) = attempt else {
                break;
            };

            if !reason.is_connection_fault() {
                error!(error = %reason, "Session failed");
                self.fail(reason);
                break;
            }
            if !self.ever_established.load(Ordering::SeqCst) {
                error!(error = %reason, "Relay unreachable before first establishment");
                self.fail(reason);
                break;
            }

            if established {
                info!(error = %reason, "Connection lost, reconnecting");
                tokio::task::yield_now().await;
            } else {
                warn!(error = %reason, delay_ms = self.config.reconnect_delay_ms, "Reconnect failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    _ = stop.changed() => break,
                }
            }
        }
        self.persist_proofs();
    }

    /// One connection: handshake then event loop. Always ends with the reason it ended.
    async fn attempt(&self) -> (bool, AssemblyError) {
        let Channel { outbound, mut inbound } = match self.connector.connect().await {
            Ok(channel) => channel,
            Err(e) => return (false, e),
        };
        self.set_connection(ConnectionState::Opened);

        let snapshot = match tokio::time::timeout(
            self.config.handshake_timeout(),
            self.handshake(&outbound, &mut inbound),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return (false, e),
            Err(_) => return (false, AssemblyError::Connection("handshake timed out".into())),
        };

        if let Err(e) = self.establish(outbound, snapshot).await {
            return (true, e);
        }

        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle(message).await {
                return (true, e);
            }
        }
        (true, AssemblyError::Connection("relay closed the connection".into()))
    }

    async fn handshake(
        &self,
        outbound: &mpsc::UnboundedSender<ClientMessage>,
        inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Result<StateSnapshot> {
        let me = &self.membership.me;
        let assembly = &self.membership.assembly;

        // Step 1: announce ourselves
        send(outbound, ClientMessage::Hello {
            id: assembly.id.clone(),
            secret: assembly.secret.clone(),
            member: me.fingerprint().clone(),
        })?;

        // Step 2: answer the challenge, attaching our proof if the relay has none
        let (challenge, identity_proof_needed) = match inbound.recv().await {
            Some(ServerMessage::Challenge { challenge, identity_proof_needed }) => (challenge, identity_proof_needed),
            other => return Err(unexpected("challenge", other)),
        };
        let signature = me.sign(&decode_b64(&challenge)?);
        let identity_proof = identity_proof_needed.then(|| me.identity_proof());
        send(outbound, ClientMessage::Proof { signature, identity_proof })?;

        // Step 3: wait for the snapshot
        match inbound.recv().await {
            Some(ServerMessage::Established { state }) => Ok(state),
            other => Err(unexpected("established", other)),
        }
    }

    async fn establish(&self, outbound: mpsc::UnboundedSender<ClientMessage>, snapshot: StateSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        self.install_sender(outbound);
        self.ever_established.store(true, Ordering::SeqCst);
        self.set_connection(ConnectionState::Established);
        self.audit.log(AuditRecord::new(
            AuditEventType::Handshake,
            None,
            format!("established with {} members present", snapshot.present.len()),
        ));
        info!(assembly = %self.membership.assembly.id, present = snapshot.present.len(), "Session established");

        let outcome = state.update(AssemblyEvent::State { state: snapshot })?;
        self.dispatch(outcome)?;
        drop(state);
        self.persist_proofs();
        Ok(())
    }

    async fn handle(&self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Event(event) => {
                let mut state = self.state.lock().await;
                match state.update(event) {
                    Ok(outcome) => self.dispatch(outcome),
                    Err(e) if e.is_harvest_fault() => {
                        warn!(error = %e, "Harvest aborted");
                        let reason = e.to_string();
                        self.dispatch(Outcome {
                            outbound: vec![MemberEvent::Invalid { reason: reason.clone() }],
                            notifications: vec![
                                Notification::HarvestFailed { reason },
                                Notification::Status(state.status().clone()),
                            ],
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            ServerMessage::Error { fatal: false, reason } => {
                warn!(%reason, "Relay reported an error");
                self.publish(Notification::ServerError { reason });
                Ok(())
            }
            ServerMessage::Error { fatal: true, reason } => Err(AssemblyError::Rejected(reason)),
            other => Err(unexpected("event", Some(other))),
        }
    }

    fn dispatch(&self, outcome: Outcome) -> Result<()> {
        if !outcome.outbound.is_empty() {
            let guard = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
            let tx = guard
                .as_ref()
                .ok_or_else(|| AssemblyError::Connection("no open connection".into()))?;
            for event in outcome.outbound {
                send(tx, ClientMessage::Event(event))?;
            }
        }
        for notification in outcome.notifications {
            self.publish(notification);
        }
        Ok(())
    }

    fn publish(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn set_connection(&self, value: ConnectionState) {
        let changed = self.connection.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if changed {
            self.publish(Notification::Connection(value));
        }
    }

    fn install_sender(&self, tx: mpsc::UnboundedSender<ClientMessage>) {
        *self.outbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
    }

    fn drop_connection(&self) {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.set_connection(ConnectionState::Closed);
    }

    fn fail(&self, reason: AssemblyError) {
        self.audit.log(AuditRecord::new(AuditEventType::Failure, None, reason.to_string()));
        self.publish(Notification::Fatal { reason: reason.to_string() });
    }

    fn persist_proofs(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_proofs(&self.proofs) {
                warn!(error = %e, "Could not persist identity proofs");
            }
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<ClientMessage>, message: ClientMessage) -> Result<()> {
    tx.send(message)
        .map_err(|_| AssemblyError::Connection("relay channel closed".into()))
}

fn unexpected(expected: &str, got: Option<ServerMessage>) -> AssemblyError {
    match got {
        None => AssemblyError::Connection(format!("closed while waiting for {expected}")),
        Some(ServerMessage::Error { reason, .. }) => AssemblyError::Rejected(reason),
        Some(other) => AssemblyError::ProtocolState(format!("expected {expected}, got {other:?}")),
    }
}
