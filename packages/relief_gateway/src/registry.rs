//! Connection Registry
//!
//! The single piece of shared mutable state in the gateway. Tracks every live
//! persistent session, hands out per-session outbound queues, and fans events
//! out to them.
//!
//! Critical sections only touch the session map. Delivery happens on a
//! snapshot of the outbound senders taken under the lock, so a slow session
//! can never hold up registration of new ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::origin::OriginPolicy;
use crate::ws::ServerMessage;

/// Default outbound queue depth per session.
pub const DEFAULT_SEND_CHANNEL_CAPACITY: usize = 100;

/// Opaque session identifier (random 128-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata of one live persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub origin: Option<String>,
    pub client_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Why a session left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    TransportError(String),
    PingTimeout,
    ServerShutdown,
    /// The upgrade never completed after admission.
    HandshakeAborted,
    SendFailed,
}

impl DisconnectReason {
    pub fn code(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::TransportError(_) => "transport_error",
            DisconnectReason::PingTimeout => "ping_timeout",
            DisconnectReason::ServerShutdown => "server_shutdown",
            DisconnectReason::HandshakeAborted => "handshake_aborted",
            DisconnectReason::SendFailed => "send_failed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::TransportError(detail) => write!(f, "transport_error: {}", detail),
            other => f.write_str(other.code()),
        }
    }
}

/// Lifecycle notifications, published after the registry lock is released.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened(Session),
    Closed {
        id: SessionId,
        reason: DisconnectReason,
    },
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Sessions whose queue accepted the message
    pub delivered: usize,
    /// Sessions skipped because their queue was full or already closed
    pub skipped: usize,
}

struct SessionEntry {
    session: Session,
    outbound: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    draining: bool,
}

pub struct ConnectionRegistry {
    policy: Arc<OriginPolicy>,
    metrics: Arc<GatewayMetrics>,
    state: Mutex<RegistryState>,
    /// Session count, for waiters on an empty registry
    count_tx: watch::Sender<usize>,
    events_tx: broadcast::Sender<SessionEvent>,
    send_channel_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(
        policy: Arc<OriginPolicy>,
        metrics: Arc<GatewayMetrics>,
        send_channel_capacity: usize,
    ) -> Self {
        let (count_tx, _) = watch::channel(0);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            policy,
            metrics,
            state: Mutex::new(RegistryState::default()),
            count_tx,
            events_tx,
            send_channel_capacity: send_channel_capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new session.
    ///
    /// Fails with `AdmissionDenied` when the origin policy rejects `origin`
    /// and with `ShuttingDown` once draining has begun. Nothing is stored on
    /// failure.
    pub fn register(
        self: &Arc<Self>,
        origin: Option<String>,
        client_addr: Option<SocketAddr>,
    ) -> Result<SessionLink> {
        if !self.policy.is_allowed(origin.as_deref()) {
            return Err(GatewayError::AdmissionDenied {
                origin: origin.unwrap_or_default(),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.send_channel_capacity);
        let shutdown = CancellationToken::new();
        let now = Utc::now();

        let session = {
            let mut state = self.state();
            if state.draining {
                return Err(GatewayError::ShuttingDown);
            }
            let mut id = SessionId::new();
            while state.sessions.contains_key(&id) {
                id = SessionId::new();
            }
            let session = Session {
                id,
                origin,
                client_addr,
                connected_at: now,
                last_activity: now,
            };
            state.sessions.insert(
                id,
                SessionEntry {
                    session: session.clone(),
                    outbound: outbound_tx,
                    shutdown: shutdown.clone(),
                },
            );
            // Published under the lock so concurrent updates land in order.
            self.count_tx.send_replace(state.sessions.len());
            session
        };

        self.metrics.connection_opened();
        info!(
            session_id = %session.id,
            origin = session.origin.as_deref().unwrap_or("-"),
            "Session connected"
        );
        let id = session.id;
        let _ = self.events_tx.send(SessionEvent::Opened(session));

        Ok(SessionLink {
            id,
            registry: Arc::clone(self),
            outbound: outbound_rx,
            shutdown,
            released: false,
        })
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn unregister(&self, id: &SessionId, reason: DisconnectReason) -> bool {
        let entry = {
            let mut state = self.state();
            let entry = state.sessions.remove(id);
            if entry.is_some() {
                self.count_tx.send_replace(state.sessions.len());
            }
            entry
        };
        let Some(entry) = entry else {
            return false;
        };

        entry.shutdown.cancel();
        self.metrics.connection_closed();
        info!(
            session_id = %id,
            origin = entry.session.origin.as_deref().unwrap_or("-"),
            reason = %reason,
            "Session disconnected"
        );
        let _ = self.events_tx.send(SessionEvent::Closed { id: *id, reason });
        true
    }

    /// Refresh the last-activity timestamp of a session.
    pub fn touch(&self, id: &SessionId) {
        if let Some(entry) = self.state().sessions.get_mut(id) {
            entry.session.last_activity = Utc::now();
        }
    }

    /// Queue `message` on every registered session.
    ///
    /// Best-effort: a full or closed queue is skipped and never aborts
    /// delivery to the rest.
    pub fn broadcast(&self, message: &ServerMessage) -> DeliveryReport {
        let targets: Vec<(SessionId, mpsc::Sender<ServerMessage>)> = self
            .state()
            .sessions
            .iter()
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect();

        let mut report = DeliveryReport::default();
        for (id, outbound) in targets {
            match outbound.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session_id = %id, "Outbound queue full, skipping delivery");
                    report.skipped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %id, "Session closing, skipping delivery");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// Point-in-time snapshot of all sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .state()
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.state().sessions.get(id).map(|e| e.session.clone())
    }

    pub fn len(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse all further registrations.
    pub fn begin_drain(&self) {
        self.state().draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.state().draining
    }

    /// Ask every session to close. Sessions receive a `closing` message and
    /// their shutdown token is cancelled; each session task then closes its
    /// transport and unregisters itself. Returns the number of sessions asked.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let targets: Vec<(mpsc::Sender<ServerMessage>, CancellationToken)> = self
            .state()
            .sessions
            .values()
            .map(|entry| (entry.outbound.clone(), entry.shutdown.clone()))
            .collect();

        let notice = ServerMessage::Closing {
            reason: reason.code().to_string(),
        };
        for (outbound, shutdown) in &targets {
            let _ = outbound.try_send(notice.clone());
            shutdown.cancel();
        }
        targets.len()
    }

    /// Resolves once no sessions are registered.
    pub async fn wait_until_empty(&self) {
        let mut count_rx = self.count_tx.subscribe();
        let _ = count_rx.wait_for(|count| *count == 0).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn policy(&self) -> &OriginPolicy {
        &self.policy
    }
}

/// Handle owned by the task driving one session.
///
/// Dropping it without calling [`SessionLink::close`] unregisters the session
/// with `HandshakeAborted`, so an upgrade that never completes cannot leak a
/// registry entry.
pub struct SessionLink {
    id: SessionId,
    registry: Arc<ConnectionRegistry>,
    outbound: mpsc::Receiver<ServerMessage>,
    shutdown: CancellationToken,
    released: bool,
}

impl SessionLink {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next queued message; `None` once the registry dropped the session.
    pub async fn next_outbound(&mut self) -> Option<ServerMessage> {
        self.outbound.recv().await
    }

    /// Next queued message without waiting.
    pub fn try_next_outbound(&mut self) -> Option<ServerMessage> {
        self.outbound.try_recv().ok()
    }

    /// Cancelled when the registry asks this session to close.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn touch(&self) {
        self.registry.touch(&self.id);
    }

    pub fn close(mut self, reason: DisconnectReason) {
        self.released = true;
        self.registry.unregister(&self.id, reason);
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        if !self.released {
            self.registry
                .unregister(&self.id, DisconnectReason::HandshakeAborted);
        }
    }
}
