//! Lifecycle Controller
//!
//! Process-wide phases: `Starting -> Accepting -> Draining -> Stopped`.
//! Transitions only move forward, one step at a time. Draining closes every
//! session, stops accepting HTTP connections, and waits for both to settle
//! within the grace period.

use anyhow::{Context, Result};
use axum::Router;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::registry::{ConnectionRegistry, DisconnectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Accepting,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn next(self) -> Option<Self> {
        match self {
            LifecycleState::Starting => Some(LifecycleState::Accepting),
            LifecycleState::Accepting => Some(LifecycleState::Draining),
            LifecycleState::Draining => Some(LifecycleState::Stopped),
            LifecycleState::Stopped => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Accepting => "accepting",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid lifecycle transition from {} to {}", from.as_str(), to.as_str())]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions asked to close when draining began
    pub sessions_at_drain: usize,
    /// Sessions still registered when the grace period ended
    pub sessions_remaining: usize,
    /// Whether the grace period elapsed before everything settled
    pub timed_out: bool,
}

pub struct LifecycleController {
    state_tx: watch::Sender<LifecycleState>,
    registry: Arc<ConnectionRegistry>,
    grace_period: Duration,
    /// Cancelled when draining starts; stops the HTTP accept loop
    drain: CancellationToken,
}

impl LifecycleController {
    pub fn new(registry: Arc<ConnectionRegistry>, grace_period: Duration) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        Self {
            state_tx,
            registry,
            grace_period,
            drain: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Move to `to`, which must be the immediate successor of the current
    /// state.
    pub fn advance(&self, to: LifecycleState) -> std::result::Result<(), InvalidTransition> {
        let mut rejected = None;
        self.state_tx.send_if_modified(|current| {
            if current.next() == Some(to) {
                *current = to;
                true
            } else {
                rejected = Some(InvalidTransition { from: *current, to });
                false
            }
        });
        match rejected {
            Some(err) => Err(err),
            None => {
                info!(state = to.as_str(), "Lifecycle state changed");
                Ok(())
            }
        }
    }

    /// Bind the listener. Failing here is fatal for the process.
    pub async fn bind(&self, addr: SocketAddr) -> std::result::Result<TcpListener, GatewayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::BindFailure { addr, source })
    }

    /// Serve `app` on `listener` until `signal` resolves, then drain.
    pub async fn run<F>(&self, listener: TcpListener, app: Router, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()> + Send,
    {
        self.advance(LifecycleState::Accepting)?;
        if let Ok(addr) = listener.local_addr() {
            info!("Relief gateway listening on http://{}", addr);
        }

        let drain = self.drain.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await
        });

        tokio::select! {
            _ = signal => {
                info!("Received shutdown signal, draining...");
            }
            result = &mut server => {
                // The accept loop ended on its own; still walk the remaining
                // phases so observers see a consistent end state.
                self.advance(LifecycleState::Draining)?;
                self.registry.begin_drain();
                self.registry.close_all(DisconnectReason::ServerShutdown);
                self.advance(LifecycleState::Stopped)?;
                result
                    .context("Server task failed")?
                    .context("Server error")?;
                anyhow::bail!("Server stopped before a shutdown signal");
            }
        }

        self.advance(LifecycleState::Draining)?;
        let deadline = Instant::now() + self.grace_period;

        self.registry.begin_drain();
        let sessions_at_drain = self.registry.close_all(DisconnectReason::ServerShutdown);
        self.drain.cancel();
        info!(sessions = sessions_at_drain, "Closing sessions");

        let mut timed_out = tokio::time::timeout_at(deadline, self.registry.wait_until_empty())
            .await
            .is_err();
        let sessions_remaining = self.registry.len();
        if timed_out {
            warn!(
                remaining = sessions_remaining,
                "Grace period elapsed with sessions still open"
            );
        }

        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Server error during shutdown: {}", e),
            Ok(Err(e)) => warn!("Server task failed during shutdown: {}", e),
            Err(_) => {
                warn!("HTTP connections still open after grace period, aborting");
                server.abort();
                timed_out = true;
            }
        }

        // Whatever outlived the grace period is dropped without waiting.
        for session in self.registry.list() {
            self.registry
                .unregister(&session.id, DisconnectReason::ServerShutdown);
        }

        self.advance(LifecycleState::Stopped)?;
        let report = ShutdownReport {
            sessions_at_drain,
            sessions_remaining,
            timed_out,
        };
        info!(
            sessions_at_drain = report.sessions_at_drain,
            sessions_remaining = report.sessions_remaining,
            timed_out = report.timed_out,
            "Shutdown complete"
        );
        Ok(report)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GatewayMetrics;
    use crate::origin::OriginPolicy;

    fn controller(grace: Duration) -> (LifecycleController, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(OriginPolicy::new(vec![])),
            Arc::new(GatewayMetrics::new()),
            8,
        ));
        (LifecycleController::new(registry.clone(), grace), registry)
    }

    #[test]
    fn advance_moves_one_step_forward() {
        let (lifecycle, _) = controller(Duration::from_secs(1));
        assert_eq!(lifecycle.state(), LifecycleState::Starting);

        lifecycle.advance(LifecycleState::Accepting).unwrap();
        let err = lifecycle.advance(LifecycleState::Stopped).unwrap_err();
        assert_eq!(err.from, LifecycleState::Accepting);
        assert!(lifecycle.advance(LifecycleState::Starting).is_err());

        lifecycle.advance(LifecycleState::Draining).unwrap();
        lifecycle.advance(LifecycleState::Stopped).unwrap();
        assert!(lifecycle.advance(LifecycleState::Stopped).is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn subscribers_observe_transitions() {
        let (lifecycle, _) = controller(Duration::from_secs(1));
        let rx = lifecycle.subscribe();
        lifecycle.advance(LifecycleState::Accepting).unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Accepting);
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let (lifecycle, _) = controller(Duration::from_secs(1));
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        match lifecycle.bind(addr).await {
            Err(GatewayError::BindFailure { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn run_with_no_sessions_stops_cleanly() {
        let (lifecycle, registry) = controller(Duration::from_secs(2));
        let listener = lifecycle.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let report = lifecycle
            .run(listener, Router::new(), async {})
            .await
            .unwrap();

        assert_eq!(
            report,
            ShutdownReport {
                sessions_at_drain: 0,
                sessions_remaining: 0,
                timed_out: false,
            }
        );
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(registry.is_draining());
    }

    #[tokio::test]
    async fn run_times_out_on_sessions_that_never_close() {
        let (lifecycle, registry) = controller(Duration::from_millis(200));
        let listener = lifecycle.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // Held by the test, never closed by a session task.
        let _stuck = registry.register(None, None).unwrap();

        let started = std::time::Instant::now();
        let report = lifecycle
            .run(listener, Router::new(), async {})
            .await
            .unwrap();

        assert!(report.timed_out);
        assert_eq!(report.sessions_at_drain, 1);
        assert_eq!(report.sessions_remaining, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(registry.is_empty());
    }
}
