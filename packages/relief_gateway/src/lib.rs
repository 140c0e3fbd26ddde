//! Relief gateway
//!
//! Front door of the disaster relief coordination platform: origin-based
//! admission, prefix routing onto service modules, live event fan-out over
//! WebSocket sessions, and coordinated graceful shutdown.

pub mod app;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod origin;
pub mod registry;
pub mod router;
pub mod ws;

#[cfg(test)]
mod test_helpers;

pub use app::{AppState, build_router, default_routes};
pub use broadcaster::{EventBroadcaster, GatewayEvent};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use lifecycle::{LifecycleController, LifecycleState, ShutdownReport, termination_signal};
pub use registry::{ConnectionRegistry, DeliveryReport, DisconnectReason, Session, SessionId};
pub use router::RouteTable;
