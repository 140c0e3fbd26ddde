//! Persistent sessions over WebSocket
//!
//! One task per connection. Sessions are admitted through the connection
//! registry and receive broadcast events from its per-session queue.

mod handler;
pub(crate) mod protocol;

pub use handler::{run_session, websocket_handler};
pub use protocol::{CLOSE_GOING_AWAY, ClientMessage, ServerMessage};
