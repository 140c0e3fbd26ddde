//! WebSocket Protocol Types
//!
//! Message types exchanged over a persistent session.

use serde::{Deserialize, Serialize};

use crate::registry::SessionId;

/// Close code sent when the server ends a session (RFC 6455 "going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Messages from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keep-alive
    Ping,
}

/// Messages from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection-accepted acknowledgment, first frame of every session
    Connected {
        session_id: SessionId,
        message: String,
        timestamp: String,
    },
    /// A broadcast event
    Event {
        event: String,
        data: serde_json::Value,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    /// Sent ahead of a server-initiated close
    Closing {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(session_id: SessionId) -> Self {
        ServerMessage::Connected {
            session_id,
            message: "Connected to relief gateway".to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_rfc3339(),
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
