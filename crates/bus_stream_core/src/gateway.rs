//! Inbound websocket events and delivery bookkeeping for the broadcast gateway.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::ValidationError;

pub const MAX_LINES_PER_MESSAGE: usize = 100;

/// Messages a client sends over an open connection, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { lines: BTreeSet<String> },
    Unsubscribe { lines: BTreeSet<String> },
    Ping,
}

impl ClientMessage {
    pub fn decode(body: &str) -> Result<Self, ValidationError> {
        let message: ClientMessage = serde_json::from_str(body)
            .map_err(|error| ValidationError::new(format!("invalid client message: {error}")))?;
        match &message {
            Self::Subscribe { lines } | Self::Unsubscribe { lines } => {
                if lines.is_empty() {
                    return Err(ValidationError::new("lines cannot be empty"));
                }
                if lines.len() > MAX_LINES_PER_MESSAGE {
                    return Err(ValidationError::new(format!(
                        "lines exceeds MAX_LINES_PER_MESSAGE={MAX_LINES_PER_MESSAGE}"
                    )));
                }
                if lines.iter().any(|line| line.trim().is_empty()) {
                    return Err(ValidationError::new("line ids must be non-empty strings"));
                }
            }
            Self::Ping => {}
        }
        Ok(message)
    }
}

/// Replies returned to the caller of a websocket route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { connection_id: String },
    Disconnected { connection_id: String },
    Subscribed { lines: BTreeSet<String> },
    Unsubscribed { lines: BTreeSet<String> },
    Pong,
    Error { message: String },
}

/// Closed set of websocket route events, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Connect {
        connection_id: String,
        connected_at: DateTime<Utc>,
    },
    Disconnect {
        connection_id: String,
    },
    Message {
        connection_id: String,
        message: ClientMessage,
    },
}

#[derive(Debug, Deserialize)]
struct WebSocketEnvelope {
    #[serde(rename = "requestContext")]
    request_context: RequestContext,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestContext {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(rename = "connectionId")]
    connection_id: String,
    #[serde(rename = "connectedAt", default)]
    connected_at: Option<i64>,
}

impl GatewayEvent {
    /// Decode an API Gateway websocket envelope. `now` stands in for a
    /// missing `connectedAt`.
    pub fn from_websocket(value: &Value, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let envelope = WebSocketEnvelope::deserialize(value)
            .map_err(|error| ValidationError::new(format!("invalid websocket envelope: {error}")))?;
        let context = envelope.request_context;
        let connection_id = context.connection_id.trim().to_string();
        if connection_id.is_empty() {
            return Err(ValidationError::new("connectionId cannot be empty"));
        }

        match context.event_type.as_str() {
            "CONNECT" => Ok(Self::Connect {
                connection_id,
                connected_at: context
                    .connected_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or(now),
            }),
            "DISCONNECT" => Ok(Self::Disconnect { connection_id }),
            "MESSAGE" => {
                let body = envelope
                    .body
                    .ok_or_else(|| ValidationError::new("MESSAGE event requires a body"))?;
                Ok(Self::Message {
                    connection_id,
                    message: ClientMessage::decode(&body)?,
                })
            }
            other => Err(ValidationError::new(format!(
                "unsupported eventType '{other}'"
            ))),
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            Self::Connect { connection_id, .. }
            | Self::Disconnect { connection_id }
            | Self::Message { connection_id, .. } => connection_id,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

impl DeliveryStats {
    pub fn merge(&mut self, other: DeliveryStats) {
        self.matched += other.matched;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.pruned += other.pruned;
    }
}
