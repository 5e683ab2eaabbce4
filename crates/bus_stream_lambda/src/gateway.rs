//! Broadcast gateway: websocket connection lifecycle and line-scoped fan-out.

use std::collections::BTreeSet;
use std::sync::Arc;

use bus_stream_core::contract::StreamEvent;
use bus_stream_core::gateway::{ClientMessage, DeliveryStats, GatewayEvent, ServerMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::adapters::connections::{Connection, ConnectionRegistry, RegistryError};
use crate::adapters::transport::{DeliveryError, Transport};
use crate::logging::{log_error, log_info, log_warn};

const COMPONENT: &str = "gateway";

pub const CONNECTION_TTL_SECS: i64 = 2 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to encode event {event_id}: {reason}")]
    Encode { event_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

fn response(status_code: u16, message: &ServerMessage) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({ "content-type": "application/json" }),
        body: serde_json::to_string(message).unwrap_or_default(),
    }
}

fn error_response(status_code: u16, message: impl Into<String>) -> ApiGatewayResponse {
    response(
        status_code,
        &ServerMessage::Error {
            message: message.into(),
        },
    )
}

fn registry_error_response(error: &RegistryError) -> ApiGatewayResponse {
    match error {
        RegistryError::NotFound(_) => error_response(410, error.to_string()),
        RegistryError::Backend(_) => error_response(500, error.to_string()),
    }
}

pub struct Gateway {
    registry: Arc<dyn ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    connection_ttl: chrono::Duration,
}

impl Gateway {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            connection_ttl: chrono::Duration::seconds(CONNECTION_TTL_SECS),
        }
    }

    pub fn with_connection_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub async fn connect(
        &self,
        connection_id: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<Connection, RegistryError> {
        let connection = Connection::new(connection_id, connected_at, self.connection_ttl);
        self.registry.put(connection.clone()).await?;
        log_info(
            COMPONENT,
            "connection_opened",
            json!({
                "connection_id": connection_id,
                "expires_at": connection.expires_at.to_rfc3339(),
            }),
        );
        Ok(connection)
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<(), RegistryError> {
        self.registry.delete(connection_id).await?;
        log_info(
            COMPONENT,
            "connection_closed",
            json!({ "connection_id": connection_id }),
        );
        Ok(())
    }

    /// Set union; subscribing twice to the same line is a no-op.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.registry.add_subscriptions(connection_id, lines).await
    }

    /// Set difference; unknown lines are ignored.
    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.registry.remove_subscriptions(connection_id, lines).await
    }

    /// Delivers `payload` once to every connection subscribed to `line_id`,
    /// concurrently. Connections reported gone are removed from the registry.
    pub async fn on_event(
        &self,
        line_id: &str,
        payload: &[u8],
    ) -> Result<DeliveryStats, RegistryError> {
        let targets = self.registry.scan_by_subscribed_line(line_id).await?;
        let mut stats = DeliveryStats {
            matched: targets.len(),
            ..DeliveryStats::default()
        };
        if targets.is_empty() {
            return Ok(stats);
        }

        let payload: Arc<[u8]> = Arc::from(payload);
        let mut deliveries = JoinSet::new();
        for connection_id in targets {
            let transport = Arc::clone(&self.transport);
            let payload = Arc::clone(&payload);
            deliveries.spawn(async move {
                let outcome = transport.deliver(&connection_id, &payload).await;
                (connection_id, outcome)
            });
        }

        let mut gone = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => stats.delivered += 1,
                Ok((connection_id, Err(DeliveryError::Gone))) => gone.push(connection_id),
                Ok((connection_id, Err(DeliveryError::Other(reason)))) => {
                    stats.failed += 1;
                    log_warn(
                        COMPONENT,
                        "delivery_failed",
                        json!({ "connection_id": connection_id, "line_id": line_id, "error": reason }),
                    );
                }
                Err(error) => {
                    stats.failed += 1;
                    log_error(
                        COMPONENT,
                        "delivery_task_failed",
                        json!({ "line_id": line_id, "error": error.to_string() }),
                    );
                }
            }
        }

        for connection_id in gone {
            match self.registry.delete(&connection_id).await {
                Ok(()) => {
                    stats.pruned += 1;
                    log_info(
                        COMPONENT,
                        "stale_connection_pruned",
                        json!({ "connection_id": connection_id }),
                    );
                }
                Err(error) => {
                    stats.failed += 1;
                    log_warn(
                        COMPONENT,
                        "stale_connection_prune_failed",
                        json!({ "connection_id": connection_id, "error": error.to_string() }),
                    );
                }
            }
        }

        log_info(
            COMPONENT,
            "broadcast_completed",
            json!({ "line_id": line_id, "stats": stats }),
        );
        Ok(stats)
    }

    /// Broadcasts a stream event to its line. Events without a line are skipped.
    pub async fn broadcast(&self, event: &StreamEvent) -> Result<Option<DeliveryStats>, GatewayError> {
        let Some(line_id) = event.line_id.as_deref() else {
            return Ok(None);
        };
        let payload = serde_json::to_vec(event).map_err(|error| GatewayError::Encode {
            event_id: event.event_id.clone(),
            reason: error.to_string(),
        })?;
        Ok(Some(self.on_event(line_id, &payload).await?))
    }

    pub async fn handle_event(&self, event: GatewayEvent) -> ApiGatewayResponse {
        let outcome = match event {
            GatewayEvent::Connect {
                connection_id,
                connected_at,
            } => {
                let opened = self.connect(&connection_id, connected_at).await;
                opened.map(|_| ServerMessage::Connected { connection_id })
            }
            GatewayEvent::Disconnect { connection_id } => {
                let closed = self.disconnect(&connection_id).await;
                closed.map(|()| ServerMessage::Disconnected { connection_id })
            }
            GatewayEvent::Message {
                connection_id,
                message,
            } => match message {
                ClientMessage::Subscribe { lines } => self
                    .subscribe(&connection_id, &lines)
                    .await
                    .map(|lines| ServerMessage::Subscribed { lines }),
                ClientMessage::Unsubscribe { lines } => self
                    .unsubscribe(&connection_id, &lines)
                    .await
                    .map(|lines| ServerMessage::Unsubscribed { lines }),
                ClientMessage::Ping => Ok(ServerMessage::Pong),
            },
        };
        match outcome {
            Ok(message) => response(200, &message),
            Err(error) => {
                log_warn(
                    COMPONENT,
                    "route_failed",
                    json!({ "error": error.to_string() }),
                );
                registry_error_response(&error)
            }
        }
    }

    /// Entry point for API Gateway websocket route events.
    pub async fn handle_websocket(&self, event: &Value, now: DateTime<Utc>) -> ApiGatewayResponse {
        match GatewayEvent::from_websocket(event, now) {
            Ok(event) => self.handle_event(event).await,
            Err(error) => {
                log_warn(
                    COMPONENT,
                    "invalid_websocket_event",
                    json!({ "error": error.message() }),
                );
                error_response(400, error.message())
            }
        }
    }

    /// Broadcasts every decodable stream event of an SQS batch. Malformed
    /// records and per-record failures are logged and skipped.
    pub async fn handle_sqs_batch(&self, event: &Value) -> DeliveryStats {
        let mut total = DeliveryStats::default();
        let records = event
            .get("Records")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for record in records {
            let message_id = record.get("messageId").and_then(Value::as_str);
            let decoded = record
                .get("body")
                .and_then(Value::as_str)
                .ok_or_else(|| "SQS record body must be a string".to_string())
                .and_then(|body| StreamEvent::from_json(body).map_err(|e| e.to_string()));
            let stream_event = match decoded {
                Ok(stream_event) => stream_event,
                Err(error) => {
                    log_warn(
                        COMPONENT,
                        "sqs_record_skipped",
                        json!({ "message_id": message_id, "error": error }),
                    );
                    continue;
                }
            };
            match self.broadcast(&stream_event).await {
                Ok(Some(stats)) => total.merge(stats),
                Ok(None) => {}
                Err(error) => log_error(
                    COMPONENT,
                    "broadcast_failed",
                    json!({ "event_id": stream_event.event_id, "error": error.to_string() }),
                ),
            }
        }
        total
    }
}

pub fn is_sqs_event(event: &Value) -> bool {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            !records.is_empty()
                && records.iter().all(|record| {
                    record
                        .get("eventSource")
                        .and_then(Value::as_str)
                        .map(|source| source == "aws:sqs")
                        .unwrap_or(false)
                })
        })
        .unwrap_or(false)
}
