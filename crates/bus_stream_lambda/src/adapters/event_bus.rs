use async_trait::async_trait;
use bus_stream_core::contract::StreamEvent;
use bus_stream_core::naming::TopicKind;

use crate::logging::log_info;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event {event_id}: {reason}")]
    Encode { event_id: String, reason: String },
    #[error("failed to publish to {topic}: {reason}")]
    Transport { topic: TopicKind, reason: String },
}

/// Best-effort, fire-and-forget event sink.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: TopicKind, event: &StreamEvent) -> Result<(), PublishError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _topic: TopicKind, _event: &StreamEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Writes each event to the log instead of a bus; handy for local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, topic: TopicKind, event: &StreamEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_value(event).map_err(|error| PublishError::Encode {
            event_id: event.event_id.clone(),
            reason: error.to_string(),
        })?;
        log_info(
            "event_bus",
            "event_published",
            serde_json::json!({ "topic": topic.as_str(), "event": payload }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bus_stream_core::contract::StreamEventKind;
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn local_publishers_accept_every_event() {
        let event = StreamEvent::new(
            StreamEventKind::BusPositionChanged,
            "B1",
            Some("L1".to_string()),
            Utc::now(),
            json!({"latitude": 52.5}),
        );
        NoopPublisher
            .publish(TopicKind::BusPosition, &event)
            .await
            .expect("noop publish");
        LogPublisher
            .publish(TopicKind::BusPosition, &event)
            .await
            .expect("log publish");
    }
}
