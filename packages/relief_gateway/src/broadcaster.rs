//! Event Broadcaster
//!
//! Public entry point for route modules that want to push live events to
//! every connected client. Events are validated here, then handed to the
//! connection registry for fan-out. Nothing is buffered or replayed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::registry::{ConnectionRegistry, DeliveryReport};
use crate::ws::ServerMessage;
use crate::ws::protocol::now_rfc3339;

/// Events the platform publishes, keyed by their wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    DisasterUpdated(serde_json::Value),
    SocialMediaUpdated(serde_json::Value),
    ResourcesUpdated(serde_json::Value),
    VerificationCompleted(serde_json::Value),
    ReportUpdated(serde_json::Value),
    OfficialUpdate(serde_json::Value),
    /// Collaborator-defined event outside the catalogue.
    #[serde(skip)]
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

impl GatewayEvent {
    /// Map a wire name onto the catalogue, falling back to `Custom`.
    pub fn from_parts(name: &str, payload: serde_json::Value) -> Self {
        match name {
            "disaster_updated" => GatewayEvent::DisasterUpdated(payload),
            "social_media_updated" => GatewayEvent::SocialMediaUpdated(payload),
            "resources_updated" => GatewayEvent::ResourcesUpdated(payload),
            "verification_completed" => GatewayEvent::VerificationCompleted(payload),
            "report_updated" => GatewayEvent::ReportUpdated(payload),
            "official_update" => GatewayEvent::OfficialUpdate(payload),
            _ => GatewayEvent::Custom {
                name: name.to_string(),
                payload,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::DisasterUpdated(_) => "disaster_updated",
            GatewayEvent::SocialMediaUpdated(_) => "social_media_updated",
            GatewayEvent::ResourcesUpdated(_) => "resources_updated",
            GatewayEvent::VerificationCompleted(_) => "verification_completed",
            GatewayEvent::ReportUpdated(_) => "report_updated",
            GatewayEvent::OfficialUpdate(_) => "official_update",
            GatewayEvent::Custom { name, .. } => name,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            GatewayEvent::DisasterUpdated(p)
            | GatewayEvent::SocialMediaUpdated(p)
            | GatewayEvent::ResourcesUpdated(p)
            | GatewayEvent::VerificationCompleted(p)
            | GatewayEvent::ReportUpdated(p)
            | GatewayEvent::OfficialUpdate(p) => p,
            GatewayEvent::Custom { payload, .. } => payload,
        }
    }

    fn validate(&self) -> Result<()> {
        let name = self.name();
        if name.is_empty() {
            return Err(GatewayError::InvalidEvent("event name must not be empty".into()));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(GatewayError::InvalidEvent(format!(
                "event name must not contain whitespace: {name:?}"
            )));
        }
        Ok(())
    }

    fn into_message(self) -> ServerMessage {
        let event = self.name().to_string();
        let data = match self {
            GatewayEvent::DisasterUpdated(p)
            | GatewayEvent::SocialMediaUpdated(p)
            | GatewayEvent::ResourcesUpdated(p)
            | GatewayEvent::VerificationCompleted(p)
            | GatewayEvent::ReportUpdated(p)
            | GatewayEvent::OfficialUpdate(p) => p,
            GatewayEvent::Custom { payload, .. } => payload,
        };
        ServerMessage::Event {
            event,
            data,
            timestamp: now_rfc3339(),
        }
    }
}

/// Cloneable publishing handle given to route modules.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Validate and fan out one event. Per-session delivery failures are
    /// reported in the returned counts, never as an error.
    pub fn publish(&self, event: GatewayEvent) -> Result<DeliveryReport> {
        event.validate()?;
        let name = event.name().to_string();
        let report = self.registry.broadcast(&event.into_message());
        self.metrics.event_published(report.delivered, report.skipped);
        debug!(
            event = %name,
            delivered = report.delivered,
            skipped = report.skipped,
            "Published event"
        );
        Ok(report)
    }

    /// Publish any serialisable payload under `name`.
    pub fn publish_json<T: Serialize>(&self, name: &str, payload: &T) -> Result<DeliveryReport> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| GatewayError::InvalidEvent(format!("payload is not serialisable: {e}")))?;
        self.publish(GatewayEvent::from_parts(name, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::OriginPolicy;
    use crate::registry::DEFAULT_SEND_CHANNEL_CAPACITY;
    use std::collections::BTreeMap;

    fn broadcaster() -> (EventBroadcaster, Arc<ConnectionRegistry>, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(OriginPolicy::new(vec![])),
            metrics.clone(),
            DEFAULT_SEND_CHANNEL_CAPACITY,
        ));
        (
            EventBroadcaster::new(registry.clone(), metrics.clone()),
            registry,
            metrics,
        )
    }

    #[test]
    fn catalogue_names_round_trip_through_from_parts() {
        for name in [
            "disaster_updated",
            "social_media_updated",
            "resources_updated",
            "verification_completed",
            "report_updated",
            "official_update",
        ] {
            let event = GatewayEvent::from_parts(name, serde_json::Value::Null);
            assert!(!matches!(event, GatewayEvent::Custom { .. }), "{name}");
            assert_eq!(event.name(), name);
        }
        let custom = GatewayEvent::from_parts("shelter_opened", serde_json::json!(1));
        assert!(matches!(custom, GatewayEvent::Custom { .. }));
        assert_eq!(custom.name(), "shelter_opened");
        assert_eq!(custom.payload(), &serde_json::json!(1));
    }

    #[test]
    fn catalogue_event_serialises_with_wire_name() {
        let json =
            serde_json::to_value(GatewayEvent::VerificationCompleted(serde_json::json!({"ok": true})))
                .unwrap();
        assert_eq!(json["event"], "verification_completed");
        assert_eq!(json["data"]["ok"], true);
    }

    #[tokio::test]
    async fn publish_delivers_event_frame() {
        let (broadcaster, registry, metrics) = broadcaster();
        let mut link = registry.register(None, None).unwrap();

        let report = broadcaster
            .publish(GatewayEvent::DisasterUpdated(serde_json::json!({"id": "d-1"})))
            .unwrap();
        assert_eq!(report.delivered, 1);

        match link.next_outbound().await.unwrap() {
            ServerMessage::Event { event, data, .. } => {
                assert_eq!(event, "disaster_updated");
                assert_eq!(data["id"], "d-1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(metrics.snapshot().events.published, 1);
    }

    #[test]
    fn publish_rejects_empty_and_whitespace_names() {
        let (broadcaster, _registry, metrics) = broadcaster();
        assert!(matches!(
            broadcaster.publish(GatewayEvent::from_parts("", serde_json::Value::Null)),
            Err(GatewayError::InvalidEvent(_))
        ));
        assert!(matches!(
            broadcaster.publish(GatewayEvent::from_parts("bad name", serde_json::Value::Null)),
            Err(GatewayError::InvalidEvent(_))
        ));
        assert_eq!(metrics.snapshot().events.published, 0);
    }

    #[test]
    fn publish_json_rejects_unserialisable_payload() {
        let (broadcaster, _registry, _metrics) = broadcaster();
        // non-string map keys cannot become JSON objects
        let mut payload = BTreeMap::new();
        payload.insert((1, 2), "x");
        assert!(matches!(
            broadcaster.publish_json("resources_updated", &payload),
            Err(GatewayError::InvalidEvent(_))
        ));
    }

    #[test]
    fn publish_with_no_sessions_succeeds() {
        let (broadcaster, _registry, _metrics) = broadcaster();
        let report = broadcaster
            .publish_json("report_updated", &serde_json::json!({"report": 4}))
            .unwrap();
        assert_eq!(report, DeliveryReport::default());
    }
}
