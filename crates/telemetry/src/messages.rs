//! Telemetry wire messages and codec.
//!
//! Client → server control messages are `{"type": "subscribe" |
//! "unsubscribe", "entityId": ..}`. Server → client push messages are
//! `{"type": "<kind>_metrics", "entityId", "payload", "timestamp"}`. This
//! module turns push frames into validated [`MetricSnapshot`]s and sorts
//! failures into malformed frames (transport level) and invalid payloads
//! (validation level).

use serde::{Deserialize, Serialize};

use gridlens_core::snapshot::{MetricKind, MetricPayload, MetricSnapshot};
use gridlens_core::types::{EntityId, Timestamp};

use crate::error::{TelemetryError, TransportError};
use crate::registry::Subscription;

/// Client → server control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(rename = "entityId")]
        entity_id: EntityId,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    Unsubscribe {
        #[serde(rename = "entityId")]
        entity_id: EntityId,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
}

impl ControlMessage {
    pub fn subscribe(subscription: &Subscription) -> Self {
        ControlMessage::Subscribe {
            entity_id: subscription.entity_id.clone(),
            topic: subscription.topic.clone(),
        }
    }

    pub fn unsubscribe(subscription: &Subscription) -> Self {
        ControlMessage::Unsubscribe {
            entity_id: subscription.entity_id.clone(),
            topic: subscription.topic.clone(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// Every field is a string or an optional string, so serialization
    /// cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ControlMessage is always serialisable")
    }
}

/// Body shared by push messages and refetch responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBody {
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub timestamp: Timestamp,
}

impl SnapshotBody {
    /// Validate the payload as `kind` and build the snapshot.
    pub fn into_snapshot(self, kind: MetricKind) -> Result<MetricSnapshot, TelemetryError> {
        let payload = MetricPayload::from_value(kind, self.payload)?;
        Ok(MetricSnapshot::new(self.entity_id, payload, self.timestamp))
    }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A validated metric snapshot.
    Snapshot(MetricSnapshot),
    /// A well-formed message that is not a metric push (ack, pong, notice).
    Ignored(String),
}

/// Decode a server push frame.
///
/// * not JSON, no `type`, or a metric message without `entityId` /
///   `timestamp` / `payload` → [`TransportError::Malformed`]
/// * unknown `type` → [`Inbound::Ignored`]
/// * payload missing required fields or out of range →
///   [`TelemetryError::Validation`]
pub fn decode_push(text: &str) -> Result<Inbound, TelemetryError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| TransportError::Malformed(format!("invalid JSON: {e}")))?;

    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| TransportError::Malformed("missing \"type\" field".to_string()))?
        .to_string();

    let Some(kind) = MetricKind::from_message_type(&message_type) else {
        return Ok(Inbound::Ignored(message_type));
    };

    let body: SnapshotBody = serde_json::from_value(value)
        .map_err(|e| TransportError::Malformed(format!("{message_type} envelope: {e}")))?;

    Ok(Inbound::Snapshot(body.into_snapshot(kind)?))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn subscribe_serializes_without_topic() {
        let msg = ControlMessage::subscribe(&Subscription::entity("gpu-1"));
        assert_eq!(msg.to_json(), r#"{"type":"subscribe","entityId":"gpu-1"}"#);
    }

    #[test]
    fn unsubscribe_serializes_with_topic() {
        let msg = ControlMessage::unsubscribe(&Subscription::topic("site-7", "carbon"));
        assert_eq!(
            msg.to_json(),
            r#"{"type":"unsubscribe","entityId":"site-7","topic":"carbon"}"#
        );
    }

    #[test]
    fn decode_carbon_push() {
        let json = r#"{"type":"carbon_metrics","entityId":"site-7","payload":{"co2CapturedKg":10,"pue":1.3,"wue":0.4},"timestamp":"2026-01-05T10:00:00Z"}"#;
        let inbound = decode_push(json).unwrap();
        match inbound {
            Inbound::Snapshot(snapshot) => {
                assert_eq!(snapshot.entity_id, "site-7");
                assert_eq!(snapshot.kind(), MetricKind::Carbon);
                assert_eq!(snapshot.payload.as_carbon().unwrap().co2_captured_kg, 10.0);
            }
            other => panic!("Expected Snapshot, got {other:?}"),
        }
    }

    #[test]
    fn decode_gpu_push() {
        let json = r#"{"type":"gpu_metrics","entityId":"gpu-1","payload":{"utilizationPercent":90,"memoryUsedMb":1024,"memoryTotalMb":8192,"temperatureCelsius":70},"timestamp":"2026-01-05T10:00:00Z"}"#;
        assert_matches!(decode_push(json), Ok(Inbound::Snapshot(s)) if s.kind() == MetricKind::Gpu);
    }

    #[test]
    fn unknown_type_is_ignored() {
        let json = r#"{"type":"subscribed","entityId":"gpu-1"}"#;
        assert_matches!(decode_push(json), Ok(Inbound::Ignored(t)) if t == "subscribed");
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert_matches!(
            decode_push("not json at all"),
            Err(TelemetryError::Transport(TransportError::Malformed(_)))
        );
    }

    #[test]
    fn missing_type_is_malformed() {
        assert_matches!(
            decode_push(r#"{"entityId":"gpu-1"}"#),
            Err(TelemetryError::Transport(TransportError::Malformed(_)))
        );
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        let json = r#"{"type":"system_metrics","entityId":"node-1","payload":{"cpuPercent":1,"memoryPercent":2,"diskPercent":3}}"#;
        assert_matches!(
            decode_push(json),
            Err(TelemetryError::Transport(TransportError::Malformed(_)))
        );
    }

    #[test]
    fn malformed_envelope_names_the_message_type() {
        let json = r#"{"type":"gpu_metrics","entityId":"gpu-1","payload":{}}"#;
        assert_matches!(
            decode_push(json),
            Err(TelemetryError::Transport(TransportError::Malformed(msg))) if msg.starts_with("gpu_metrics envelope")
        );
    }

    #[test]
    fn missing_numeric_field_is_validation_error() {
        let json = r#"{"type":"carbon_metrics","entityId":"site-7","payload":{"pue":1.3,"wue":0.4},"timestamp":"2026-01-05T10:00:00Z"}"#;
        assert_matches!(decode_push(json), Err(TelemetryError::Validation(_)));
    }

    #[test]
    fn out_of_range_value_is_validation_error() {
        let json = r#"{"type":"gpu_metrics","entityId":"gpu-1","payload":{"utilizationPercent":140,"memoryUsedMb":1,"memoryTotalMb":2,"temperatureCelsius":40},"timestamp":"2026-01-05T10:00:00Z"}"#;
        assert_matches!(decode_push(json), Err(TelemetryError::Validation(_)));
    }
}
