use crate::NodeId;
use serde::{Deserialize, Serialize};

/// A single wire frame exchanged between nodes.
///
/// Serializes to the JSON object `{"type": ..., "sender_id": ..., "timestamp":
/// ...}` (plus `ts` on `MUTEX_REQUEST`), matching the frame format every peer
/// running this software must accept and emit. A type string this crate does
/// not know about deserializes to [`Frame::Unknown`] rather than failing, so
/// receive loops can log and continue instead of tearing down the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "ELECTION")]
    Election { sender_id: NodeId, timestamp: f64 },
    #[serde(rename = "OK")]
    Ok { sender_id: NodeId, timestamp: f64 },
    #[serde(rename = "COORDINATOR")]
    Coordinator { sender_id: NodeId, timestamp: f64 },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { sender_id: NodeId, timestamp: f64 },
    #[serde(rename = "MUTEX_REQUEST")]
    MutexRequest {
        sender_id: NodeId,
        timestamp: f64,
        /// Authoritative ordering timestamp for this request.
        ts: f64,
    },
    #[serde(rename = "MUTEX_REPLY")]
    MutexReply { sender_id: NodeId, timestamp: f64 },
    #[serde(rename = "MUTEX_RELEASE")]
    MutexRelease { sender_id: NodeId, timestamp: f64 },
    /// Informational only, not part of the correctness-critical protocol:
    /// a best-effort notice that a leader-gated transaction committed.
    #[serde(rename = "BUSINESS_EVENT")]
    BusinessEvent { sender_id: NodeId, timestamp: f64 },
    /// Any type string not recognized above. Kept distinct from a parse
    /// error: the envelope was valid JSON, just an unfamiliar message type.
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn election(sender_id: NodeId) -> Self {
        Frame::Election { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn ok(sender_id: NodeId) -> Self {
        Frame::Ok { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn coordinator(sender_id: NodeId) -> Self {
        Frame::Coordinator { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn heartbeat(sender_id: NodeId) -> Self {
        Frame::Heartbeat { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn mutex_request(sender_id: NodeId, ts: f64) -> Self {
        Frame::MutexRequest { sender_id, timestamp: crate::unix_timestamp(), ts }
    }

    pub fn mutex_reply(sender_id: NodeId) -> Self {
        Frame::MutexReply { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn mutex_release(sender_id: NodeId) -> Self {
        Frame::MutexRelease { sender_id, timestamp: crate::unix_timestamp() }
    }

    pub fn business_event(sender_id: NodeId) -> Self {
        Frame::BusinessEvent { sender_id, timestamp: crate::unix_timestamp() }
    }

    /// The node that sent this frame, if known (`Unknown` frames carry none).
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            Frame::Election { sender_id, .. }
            | Frame::Ok { sender_id, .. }
            | Frame::Coordinator { sender_id, .. }
            | Frame::Heartbeat { sender_id, .. }
            | Frame::MutexRequest { sender_id, .. }
            | Frame::MutexReply { sender_id, .. }
            | Frame::MutexRelease { sender_id, .. }
            | Frame::BusinessEvent { sender_id, .. } => Some(*sender_id),
            Frame::Unknown => None,
        }
    }

    /// The `type` discriminant as it appears on the wire, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Election { .. } => "ELECTION",
            Frame::Ok { .. } => "OK",
            Frame::Coordinator { .. } => "COORDINATOR",
            Frame::Heartbeat { .. } => "HEARTBEAT",
            Frame::MutexRequest { .. } => "MUTEX_REQUEST",
            Frame::MutexReply { .. } => "MUTEX_REPLY",
            Frame::MutexRelease { .. } => "MUTEX_RELEASE",
            Frame::BusinessEvent { .. } => "BUSINESS_EVENT",
            Frame::Unknown => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_election() {
        let frame = Frame::election(3);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"ELECTION\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id(), Some(3));
    }

    #[test]
    fn mutex_request_carries_ts() {
        let frame = Frame::mutex_request(2, 123.5);
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        match back {
            Frame::MutexRequest { ts, sender_id, .. } => {
                assert_eq!(ts, 123.5);
                assert_eq!(sender_id, 2);
            }
            other => panic!("expected MutexRequest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_does_not_fail_parsing() {
        let json = r#"{"type":"SOMETHING_ELSE","sender_id":1,"timestamp":1.0}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame, Frame::Unknown);
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        let result: Result<Frame, _> = serde_json::from_str("not json");
        assert!(result.is_err());
    }
}
