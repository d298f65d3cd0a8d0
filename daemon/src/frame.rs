/// Decoding of text frames received on the delegate stream.
use delegate_core::{HeartbeatResponse, ManagerError, TaskEvent};
use serde::Deserialize;

const KEEPALIVE: &str = "X";
const HEARTBEAT_ACK_PREFIX: &str = "[X]";
const SELF_DESTRUCT_PREFIX: &str = "SELF_DESTRUCT";
const MIGRATE_PREFIX: &str = "MIGRATE";
const HEARTBEAT_RESPONSE_EVENT: &str = "DelegateHeartbeatResponseStreaming";

/// One inbound stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Keepalive,
    /// `[X]<delegate id>`
    HeartbeatAck(String),
    HeartbeatResponse(HeartbeatResponse),
    Task(TaskEvent),
    /// Text following `SELF_DESTRUCT`: empty, `<id>` or `<id>-<connection id>`
    SelfDestruct(String),
    /// New manager URL
    Migrate(String),
    InvalidToken,
    ExpiredToken,
    RevokedToken,
    Unknown(String),
}

impl StreamFrame {
    /// Manager error equivalent of a token frame.
    pub fn token_error(&self) -> Option<ManagerError> {
        match self {
            StreamFrame::InvalidToken => Some(ManagerError::InvalidToken),
            StreamFrame::ExpiredToken => Some(ManagerError::ExpiredToken),
            StreamFrame::RevokedToken => Some(ManagerError::RevokedToken),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventType {
    #[serde(default)]
    event_type: Option<String>,
}

pub fn decode_frame(text: &str) -> StreamFrame {
    let text = text.trim();

    if text == KEEPALIVE {
        return StreamFrame::Keepalive;
    }
    if let Some(id) = text.strip_prefix(HEARTBEAT_ACK_PREFIX) {
        return StreamFrame::HeartbeatAck(id.to_string());
    }
    if let Some(rest) = text.strip_prefix(SELF_DESTRUCT_PREFIX) {
        return StreamFrame::SelfDestruct(rest.to_string());
    }
    if let Some(url) = text.strip_prefix(MIGRATE_PREFIX) {
        return StreamFrame::Migrate(url.to_string());
    }

    if text.starts_with('{') {
        if let Some(frame) = decode_json(text) {
            return frame;
        }
    }

    if text.contains("INVALID_TOKEN") {
        StreamFrame::InvalidToken
    } else if text.contains("EXPIRED_TOKEN") {
        StreamFrame::ExpiredToken
    } else if text.contains("REVOKED_TOKEN") {
        StreamFrame::RevokedToken
    } else {
        StreamFrame::Unknown(text.to_string())
    }
}

fn decode_json(text: &str) -> Option<StreamFrame> {
    let event_type = serde_json::from_str::<EventType>(text).ok()?.event_type;
    match event_type.as_deref() {
        Some(HEARTBEAT_RESPONSE_EVENT) => serde_json::from_str(text)
            .ok()
            .map(StreamFrame::HeartbeatResponse),
        Some("DelegateTaskEvent") | Some("DelegateTaskAbortEvent") | None => {
            serde_json::from_str(text).ok().map(StreamFrame::Task)
        }
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::DelegateStatus;

    #[test]
    fn test_sentinels() {
        assert_eq!(decode_frame("X"), StreamFrame::Keepalive);
        assert_eq!(decode_frame("[X]d1"), StreamFrame::HeartbeatAck("d1".into()));
        assert_eq!(decode_frame("SELF_DESTRUCT"), StreamFrame::SelfDestruct(String::new()));
        assert_eq!(
            decode_frame("SELF_DESTRUCTd1-c1"),
            StreamFrame::SelfDestruct("d1-c1".into())
        );
        assert_eq!(
            decode_frame("MIGRATEhttps://other/api"),
            StreamFrame::Migrate("https://other/api".into())
        );
    }

    #[test]
    fn test_task_events() {
        let frame = decode_frame(
            r#"{"eventType":"DelegateTaskEvent","delegateTaskId":"t1","accountId":"acc","sync":true}"#,
        );
        match frame {
            StreamFrame::Task(event) => {
                assert_eq!(event.delegate_task_id, "t1");
                assert!(event.sync);
                assert!(!event.is_abort());
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let frame = decode_frame(r#"{"eventType":"DelegateTaskAbortEvent","delegateTaskId":"t2"}"#);
        assert!(matches!(frame, StreamFrame::Task(event) if event.is_abort()));
    }

    #[test]
    fn test_heartbeat_response() {
        let frame = decode_frame(
            r#"{"eventType":"DelegateHeartbeatResponseStreaming","delegateId":"d1","status":"DELETED"}"#,
        );
        match frame {
            StreamFrame::HeartbeatResponse(resp) => {
                assert_eq!(resp.delegate_id, "d1");
                assert_eq!(resp.status, DelegateStatus::Deleted);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_token_and_unknown_frames() {
        assert_eq!(decode_frame("error: INVALID_TOKEN"), StreamFrame::InvalidToken);
        assert_eq!(decode_frame("EXPIRED_TOKEN"), StreamFrame::ExpiredToken);
        assert_eq!(decode_frame("REVOKED_TOKEN"), StreamFrame::RevokedToken);
        assert!(StreamFrame::InvalidToken.token_error().is_some());
        assert_eq!(decode_frame("hello"), StreamFrame::Unknown("hello".into()));
        assert_eq!(
            decode_frame(r#"{"eventType":"Other"}"#),
            StreamFrame::Unknown(r#"{"eventType":"Other"}"#.into())
        );
    }
}
