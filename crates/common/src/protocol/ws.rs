// WebSocket message types for the beacon realtime protocols.
//
// Two protocols share the transport: the anonymous signaling protocol
// (free-form JSON frames routed by topic) and the authenticated
// notification protocol (typed server->client pushes). The signaling
// `publish` frame carries arbitrary caller-defined fields, so it is kept
// as the original JSON object rather than forced through a struct.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Server -> client frames on the notification socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NotifyMessage {
    /// The persisted backlog, sent exactly once per connection before any
    /// live push.
    #[serde(rename = "notifications:init")]
    NotificationsInit { payload: Vec<Value> },

    /// A single live notification.
    #[serde(rename = "notification")]
    Notification { payload: Value },
}

/// A decoded inbound frame on the signaling socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalFrame {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    /// The original object is preserved so the router can relay it
    /// verbatim, annotated with the subscriber count.
    Publish { topic: String, envelope: Map<String, Value> },
    /// Application-level echo request, unrelated to transport liveness.
    Ping,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalFrameError {
    #[error("frame is not valid JSON")]
    MalformedJson,
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unrecognized frame type `{0}`")]
    UnknownType(String),
    #[error("`{0}` frame is missing required fields")]
    MissingFields(&'static str),
}

/// Decode one inbound signaling frame.
///
/// Callers treat every error as "ignore the frame" per the protocol; the
/// variants exist so the drop reason can be logged.
pub fn decode_signal_frame(raw: &str) -> Result<SignalFrame, SignalFrameError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| SignalFrameError::MalformedJson)?;
    let Value::Object(object) = value else {
        return Err(SignalFrameError::NotAnObject);
    };
    let kind = match object.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_owned(),
        None => return Err(SignalFrameError::MissingType),
    };

    match kind.as_str() {
        "subscribe" => Ok(SignalFrame::Subscribe { topics: topic_list(&object, "subscribe")? }),
        "unsubscribe" => {
            Ok(SignalFrame::Unsubscribe { topics: topic_list(&object, "unsubscribe")? })
        }
        "publish" => {
            let topic = object
                .get("topic")
                .and_then(Value::as_str)
                .ok_or(SignalFrameError::MissingFields("publish"))?
                .to_owned();
            Ok(SignalFrame::Publish { topic, envelope: object })
        }
        "ping" => Ok(SignalFrame::Ping),
        other => Err(SignalFrameError::UnknownType(other.to_owned())),
    }
}

/// The reply to an application-level `ping` frame.
pub fn pong_frame() -> String {
    r#"{"type":"pong"}"#.to_owned()
}

fn topic_list(
    object: &Map<String, Value>,
    kind: &'static str,
) -> Result<Vec<String>, SignalFrameError> {
    let topics = object
        .get("topics")
        .and_then(Value::as_array)
        .ok_or(SignalFrameError::MissingFields(kind))?;

    // Non-string entries are skipped rather than failing the frame.
    Ok(topics.iter().filter_map(Value::as_str).map(str::to_owned).collect())
}
