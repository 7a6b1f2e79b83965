use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use serde::Deserialize;

use crate::AppState;

/// Outbound media is split into chunks of this many mu-law bytes
/// (~40 ms at 8 kHz) before being framed.
pub const CHUNK_SIZE: usize = 640;

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Start { start: StartMetadata },
    Media { media: MediaPayload },
    Mark { mark: MarkPayload },
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    #[serde(default)]
    pub call_sid: String,
    #[serde(default)]
    pub stream_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law 8 kHz mono audio.
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Frame one audio chunk as an outbound `media` message.
pub fn media_frame(stream_sid: &str, chunk: &[u8]) -> Message {
    let payload = base64::engine::general_purpose::STANDARD.encode(chunk);
    let msg = serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload }
    });
    Message::Text(msg.to_string().into())
}

/// Frame a `clear` message instructing the peer to flush buffered audio.
pub fn clear_frame(stream_sid: &str) -> Message {
    let msg = serde_json::json!({
        "event": "clear",
        "streamSid": stream_sid
    });
    Message::Text(msg.to_string().into())
}

/// Frame a named `mark`; the peer echoes it once the preceding audio has
/// been played out.
pub fn mark_frame(stream_sid: &str, name: &str) -> Message {
    let msg = serde_json::json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name }
    });
    Message::Text(msg.to_string().into())
}

/// WebSocket upgrade handler for GET /media-stream.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::call::handle_call(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_json(msg: &Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("frame is JSON"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn parses_start_event() {
        let raw = r#"{
            "event": "start",
            "start": {
                "callSid": "CA123",
                "streamSid": "MZ456",
                "customParameters": {"caller": "+15551234567", "called": "+15559876543"}
            }
        }"#;

        match serde_json::from_str::<StreamEvent>(raw).expect("should parse") {
            StreamEvent::Start { start } => {
                assert_eq!(start.call_sid, "CA123");
                assert_eq!(start.stream_sid, "MZ456");
                assert_eq!(
                    start.custom_parameters.get("caller").map(String::as_str),
                    Some("+15551234567")
                );
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_event() {
        let raw = r#"{"event": "media", "media": {"payload": "AAAA"}}"#;
        match serde_json::from_str::<StreamEvent>(raw).expect("should parse") {
            StreamEvent::Media { media } => assert_eq!(media.payload, "AAAA"),
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn parses_mark_echo() {
        let raw = r#"{"event": "mark", "streamSid": "MZ456", "mark": {"name": "greeting_end"}}"#;
        match serde_json::from_str::<StreamEvent>(raw).expect("should parse") {
            StreamEvent::Mark { mark } => assert_eq!(mark.name, "greeting_end"),
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[test]
    fn parses_stop_and_connected() {
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(r#"{"event": "stop", "streamSid": "MZ1"}"#),
            Ok(StreamEvent::Stop)
        ));
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(r#"{"event": "connected", "protocol": "Call"}"#),
            Ok(StreamEvent::Connected)
        ));
    }

    #[test]
    fn malformed_event_is_an_error() {
        assert!(serde_json::from_str::<StreamEvent>(r#"{"event": "warp"}"#).is_err());
        assert!(serde_json::from_str::<StreamEvent>("not json").is_err());
    }

    #[test]
    fn media_frame_round_trips_payload() {
        let chunk = vec![0x7Fu8; CHUNK_SIZE];
        let json = frame_json(&media_frame("MZ456", &chunk));

        assert_eq!(json["event"], "media");
        assert_eq!(json["streamSid"], "MZ456");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(json["media"]["payload"].as_str().expect("payload"))
            .expect("valid base64");
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn clear_frame_has_no_payload() {
        let json = frame_json(&clear_frame("MZ456"));
        assert_eq!(json["event"], "clear");
        assert_eq!(json["streamSid"], "MZ456");
        assert!(json.get("media").is_none());
    }

    #[test]
    fn mark_frame_carries_name() {
        let json = frame_json(&mark_frame("MZ456", "greeting_end"));
        assert_eq!(json["event"], "mark");
        assert_eq!(json["mark"]["name"], "greeting_end");
    }
}
