use axum::extract::Form;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

/// Form fields Twilio posts to the voice webhook. GET requests carry the
/// same fields in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceCallbackParams {
    #[serde(default, rename = "From")]
    pub from: Option<String>,
    #[serde(default, rename = "To")]
    pub to: Option<String>,
}

/// Handle GET|POST /incoming-call, the Twilio webhook for incoming calls.
///
/// Responds with TwiML that connects the call audio to the media-stream
/// WebSocket, forwarding caller and called numbers as stream parameters so
/// the session sees them in the `start` event.
pub async fn handle_incoming_call(
    headers: HeaderMap,
    Form(params): Form<VoiceCallbackParams>,
) -> Response {
    let host = header_str(&headers, "host").unwrap_or("localhost:8000");
    // Behind a TLS-terminating proxy the stream must be wss.
    let ws_proto = match header_str(&headers, "x-forwarded-proto") {
        Some("https") => "wss",
        _ => "ws",
    };

    let caller = params.from.as_deref().unwrap_or("Unknown");
    let called = params.to.as_deref().unwrap_or("");
    tracing::info!(caller, called, "Incoming call");

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_proto}://{host}/media-stream">
            <Parameter name="caller" value="{caller}" />
            <Parameter name="called" value="{called}" />
        </Stream>
    </Connect>
</Response>"#
    );

    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
