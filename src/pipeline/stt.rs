use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A transcription event from the streaming recognizer.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// True when the recognizer considers the caller's turn complete.
    pub speech_final: bool,
    pub confidence: f64,
}

/// Long-lived streaming recognition session over the Deepgram WebSocket API.
///
/// Transcript events are delivered through the channel handed to [`connect`];
/// the sender is dropped when the connection closes, so consumers observe
/// termination as channel closure.
///
/// [`connect`]: SttChannel::connect
pub struct SttChannel {
    write: Arc<Mutex<WsSink>>,
    closed: Arc<AtomicBool>,
    keepalive: CancellationToken,
    read_task: Option<tokio::task::JoinHandle<()>>,
    keepalive_task: Option<tokio::task::JoinHandle<()>>,
}

impl SttChannel {
    pub async fn connect(
        config: &Config,
        events_tx: mpsc::UnboundedSender<TranscriptEvent>,
    ) -> Result<Self, SttError> {
        let mut request = config
            .stt_url()
            .into_client_request()
            .map_err(|e| SttError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Token {}", config.deepgram_api_key)
                .parse()
                .map_err(|_| SttError::Connect("API key is not a valid header value".into()))?,
        );

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                WsError::Http(resp) if resp.status() == StatusCode::FORBIDDEN => {
                    SttError::Unauthorized
                }
                other => SttError::Connect(other.to_string()),
            })?;
        tracing::info!("Connected to recognizer");

        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));
        let closed = Arc::new(AtomicBool::new(false));
        let keepalive = CancellationToken::new();

        // Receive loop. Owns the events sender; dropping it on exit is how
        // the session learns the recognizer is gone.
        let read_task = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_transcript(&text) {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Recognizer closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::info!("Recognizer connection lost: {e}");
                        break;
                    }
                }
            }
        });

        // Keepalive pings so the recognizer holds the session open across
        // quiet stretches.
        let keepalive_task = {
            let write = write.clone();
            let closed = closed.clone();
            let token = keepalive.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            let ping = Message::Ping(Bytes::new());
                            if write.lock().await.send(ping).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            write,
            closed,
            keepalive,
            read_task: Some(read_task),
            keepalive_task: Some(keepalive_task),
        })
    }

    /// Forward one mu-law payload to the recognizer. A closed connection
    /// drops the audio silently; the session observes termination through
    /// the event channel.
    pub async fn send_audio(&self, audio: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .write
            .lock()
            .await
            .send(Message::Binary(audio.into()))
            .await
        {
            if !self.closed.swap(true, Ordering::SeqCst) {
                tracing::warn!("Cannot send audio to recognizer: {e}");
            }
        }
    }

    /// Send the graceful close sentinel, close the transport, and await the
    /// background tasks.
    pub async fn close(&mut self) {
        self.keepalive.cancel();

        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut write = self.write.lock().await;
            if let Err(e) = write
                .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                .await
            {
                tracing::debug!("Close sentinel not delivered: {e}");
            }
            if let Err(e) = write.close().await {
                tracing::debug!("Error closing recognizer connection: {e}");
            }
        }

        // The receive loop may still be waiting on a peer that never
        // completes the close handshake; abort it rather than hang teardown.
        if let Some(task) = self.read_task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::debug!("Recognizer receive task ended abnormally: {e}");
                }
            }
        }
        if let Some(task) = self.keepalive_task.take() {
            if let Err(e) = task.await {
                tracing::debug!("Recognizer keepalive task ended abnormally: {e}");
            }
        }

        tracing::info!("Recognizer connection closed");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("recognizer rejected the API key (HTTP 403)")]
    Unauthorized,
    #[error("failed to connect to recognizer: {0}")]
    Connect(String),
}

#[derive(Debug, Deserialize)]
struct RemoteMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: RemoteChannel,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteChannel {
    #[serde(default)]
    alternatives: Vec<RemoteAlternative>,
}

#[derive(Debug, Deserialize)]
struct RemoteAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
}

/// Parse one recognizer message. Only `Results` carries a transcript;
/// `UtteranceEnd` is informational and everything else is ignored.
fn parse_transcript(raw: &str) -> Option<TranscriptEvent> {
    let message: RemoteMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Unparseable recognizer message: {e}");
            return None;
        }
    };

    match message.kind.as_str() {
        "Results" => {
            let alternative = message.channel.alternatives.first()?;
            let text = alternative.transcript.trim();
            if text.is_empty() {
                return None;
            }
            Some(TranscriptEvent {
                text: text.to_string(),
                is_final: message.is_final,
                speech_final: message.speech_final,
                confidence: alternative.confidence,
            })
        }
        "UtteranceEnd" => {
            tracing::debug!("Utterance end reported");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_result() {
        let raw = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.98}]},
            "is_final": true,
            "speech_final": true
        }"#;

        let event = parse_transcript(raw).expect("should parse");
        assert_eq!(event.text, "hello there");
        assert!(event.is_final);
        assert!(event.speech_final);
        assert!((event.confidence - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_interim_result() {
        let raw = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "hel", "confidence": 0.4}]},
            "is_final": false,
            "speech_final": false
        }"#;

        let event = parse_transcript(raw).expect("should parse");
        assert!(!event.is_final);
        assert!(!event.speech_final);
    }

    #[test]
    fn empty_transcript_produces_no_event() {
        let raw = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "   ", "confidence": 0.0}]},
            "is_final": true,
            "speech_final": true
        }"#;

        assert!(parse_transcript(raw).is_none());
    }

    #[test]
    fn utterance_end_is_informational() {
        assert!(parse_transcript(r#"{"type": "UtteranceEnd"}"#).is_none());
    }

    #[test]
    fn unknown_message_types_are_ignored() {
        assert!(parse_transcript(r#"{"type": "Metadata", "duration": 1.2}"#).is_none());
    }

    #[test]
    fn malformed_json_is_skipped() {
        assert!(parse_transcript("{not json").is_none());
    }
}
