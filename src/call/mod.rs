pub mod speaker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use chrono::{DateTime, Local};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::pipeline::brain::{Brain, Conversation};
use crate::pipeline::stt::{SttChannel, TranscriptEvent};
use crate::twilio::media::StreamEvent;
use crate::{transcript, AppState};
use speaker::{Segment, Speaker, SpeakerEvent, FALLBACK_UTTERANCE};

/// Mark attached to the greeting's last audio chunk; its echo tells us the
/// caller has heard the whole greeting.
const GREETING_MARK: &str = "greeting_end";

/// State machine for a phone call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Greeting,
    Listening,
    Processing,
    Speaking,
    Ended,
}

/// Metadata about the current call, set once at the `start` event.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    pub call_sid: String,
    pub stream_sid: String,
    pub caller: String,
    pub called: String,
    pub start_time: DateTime<Local>,
}

impl CallMetadata {
    fn new() -> Self {
        Self {
            call_sid: String::new(),
            stream_sid: String::new(),
            caller: String::new(),
            called: String::new(),
            start_time: Local::now(),
        }
    }
}

/// Entry point for one media-stream connection: connect the recognizer,
/// then run the session until the call ends.
pub async fn handle_call(socket: WebSocket, state: AppState) {
    tracing::info!("Media stream connected");

    let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
    let stt = match SttChannel::connect(&state.config, transcript_tx).await {
        Ok(stt) => stt,
        Err(e) => {
            tracing::error!("Cannot start recognition session: {e}");
            return;
        }
    };

    CallSession::run(state, stt, socket, transcript_rx).await;

    tracing::info!("Media stream disconnected");
}

/// Owns the per-call state machine and routes every event: telephony frames,
/// transcript events, and speaker status. The session loop is the single
/// writer of the telephony socket, so outbound `media`, `mark` and `clear`
/// frames from any task are serialized through one channel.
struct CallSession {
    app: AppState,
    stt: SttChannel,
    state: CallState,
    metadata: CallMetadata,
    conversation: Arc<Mutex<Conversation>>,
    /// Finalized-but-not-turn-final transcript pieces awaiting `speech_final`.
    pending_utterance: String,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    outbound_tx: mpsc::Sender<Message>,
    speaker_events_tx: mpsc::UnboundedSender<SpeakerEvent>,
    /// Present once the speaker task is running (after the `start` event).
    speech_tx: Option<mpsc::UnboundedSender<Segment>>,
}

impl CallSession {
    async fn run(
        app: AppState,
        stt: SttChannel,
        mut socket: WebSocket,
        mut transcript_rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    ) {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let (speaker_events_tx, mut speaker_events_rx) = mpsc::unbounded_channel();
        let conversation = Conversation::new(app.system_prompt.clone());

        let mut session = Self {
            app,
            stt,
            state: CallState::Connecting,
            metadata: CallMetadata::new(),
            conversation: Arc::new(Mutex::new(conversation)),
            pending_utterance: String::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            outbound_tx,
            speaker_events_tx,
            speech_tx: None,
        };

        loop {
            tokio::select! {
                ws_msg = socket.recv() => {
                    let text = match ws_msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Media stream closed");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {e}");
                            break;
                        }
                        _ => continue,
                    };

                    let event: StreamEvent = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!("Failed to parse stream event: {e}");
                            continue;
                        }
                    };

                    if session.on_event(event).await {
                        break;
                    }
                }

                // Single-writer drain of outbound frames.
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = socket.send(frame).await {
                        tracing::error!("Failed to send frame to peer: {e}");
                        break;
                    }
                }

                event = transcript_rx.recv() => match event {
                    Some(event) => session.on_transcript(event),
                    None => {
                        tracing::info!(
                            call_sid = %session.metadata.call_sid,
                            "Recognition stream ended"
                        );
                        break;
                    }
                },

                Some(event) = speaker_events_rx.recv() => session.on_speaker_event(event),
            }
        }

        session.shutdown().await;
    }

    /// Handle one inbound telephony frame. Returns true when the call is over.
    async fn on_event(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Connected => {
                tracing::info!("Telephony peer connected");
            }
            StreamEvent::Start { start } => {
                self.metadata.call_sid = start.call_sid;
                self.metadata.stream_sid = start.stream_sid;
                self.metadata.caller = start
                    .custom_parameters
                    .get("caller")
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string());
                self.metadata.called = start
                    .custom_parameters
                    .get("called")
                    .cloned()
                    .unwrap_or_default();

                tracing::info!(
                    call_sid = %self.metadata.call_sid,
                    stream_sid = %self.metadata.stream_sid,
                    caller = %self.metadata.caller,
                    called = %self.metadata.called,
                    "Call started"
                );

                self.state = CallState::Greeting;
                self.start_speaker();
                self.speak_greeting().await;
            }
            StreamEvent::Media { media } => {
                match base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                    Ok(audio) => self.stt.send_audio(audio).await,
                    Err(e) => tracing::warn!("Failed to decode inbound audio: {e}"),
                }
            }
            StreamEvent::Mark { mark } => {
                tracing::debug!(name = %mark.name, "Mark reached");
                if mark.name == GREETING_MARK && self.state == CallState::Greeting {
                    self.state = CallState::Listening;
                }
            }
            StreamEvent::Stop => {
                tracing::info!(call_sid = %self.metadata.call_sid, "Call ended by peer");
                return true;
            }
        }
        false
    }

    fn on_transcript(&mut self, event: TranscriptEvent) {
        tracing::debug!(
            text = %event.text,
            is_final = event.is_final,
            speech_final = event.speech_final,
            confidence = event.confidence,
            "Transcript"
        );

        match transcript_action(self.state, &mut self.pending_utterance, &event) {
            TranscriptAction::None => {}
            TranscriptAction::BargeIn => {
                tracing::info!(text = %event.text, "Barge-in detected");
                self.interrupt.store(true, Ordering::SeqCst);
            }
            TranscriptAction::Dispatch(utterance) => {
                self.state = CallState::Processing;
                self.spawn_utterance_processor(utterance);
            }
        }
    }

    fn on_speaker_event(&mut self, event: SpeakerEvent) {
        if let SpeakerEvent::Finished { interrupted: true, .. } = event {
            tracing::debug!("Interrupted segment finished");
        }
        self.state = state_after_speaker_event(self.state, event);
    }

    fn start_speaker(&mut self) {
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let speaker = Speaker {
            tts: self.app.tts.clone(),
            stream_sid: self.metadata.stream_sid.clone(),
            queue_rx: speech_rx,
            queue_tx: speech_tx.clone(),
            outbound_tx: self.outbound_tx.clone(),
            events_tx: self.speaker_events_tx.clone(),
            interrupt: self.interrupt.clone(),
            cancel: self.cancel.clone(),
        };
        self.tasks.spawn(speaker.run());
        self.speech_tx = Some(speech_tx);
    }

    async fn speak_greeting(&mut self) {
        let greeting = format!(
            "Hello, this is {}. How can I help you?",
            self.app.config.agent_name
        );
        self.conversation.lock().await.add_assistant_message(&greeting);
        self.enqueue(Segment::with_mark(greeting, GREETING_MARK));
    }

    fn enqueue(&self, segment: Segment) {
        if let Some(tx) = &self.speech_tx {
            let _ = tx.send(segment);
        }
    }

    /// Drive the LLM for one finalized utterance in a tracked task so the
    /// session loop keeps consuming audio while the response streams in.
    /// A processor failure never ends the call.
    fn spawn_utterance_processor(&self, utterance: String) {
        let Some(speech_tx) = self.speech_tx.clone() else {
            return;
        };
        let brain = self.app.brain.clone();
        let conversation = self.conversation.clone();
        let cancel = self.cancel.clone();
        let call_sid = self.metadata.call_sid.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = process_utterance(utterance, brain, conversation, speech_tx, call_sid) => {}
            }
        });
    }

    async fn shutdown(mut self) {
        tracing::info!(call_sid = %self.metadata.call_sid, "Call teardown");
        self.state = CallState::Ended;

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.stt.close().await;

        let conversation = self.conversation.lock().await;
        if !conversation.is_empty() {
            match transcript::save(
                &conversation,
                &self.metadata,
                &self.app.config.transcripts_dir,
            ) {
                Ok(path) => tracing::info!(path = %path.display(), "Transcript saved"),
                Err(e) => tracing::warn!("Failed to save transcript: {e}"),
            }
        }
    }
}

async fn process_utterance(
    utterance: String,
    brain: Arc<Brain>,
    conversation: Arc<Mutex<Conversation>>,
    speech_tx: mpsc::UnboundedSender<Segment>,
    call_sid: String,
) {
    tracing::info!(call_sid = %call_sid, utterance = %utterance, "Processing utterance");

    // Snapshot under the lock so the stream runs without holding it.
    let snapshot = {
        let mut conversation = conversation.lock().await;
        conversation.add_user_message(&utterance);
        conversation.clone()
    };

    let result = brain
        .respond_sentences(&snapshot, |sentence| {
            let _ = speech_tx.send(Segment::plain(sentence));
        })
        .await;

    match result {
        Ok(response) => {
            if !response.is_empty() {
                conversation.lock().await.add_assistant_message(&response);
            }
        }
        Err(e) => {
            tracing::error!(call_sid = %call_sid, "Response generation failed: {e}");
            let _ = speech_tx.send(Segment::plain(FALLBACK_UTTERANCE));
            conversation
                .lock()
                .await
                .add_assistant_message(FALLBACK_UTTERANCE);
        }
    }
}

/// What the controller does with one transcript event.
#[derive(Debug, PartialEq, Eq)]
enum TranscriptAction {
    None,
    /// Caller spoke over the agent; latch the interrupt.
    BargeIn,
    /// A complete utterance is ready for the dialogue engine.
    Dispatch(String),
}

/// Turn-taking rules: finals accumulate until `speech_final` closes the
/// turn; interims only matter as barge-in while the agent is speaking.
fn transcript_action(
    state: CallState,
    pending: &mut String,
    event: &TranscriptEvent,
) -> TranscriptAction {
    if state == CallState::Ended {
        return TranscriptAction::None;
    }

    if event.is_final {
        if !pending.is_empty() {
            pending.push(' ');
        }
        pending.push_str(&event.text);

        if !event.speech_final {
            return TranscriptAction::None;
        }

        let utterance = std::mem::take(pending).trim().to_string();
        if utterance.is_empty() {
            TranscriptAction::None
        } else {
            TranscriptAction::Dispatch(utterance)
        }
    } else if state == CallState::Speaking && !event.text.trim().is_empty() {
        TranscriptAction::BargeIn
    } else {
        TranscriptAction::None
    }
}

fn state_after_speaker_event(state: CallState, event: SpeakerEvent) -> CallState {
    match event {
        SpeakerEvent::Started => match state {
            // The greeting plays out in Greeting until its mark echoes back.
            CallState::Listening | CallState::Processing | CallState::Speaking => {
                CallState::Speaking
            }
            other => other,
        },
        SpeakerEvent::Finished { queue_empty, .. } => {
            if state == CallState::Speaking && queue_empty {
                CallState::Listening
            } else {
                state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, is_final: bool, speech_final: bool) -> TranscriptEvent {
        TranscriptEvent {
            text: text.to_string(),
            is_final,
            speech_final,
            confidence: 0.9,
        }
    }

    #[test]
    fn interims_do_not_dispatch_while_listening() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("hello", false, false),
        );
        assert_eq!(action, TranscriptAction::None);
        assert!(pending.is_empty());
    }

    #[test]
    fn speech_final_dispatches_trimmed_utterance() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("hello there", true, true),
        );
        assert_eq!(action, TranscriptAction::Dispatch("hello there".into()));
        assert!(pending.is_empty());
    }

    #[test]
    fn successive_finals_merge_with_single_space() {
        let mut pending = String::new();

        let first = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("part one", true, false),
        );
        assert_eq!(first, TranscriptAction::None);
        assert_eq!(pending, "part one");

        let second = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("part two", true, true),
        );
        assert_eq!(second, TranscriptAction::Dispatch("part one part two".into()));
    }

    #[test]
    fn empty_final_utterance_is_a_no_op() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("  ", true, true),
        );
        assert_eq!(action, TranscriptAction::None);
        assert!(pending.is_empty());
    }

    #[test]
    fn interim_while_speaking_is_barge_in() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Speaking,
            &mut pending,
            &event("wait", false, false),
        );
        assert_eq!(action, TranscriptAction::BargeIn);
    }

    #[test]
    fn whitespace_interim_never_barges_in() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Speaking,
            &mut pending,
            &event("   ", false, false),
        );
        assert_eq!(action, TranscriptAction::None);
    }

    #[test]
    fn interim_while_listening_is_not_barge_in() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Listening,
            &mut pending,
            &event("hello", false, false),
        );
        assert_eq!(action, TranscriptAction::None);
    }

    #[test]
    fn ended_state_ignores_transcripts() {
        let mut pending = String::new();
        let action = transcript_action(
            CallState::Ended,
            &mut pending,
            &event("hello", true, true),
        );
        assert_eq!(action, TranscriptAction::None);
    }

    #[test]
    fn speaker_started_moves_processing_to_speaking() {
        let state = state_after_speaker_event(CallState::Processing, SpeakerEvent::Started);
        assert_eq!(state, CallState::Speaking);
    }

    #[test]
    fn greeting_is_not_overridden_by_speaker_start() {
        let state = state_after_speaker_event(CallState::Greeting, SpeakerEvent::Started);
        assert_eq!(state, CallState::Greeting);
    }

    #[test]
    fn drained_queue_returns_to_listening() {
        let state = state_after_speaker_event(
            CallState::Speaking,
            SpeakerEvent::Finished {
                interrupted: false,
                queue_empty: true,
            },
        );
        assert_eq!(state, CallState::Listening);
    }

    #[test]
    fn pending_segments_keep_speaking() {
        let state = state_after_speaker_event(
            CallState::Speaking,
            SpeakerEvent::Finished {
                interrupted: false,
                queue_empty: false,
            },
        );
        assert_eq!(state, CallState::Speaking);
    }

    #[test]
    fn barge_in_finish_returns_to_listening() {
        let state = state_after_speaker_event(
            CallState::Speaking,
            SpeakerEvent::Finished {
                interrupted: true,
                queue_empty: true,
            },
        );
        assert_eq!(state, CallState::Listening);
    }
}
