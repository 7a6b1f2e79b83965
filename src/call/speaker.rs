use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::tts::TtsClient;
use crate::twilio::media;

/// Spoken to the caller when response generation or synthesis fails.
pub const FALLBACK_UTTERANCE: &str =
    "I'm sorry, I'm having trouble understanding. Could you please repeat that?";

/// Real-time pacing between outbound audio chunks. Sending faster overruns
/// the telephony buffer and the peer drops audio.
const PACE_INTERVAL: Duration = Duration::from_millis(20);

/// One text span synthesized as a unit, with an optional mark emitted after
/// its final audio chunk.
#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    pub mark: Option<&'static str>,
}

impl Segment {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mark: None,
        }
    }

    pub fn with_mark(text: impl Into<String>, mark: &'static str) -> Self {
        Self {
            text: text.into(),
            mark: Some(mark),
        }
    }
}

/// Status updates from the speaker task to the session controller, which
/// owns the state machine.
#[derive(Debug, Clone, Copy)]
pub enum SpeakerEvent {
    /// A segment was dequeued and is being synthesized/sent.
    Started,
    /// The segment finished (played out, interrupted, or failed).
    Finished { interrupted: bool, queue_empty: bool },
}

/// How one segment's playout ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    Completed,
    Interrupted,
    Closed,
}

/// Background task that drains the speech queue: synthesizes each segment
/// and paces its audio to the telephony peer, honoring the barge-in latch.
pub struct Speaker {
    pub(crate) tts: Arc<TtsClient>,
    pub(crate) stream_sid: String,
    pub(crate) queue_rx: mpsc::UnboundedReceiver<Segment>,
    /// Kept so a failed synthesis can queue the fallback utterance.
    pub(crate) queue_tx: mpsc::UnboundedSender<Segment>,
    pub(crate) outbound_tx: mpsc::Sender<Message>,
    pub(crate) events_tx: mpsc::UnboundedSender<SpeakerEvent>,
    pub(crate) interrupt: Arc<AtomicBool>,
    pub(crate) cancel: CancellationToken,
}

impl Speaker {
    pub async fn run(mut self) {
        loop {
            let segment = tokio::select! {
                _ = self.cancel.cancelled() => break,
                segment = self.queue_rx.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
            };

            // Re-arm the barge-in latch for the new segment.
            self.interrupt.store(false, Ordering::SeqCst);
            let _ = self.events_tx.send(SpeakerEvent::Started);

            tracing::info!(text = %segment.text, "Speaking");
            let interrupted = self.speak(segment).await;

            let _ = self.events_tx.send(SpeakerEvent::Finished {
                interrupted,
                queue_empty: self.queue_rx.is_empty(),
            });
        }
    }

    /// Synthesize and send one segment. Returns true if it was cut short by
    /// barge-in.
    async fn speak(&mut self, segment: Segment) -> bool {
        let audio = match self.tts.synthesize(&segment.text).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!("Synthesis failed: {e}");
                if segment.text != FALLBACK_UTTERANCE {
                    // The fallback inherits the segment's mark so milestones
                    // like the greeting end still reach the peer.
                    let _ = self.queue_tx.send(Segment {
                        text: FALLBACK_UTTERANCE.to_string(),
                        mark: segment.mark,
                    });
                } else if let Some(mark) = segment.mark {
                    // Nothing speakable left; the peer echoes a bare mark
                    // immediately, which keeps the state machine moving.
                    let _ = self
                        .outbound_tx
                        .send(media::mark_frame(&self.stream_sid, mark))
                        .await;
                }
                return false;
            }
        };

        let outcome = send_segment(
            &audio,
            &self.stream_sid,
            &self.outbound_tx,
            &self.interrupt,
            &self.cancel,
        )
        .await;

        match outcome {
            SegmentOutcome::Completed => {
                if let Some(mark) = segment.mark {
                    let _ = self
                        .outbound_tx
                        .send(media::mark_frame(&self.stream_sid, mark))
                        .await;
                }
                false
            }
            SegmentOutcome::Interrupted => {
                self.handle_interrupt().await;
                true
            }
            SegmentOutcome::Closed => false,
        }
    }

    /// Barge-in: discard everything queued and tell the peer to flush its
    /// playback buffer. The clear frame goes through the same writer as
    /// media frames, so it precedes any later segment's audio.
    async fn handle_interrupt(&mut self) {
        let mut discarded = 0;
        while self.queue_rx.try_recv().is_ok() {
            discarded += 1;
        }
        tracing::info!(discarded, "Speech interrupted, flushing playback");
        let _ = self
            .outbound_tx
            .send(media::clear_frame(&self.stream_sid))
            .await;
    }
}

/// Send one synthesized audio blob as paced 640-byte media frames, checking
/// the barge-in latch between chunks.
pub(crate) async fn send_segment(
    audio: &[u8],
    stream_sid: &str,
    outbound_tx: &mpsc::Sender<Message>,
    interrupt: &AtomicBool,
    cancel: &CancellationToken,
) -> SegmentOutcome {
    for chunk in audio.chunks(media::CHUNK_SIZE) {
        if cancel.is_cancelled() {
            return SegmentOutcome::Closed;
        }
        if interrupt.load(Ordering::SeqCst) {
            return SegmentOutcome::Interrupted;
        }
        let sent = tokio::select! {
            _ = cancel.cancelled() => return SegmentOutcome::Closed,
            sent = outbound_tx.send(media::media_frame(stream_sid, chunk)) => sent,
        };
        if sent.is_err() {
            return SegmentOutcome::Closed;
        }
        tokio::time::sleep(PACE_INTERVAL).await;
    }
    SegmentOutcome::Completed
}
