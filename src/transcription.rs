//! Inbound audio → transcript events.
//!
//! The transcription channel pumps caller audio frames into the configured
//! backend session and turns the backend's raw event stream into the call's
//! transcript contract: an utterance-onset signal the moment the caller
//! starts speaking, partial hypotheses as they improve, and exactly one
//! final transcript per utterance.
//!
//! Settled-text policy: text the backend finalized is never dropped. If the
//! session errors or closes mid-utterance, whatever settled is flushed as a
//! final transcript before the channel reconnects; an utterance with nothing
//! settled produces no final event at all.

use crate::events::{CallEvent, EventBus, TranscriptEvent};
use crate::providers::{AudioFrame, TranscriberEvent, TranscriptionBackend};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames buffered towards the backend session.
const FRAME_CHANNEL_SIZE: usize = 64;
/// Consecutive failed session opens before the channel gives up.
const MAX_OPEN_ATTEMPTS: u32 = 3;
/// Pause between session open attempts.
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Accumulates finalized segments until the utterance ends.
#[derive(Debug, Default)]
struct SettledText {
    text: String,
}

impl SettledText {
    fn push_segment(&mut self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(segment);
    }

    fn take(&mut self) -> Option<String> {
        if self.text.trim().is_empty() {
            self.text.clear();
            return None;
        }
        Some(std::mem::take(&mut self.text))
    }
}

/// Drives one call's speech-to-text flow.
pub struct TranscriptionChannel {
    bus: Arc<EventBus>,
    backend: Arc<dyn TranscriptionBackend>,
    cancel: CancellationToken,
}

impl TranscriptionChannel {
    /// Create the channel for one call.
    pub fn new(
        bus: Arc<EventBus>,
        backend: Arc<dyn TranscriptionBackend>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            backend,
            cancel,
        }
    }

    /// Run until the audio source ends, the call is cancelled, or the
    /// backend becomes unreachable.
    pub async fn run(self, mut frames: mpsc::Receiver<AudioFrame>) {
        let mut settled = SettledText::default();
        let mut in_utterance = false;
        let mut open_failures: u32 = 0;

        'session: loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let (feed_tx, feed_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_SIZE);
            let mut stream = match self.backend.open(feed_rx).await {
                Ok(stream) => {
                    open_failures = 0;
                    stream
                }
                Err(e) => {
                    open_failures += 1;
                    error!(
                        attempt = open_failures,
                        "failed to open transcription session: {e}"
                    );
                    if open_failures >= MAX_OPEN_ATTEMPTS {
                        self.flush_settled(&mut settled, &mut in_utterance);
                        error!("transcription unavailable, giving up for this call");
                        return;
                    }
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(REOPEN_BACKOFF) => continue 'session,
                    }
                }
            };

            debug!(backend = self.backend.name(), "transcription session open");

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    frame = frames.recv() => {
                        match frame {
                            Some(frame) => {
                                if feed_tx.send(frame).await.is_err() {
                                    // Session dropped its input; drain what it
                                    // produced, then reconnect.
                                    while let Some(Ok(event)) = stream.next().await {
                                        self.handle_event(event, &mut settled, &mut in_utterance);
                                    }
                                    self.flush_settled(&mut settled, &mut in_utterance);
                                    warn!("transcription session lost, reconnecting");
                                    continue 'session;
                                }
                            }
                            None => {
                                // Caller audio ended (hangup). Let the session
                                // finish whatever it already has.
                                drop(feed_tx);
                                while let Some(event) = stream.next().await {
                                    match event {
                                        Ok(event) => self.handle_event(
                                            event,
                                            &mut settled,
                                            &mut in_utterance,
                                        ),
                                        Err(e) => {
                                            warn!("transcription error during drain: {e}");
                                            break;
                                        }
                                    }
                                }
                                self.flush_settled(&mut settled, &mut in_utterance);
                                info!("inbound audio ended, transcription channel done");
                                return;
                            }
                        }
                    }
                    event = stream.next() => {
                        match event {
                            Some(Ok(event)) => {
                                self.handle_event(event, &mut settled, &mut in_utterance);
                            }
                            Some(Err(e)) => {
                                warn!("transcription session error: {e}, reconnecting");
                                self.flush_settled(&mut settled, &mut in_utterance);
                                continue 'session;
                            }
                            None => {
                                debug!("transcription session closed, reconnecting");
                                self.flush_settled(&mut settled, &mut in_utterance);
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_event(
        &self,
        event: TranscriberEvent,
        settled: &mut SettledText,
        in_utterance: &mut bool,
    ) {
        match event {
            TranscriberEvent::SpeechStarted => {
                self.signal_onset(in_utterance, "");
            }
            TranscriberEvent::Interim { text } => {
                if text.trim().is_empty() {
                    return;
                }
                self.signal_onset(in_utterance, &text);
                self.bus
                    .emit(CallEvent::TranscriptPartial(TranscriptEvent::now(text)));
            }
            TranscriberEvent::Segment { text, endpoint } => {
                self.signal_onset(in_utterance, &text);
                settled.push_segment(&text);
                if endpoint {
                    self.flush_settled(settled, in_utterance);
                }
            }
            TranscriberEvent::UtteranceEnd => {
                // End-of-speech arrived without an endpointed segment; emit
                // what we collected so the utterance is not lost.
                self.flush_settled(settled, in_utterance);
            }
        }
    }

    /// Emit the barge-in trigger once per utterance, at onset.
    fn signal_onset(&self, in_utterance: &mut bool, text: &str) {
        if *in_utterance {
            return;
        }
        *in_utterance = true;
        self.bus
            .emit(CallEvent::Utterance(TranscriptEvent::now(text)));
    }

    fn flush_settled(&self, settled: &mut SettledText, in_utterance: &mut bool) {
        *in_utterance = false;
        if let Some(text) = settled.take() {
            self.bus
                .emit(CallEvent::TranscriptFinal(TranscriptEvent::now(text)));
        }
    }
}
