//! Reply fragments → synthesized audio chunks.
//!
//! Fragments synthesize independently and concurrently (bounded by config)
//! because per-fragment synthesis latency routinely exceeds inter-fragment
//! arrival time. Completion order is therefore unconstrained here — the
//! sequencer restores it. Every chunk carries its fragment's turn and
//! ordinal plus a contiguous per-fragment sequence starting at 0, and the
//! fragment's final chunk is tagged.

use crate::call::TurnActivity;
use crate::events::{AudioChunk, CallEvent, EventBus, ReplyFragment};
use crate::providers::SynthesisBackend;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Drives one call's speech synthesis.
pub struct SynthesisChannel {
    bus: Arc<EventBus>,
    backend: Arc<dyn SynthesisBackend>,
    activity: Arc<TurnActivity>,
    cancel: CancellationToken,
    max_concurrent: usize,
    // Subscribed at construction so no fragment can slip past before `run`.
    rx: Option<tokio::sync::mpsc::UnboundedReceiver<CallEvent>>,
}

impl SynthesisChannel {
    /// Create the channel for one call.
    pub fn new(
        bus: Arc<EventBus>,
        backend: Arc<dyn SynthesisBackend>,
        activity: Arc<TurnActivity>,
        cancel: CancellationToken,
        max_concurrent: usize,
    ) -> Self {
        let rx = bus.channel(&[crate::events::EventKind::ReplyFragment]);
        Self {
            bus,
            backend,
            activity,
            cancel,
            max_concurrent: max_concurrent.max(1),
            rx: Some(rx),
        }
    }

    /// Run until the call is cancelled.
    pub async fn run(mut self) {
        let mut rx = self.rx.take().expect("synthesis channel runs once");
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(CallEvent::ReplyFragment(fragment)) = event else {
                        if event.is_none() {
                            break;
                        }
                        continue;
                    };

                    if self.activity.is_barred(fragment.turn) {
                        debug!(
                            turn = fragment.turn,
                            ordinal = fragment.ordinal,
                            "skipping fragment of interrupted turn"
                        );
                        continue;
                    }
                    if fragment.text.trim().is_empty() {
                        // Nothing to voice; tell the sequencer not to wait.
                        self.bus.emit(CallEvent::FragmentFailed {
                            turn: fragment.turn,
                            ordinal: fragment.ordinal,
                        });
                        continue;
                    }

                    let bus = Arc::clone(&self.bus);
                    let backend = Arc::clone(&self.backend);
                    let activity = Arc::clone(&self.activity);
                    let cancel = self.cancel.clone();
                    let semaphore = Arc::clone(&semaphore);
                    tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire().await else {
                            return;
                        };
                        synthesize_fragment(bus, backend, activity, cancel, fragment).await;
                    });
                }
            }
        }
    }
}

/// Synthesize one fragment, emitting its chunk events.
async fn synthesize_fragment(
    bus: Arc<EventBus>,
    backend: Arc<dyn SynthesisBackend>,
    activity: Arc<TurnActivity>,
    cancel: CancellationToken,
    fragment: ReplyFragment,
) {
    // The turn may have been interrupted while this fragment sat in the
    // concurrency queue.
    if activity.is_barred(fragment.turn) {
        return;
    }

    let mut stream = match backend.synthesize(&fragment.text).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                turn = fragment.turn,
                ordinal = fragment.ordinal,
                "synthesis failed: {e}"
            );
            bus.emit(CallEvent::FragmentFailed {
                turn: fragment.turn,
                ordinal: fragment.ordinal,
            });
            return;
        }
    };

    // Hold one chunk back so the final one can be tagged when the stream
    // ends. Sequences stay contiguous from 0 regardless of payload sizes.
    let mut seq: u32 = 0;
    let mut held: Option<Bytes> = None;
    let mut emitted = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(payload)) => {
                    if payload.is_empty() {
                        continue;
                    }
                    if let Some(previous) = held.replace(payload) {
                        if activity.is_barred(fragment.turn) {
                            return;
                        }
                        bus.emit(CallEvent::AudioChunk(AudioChunk {
                            turn: fragment.turn,
                            ordinal: fragment.ordinal,
                            seq,
                            payload: previous,
                            last: false,
                        }));
                        seq += 1;
                        emitted = true;
                    }
                }
                Some(Err(e)) => {
                    // Close the fragment: whatever was emitted stands, the
                    // rest never will; the sequencer must not wait for it.
                    warn!(
                        turn = fragment.turn,
                        ordinal = fragment.ordinal,
                        "synthesis stream failed mid-fragment: {e}"
                    );
                    bus.emit(CallEvent::FragmentFailed {
                        turn: fragment.turn,
                        ordinal: fragment.ordinal,
                    });
                    return;
                }
                None => {
                    if let Some(last) = held.take() {
                        if !activity.is_barred(fragment.turn) {
                            bus.emit(CallEvent::AudioChunk(AudioChunk {
                                turn: fragment.turn,
                                ordinal: fragment.ordinal,
                                seq,
                                payload: last,
                                last: true,
                            }));
                        }
                    } else if !emitted {
                        // The backend produced no audio at all.
                        bus.emit(CallEvent::FragmentFailed {
                            turn: fragment.turn,
                            ordinal: fragment.ordinal,
                        });
                    }
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, TranscriptEvent};
    use crate::test_utils::ChunkedSynthesizer;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        bus: Arc<EventBus>,
        activity: Arc<TurnActivity>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(backend: ChunkedSynthesizer, max_concurrent: usize) -> Harness {
        let bus = Arc::new(EventBus::new());
        let activity = Arc::new(TurnActivity::default());
        let events = bus.channel(&[EventKind::AudioChunk, EventKind::FragmentFailed]);
        let cancel = CancellationToken::new();
        let channel = SynthesisChannel::new(
            Arc::clone(&bus),
            Arc::new(backend),
            Arc::clone(&activity),
            cancel.clone(),
            max_concurrent,
        );
        let task = tokio::spawn(channel.run());
        Harness {
            bus,
            activity,
            events,
            cancel,
            task,
        }
    }

    fn fragment(turn: u64, ordinal: u32, text: &str) -> CallEvent {
        CallEvent::ReplyFragment(ReplyFragment {
            turn,
            ordinal,
            text: text.to_owned(),
            sentence_end: true,
            function_call: None,
        })
    }

    async fn collect(harness: &mut Harness, n: usize) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while out.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
                .await
                .expect("event timeout")
                .expect("bus closed");
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn chunks_are_contiguous_and_last_is_tagged() {
        let backend = ChunkedSynthesizer::new(3);
        let mut harness = start(backend, 2);

        harness.bus.emit(fragment(1, 0, "hello"));
        let events = collect(&mut harness, 3).await;

        let chunks: Vec<&AudioChunk> = events
            .iter()
            .map(|e| match e {
                CallEvent::AudioChunk(c) => c,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[1].seq, 1);
        assert_eq!(chunks[2].seq, 2);
        assert!(!chunks[0].last && !chunks[1].last && chunks[2].last);
        assert!(chunks.iter().all(|c| c.turn == 1 && c.ordinal == 0));

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn slow_fragment_does_not_block_fast_one() {
        let backend = ChunkedSynthesizer::new(1).with_delay("slow text", Duration::from_millis(300));
        let mut harness = start(backend, 2);

        harness.bus.emit(fragment(1, 0, "slow text"));
        harness.bus.emit(fragment(1, 1, "fast text"));

        let events = collect(&mut harness, 2).await;
        let ordinals: Vec<u32> = events
            .iter()
            .map(|e| match e {
                CallEvent::AudioChunk(c) => c.ordinal,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        // The fast fragment finishes first; reordering is downstream's job.
        assert_eq!(ordinals, [1, 0]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn failure_emits_marker_and_spares_others() {
        let backend = ChunkedSynthesizer::new(1).with_failure("broken");
        let mut harness = start(backend, 2);

        harness.bus.emit(fragment(1, 0, "broken"));
        harness.bus.emit(fragment(1, 1, "fine"));

        let events = collect(&mut harness, 2).await;
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::FragmentFailed { turn: 1, ordinal: 0 }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::AudioChunk(c) if c.ordinal == 1 && c.last
        )));

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn barred_turn_is_dropped_silently() {
        let backend = ChunkedSynthesizer::new(2);
        let mut harness = start(backend, 2);

        harness.activity.bar_up_to(3);
        harness.bus.emit(fragment(3, 0, "too late"));
        // A live turn afterwards still works, bounding the wait.
        harness.bus.emit(fragment(4, 0, "current"));

        let events = collect(&mut harness, 2).await;
        assert!(events.iter().all(|e| matches!(
            e,
            CallEvent::AudioChunk(c) if c.turn == 4
        )));

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn empty_fragment_reports_failure_marker() {
        let backend = ChunkedSynthesizer::new(2);
        let mut harness = start(backend, 2);

        harness.bus.emit(CallEvent::ReplyFragment(ReplyFragment {
            turn: 1,
            ordinal: 0,
            text: "   ".into(),
            sentence_end: false,
            function_call: None,
        }));

        let events = collect(&mut harness, 1).await;
        assert!(matches!(
            events[0],
            CallEvent::FragmentFailed { turn: 1, ordinal: 0 }
        ));

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn unrelated_events_are_ignored() {
        let backend = ChunkedSynthesizer::new(1);
        let mut harness = start(backend, 2);

        harness
            .bus
            .emit(CallEvent::Utterance(TranscriptEvent::now("hi")));
        harness.bus.emit(fragment(1, 0, "real work"));

        let events = collect(&mut harness, 1).await;
        assert!(matches!(&events[0], CallEvent::AudioChunk(c) if c.ordinal == 0));

        harness.cancel.cancel();
        let _ = harness.task.await;
    }
}
