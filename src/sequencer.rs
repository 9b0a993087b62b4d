//! Ordered, paced, interruptible delivery of reply audio.
//!
//! Concurrent synthesis finishes in whatever order it likes; the sequencer
//! restores generation order. Chunks buffer keyed by fragment ordinal and a
//! delivery cursor `(ordinal, seq)` walks them strictly ascending: a chunk
//! for ordinal N+1 waits until every chunk of ordinal N went out, even if it
//! was synthesized first. The cursor resets only at barge-in or turn
//! completion.
//!
//! Barge-in: an utterance while a reply is in flight discards everything
//! undelivered, sends exactly one `clear` to the transport so queued audio
//! downstream is flushed too, bumps the call's interruption counter, and
//! broadcasts `Interrupted` so generation and synthesis reset. A chunk that
//! finishes synthesis after the interrupt names a barred turn and is
//! dropped on arrival — an expected race, not an error.
//!
//! Pacing: delivery is throttled to the transport's playout rate with a
//! small lead window, so barge-in never has minutes of queued audio to
//! claw back. Sink backpressure simply suspends delivery.

use crate::call::{CallContext, TurnActivity};
use crate::config::SequencerConfig;
use crate::events::{CallEvent, EventBus, EventKind};
use crate::providers::MediaSink;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered synthesis output for one fragment.
#[derive(Debug, Default)]
struct FragmentBuf {
    chunks: BTreeMap<u32, Bytes>,
    last_seq: Option<u32>,
    failed: bool,
}

/// Delivery state for the turn currently going out.
#[derive(Debug)]
struct TurnState {
    turn: u64,
    buffer: BTreeMap<u32, FragmentBuf>,
    cursor_ordinal: u32,
    cursor_seq: u32,
    expected_fragments: Option<u32>,
}

impl TurnState {
    fn new(turn: u64) -> Self {
        Self {
            turn,
            buffer: BTreeMap::new(),
            cursor_ordinal: 0,
            cursor_seq: 0,
            expected_fragments: None,
        }
    }

    /// The payload waiting at the cursor, if it has arrived.
    fn ready_payload_len(&self) -> Option<usize> {
        self.buffer
            .get(&self.cursor_ordinal)
            .and_then(|f| f.chunks.get(&self.cursor_seq))
            .map(Bytes::len)
    }

    /// Skip failed fragments sitting at the cursor; their undelivered
    /// remainder is dropped (audio already sent is not retracted).
    fn skip_failed(&mut self) {
        while let Some(frag) = self.buffer.get(&self.cursor_ordinal) {
            if !frag.failed {
                break;
            }
            debug!(
                turn = self.turn,
                ordinal = self.cursor_ordinal,
                "skipping failed fragment"
            );
            self.buffer.remove(&self.cursor_ordinal);
            self.cursor_ordinal += 1;
            self.cursor_seq = 0;
        }
    }

    /// Whether every expected fragment has been delivered (or skipped).
    fn is_complete(&self) -> bool {
        self.expected_fragments
            .is_some_and(|n| self.cursor_ordinal >= n)
    }
}

/// Owns ordering, pacing, and the interrupt protocol for one call.
pub struct StreamSequencer {
    ctx: Arc<CallContext>,
    bus: Arc<EventBus>,
    sink: Arc<dyn MediaSink>,
    activity: Arc<TurnActivity>,
    config: SequencerConfig,
    cancel: CancellationToken,
    // Subscribed at construction so no chunk can slip past before `run`.
    rx: Option<tokio::sync::mpsc::UnboundedReceiver<CallEvent>>,
}

impl StreamSequencer {
    /// Create the sequencer for one call.
    pub fn new(
        ctx: Arc<CallContext>,
        bus: Arc<EventBus>,
        sink: Arc<dyn MediaSink>,
        activity: Arc<TurnActivity>,
        config: SequencerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let rx = bus.channel(&[
            EventKind::AudioChunk,
            EventKind::ReplyFragment,
            EventKind::ReplyComplete,
            EventKind::ReplyAborted,
            EventKind::FragmentFailed,
            EventKind::Utterance,
        ]);
        Self {
            ctx,
            bus,
            sink,
            activity,
            config,
            cancel,
            rx: Some(rx),
        }
    }

    /// Run until the call is cancelled.
    pub async fn run(mut self) {
        let mut rx = self.rx.take().expect("sequencer runs once");

        let mut state: Option<TurnState> = None;
        // Real-time playout head; delivery may run `lead_ms` ahead of it.
        let mut playout_head: Option<Instant> = None;
        let lead = Duration::from_millis(self.config.lead_ms);

        loop {
            let send_at = state.as_ref().and_then(|s| {
                s.ready_payload_len().map(|_| {
                    if self.config.pacing_enabled {
                        playout_head
                            .map(|head| head.checked_sub(lead).unwrap_or_else(Instant::now))
                            .unwrap_or_else(Instant::now)
                    } else {
                        Instant::now()
                    }
                })
            });

            tokio::select! {
                // Biased: a queued utterance must win over the next delivery
                // step, or barge-in would lag behind buffered audio.
                biased;
                () = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &mut state, &mut playout_head).await;
                }
                () = tokio::time::sleep_until(send_at.unwrap_or_else(Instant::now)),
                        if send_at.is_some() => {
                    self.deliver_next(&mut state, &mut playout_head).await;
                    self.finish_if_complete(&mut state, &mut playout_head);
                }
            }
        }
    }

    async fn handle_event(
        &self,
        event: CallEvent,
        state: &mut Option<TurnState>,
        playout_head: &mut Option<Instant>,
    ) {
        match event {
            CallEvent::AudioChunk(chunk) => {
                if self.activity.is_barred(chunk.turn) {
                    // Synthesis finished after the barge-in won the race.
                    debug!(
                        turn = chunk.turn,
                        ordinal = chunk.ordinal,
                        seq = chunk.seq,
                        "dropping chunk of interrupted turn"
                    );
                    return;
                }
                let Some(s) = ensure_turn(state, chunk.turn) else {
                    return;
                };
                let frag = s.buffer.entry(chunk.ordinal).or_default();
                if chunk.last {
                    frag.last_seq = Some(chunk.seq);
                }
                frag.chunks.insert(chunk.seq, chunk.payload);
            }
            CallEvent::ReplyFragment(fragment) => {
                // Announces the turn before any audio exists, closing the
                // window where a barge-in would find "nothing in flight".
                if !self.activity.is_barred(fragment.turn) {
                    ensure_turn(state, fragment.turn);
                }
            }
            CallEvent::ReplyComplete { turn, fragments }
            | CallEvent::ReplyAborted { turn, fragments } => {
                if self.activity.is_barred(turn) {
                    return;
                }
                if let Some(s) = ensure_turn(state, turn) {
                    s.expected_fragments = Some(fragments);
                    s.skip_failed();
                }
                self.finish_if_complete(state, playout_head);
            }
            CallEvent::FragmentFailed { turn, ordinal } => {
                if self.activity.is_barred(turn) {
                    return;
                }
                if let Some(s) = ensure_turn(state, turn) {
                    s.buffer.entry(ordinal).or_default().failed = true;
                    s.skip_failed();
                }
                self.finish_if_complete(state, playout_head);
            }
            CallEvent::Utterance(_) => {
                self.maybe_interrupt(state, playout_head).await;
            }
            _ => {}
        }
    }

    /// The barge-in protocol. Only fires while a reply is actually in
    /// flight; a second utterance after the turn is already barred is a
    /// no-op, so the transport sees exactly one `clear` per interrupt.
    async fn maybe_interrupt(
        &self,
        state: &mut Option<TurnState>,
        playout_head: &mut Option<Instant>,
    ) {
        let active = self.activity.active_turn.load(Ordering::Acquire);
        let generation_live =
            self.activity.generating.load(Ordering::Acquire) && !self.activity.is_barred(active);
        let delivery_live = state.is_some();
        if !generation_live && !delivery_live {
            return;
        }

        let barred = state
            .as_ref()
            .map(|s| s.turn)
            .unwrap_or(0)
            .max(if generation_live { active } else { 0 });
        self.activity.bar_up_to(barred);

        let discarded: usize = state
            .as_ref()
            .map(|s| s.buffer.values().map(|f| f.chunks.len()).sum())
            .unwrap_or(0);
        *state = None;
        *playout_head = None;
        self.activity.speaking.store(false, Ordering::Release);

        if let Err(e) = self.sink.clear().await {
            warn!("transport clear failed: {e}");
        }

        let count = self.ctx.record_interruption();
        info!(turn = barred, discarded, interruptions = count, "barge-in");
        self.bus.emit(CallEvent::Interrupted { turn: barred });
    }

    /// Send the chunk at the cursor and advance.
    async fn deliver_next(&self, state: &mut Option<TurnState>, playout_head: &mut Option<Instant>) {
        let Some(s) = state.as_mut() else { return };
        let Some(frag) = s.buffer.get_mut(&s.cursor_ordinal) else {
            return;
        };
        let Some(payload) = frag.chunks.remove(&s.cursor_seq) else {
            return;
        };
        let fragment_done = frag.last_seq == Some(s.cursor_seq);
        let (turn, ordinal, seq) = (s.turn, s.cursor_ordinal, s.cursor_seq);
        let len = payload.len();

        if let Err(e) = self.sink.send_audio(payload).await {
            // The transport is gone; delivery for this turn is over. The
            // call itself ends via hangup, not from here.
            warn!(turn, ordinal, seq, "transport send failed: {e}");
            s.buffer.clear();
            s.expected_fragments = Some(s.cursor_ordinal);
            return;
        }

        self.activity.speaking.store(true, Ordering::Release);
        self.bus.emit(CallEvent::AudioDelivered { turn, ordinal, seq });

        if self.config.pacing_enabled {
            let duration = Duration::from_secs_f64(
                len as f64 / f64::from(self.config.bytes_per_second.max(1)),
            );
            let now = Instant::now();
            let head = playout_head.map_or(now, |h| h.max(now));
            *playout_head = Some(head + duration);
        }

        if fragment_done {
            s.buffer.remove(&s.cursor_ordinal);
            s.cursor_ordinal += 1;
            s.cursor_seq = 0;
        } else {
            s.cursor_seq += 1;
        }
        s.skip_failed();
    }

    /// Reset once every expected fragment went out.
    fn finish_if_complete(&self, state: &mut Option<TurnState>, playout_head: &mut Option<Instant>) {
        let Some(s) = state.as_mut() else { return };
        s.skip_failed();
        if !s.is_complete() {
            return;
        }
        let turn = s.turn;
        *state = None;
        *playout_head = None;
        self.activity.speaking.store(false, Ordering::Release);
        debug!(turn, "turn fully delivered");
        self.bus.emit(CallEvent::TurnDelivered { turn });
    }
}

/// Get the delivery state for `turn`, starting or replacing it as needed.
/// Returns `None` for events of an older turn than the one in flight.
fn ensure_turn(state: &mut Option<TurnState>, turn: u64) -> Option<&mut TurnState> {
    match state {
        Some(s) if s.turn == turn => {}
        Some(s) if s.turn > turn => {
            debug!(stale = turn, current = s.turn, "ignoring event of older turn");
            return None;
        }
        Some(s) => {
            // A new turn can only start after the previous completed or was
            // barred, so an unfinished older turn here means lost events.
            if !s.is_complete() {
                warn!(
                    previous = s.turn,
                    next = turn,
                    "replacing undelivered turn state"
                );
            }
            *state = Some(TurnState::new(turn));
        }
        None => *state = Some(TurnState::new(turn)),
    }
    state.as_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallSetup;
    use crate::config::ConversationConfig;
    use crate::events::{AudioChunk, ReplyFragment, TranscriptEvent};
    use crate::test_utils::{RecordingSink, SinkOp};
    use tokio::sync::mpsc;

    struct Harness {
        ctx: Arc<CallContext>,
        bus: Arc<EventBus>,
        sink: Arc<RecordingSink>,
        activity: Arc<TurnActivity>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let ctx = Arc::new(CallContext::new(
            CallSetup::default(),
            &ConversationConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(RecordingSink::new());
        let activity = Arc::new(TurnActivity::default());
        let events = bus.channel(&[EventKind::Interrupted, EventKind::TurnDelivered]);
        let cancel = CancellationToken::new();
        let sequencer = StreamSequencer::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            Arc::clone(&sink) as _,
            Arc::clone(&activity),
            SequencerConfig {
                pacing_enabled: false,
                ..SequencerConfig::default()
            },
            cancel.clone(),
        );
        let task = tokio::spawn(sequencer.run());
        Harness {
            ctx,
            bus,
            sink,
            activity,
            events,
            cancel,
            task,
        }
    }

    fn chunk(turn: u64, ordinal: u32, seq: u32, tag: &str, last: bool) -> CallEvent {
        CallEvent::AudioChunk(AudioChunk {
            turn,
            ordinal,
            seq,
            payload: Bytes::from(tag.to_owned()),
            last,
        })
    }

    async fn wait_event(harness: &mut Harness) -> CallEvent {
        tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
            .await
            .expect("event timeout")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn reorders_fragments_completed_out_of_order() {
        let mut harness = start();

        // Fragment 1 finishes synthesis before fragment 0.
        harness.bus.emit(chunk(1, 1, 0, "b0", true));
        harness.bus.emit(chunk(1, 0, 0, "a0", false));
        harness.bus.emit(chunk(1, 0, 1, "a1", true));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 2,
        });

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));
        assert_eq!(harness.sink.audio_payloads(), ["a0", "a1", "b0"]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn reorders_chunks_within_a_fragment() {
        let mut harness = start();

        harness.bus.emit(chunk(1, 0, 1, "a1", true));
        harness.bus.emit(chunk(1, 0, 0, "a0", false));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 1,
        });

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));
        assert_eq!(harness.sink.audio_payloads(), ["a0", "a1"]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn failed_fragment_is_skipped() {
        let mut harness = start();

        harness.bus.emit(chunk(1, 0, 0, "a0", true));
        harness.bus.emit(CallEvent::FragmentFailed { turn: 1, ordinal: 1 });
        harness.bus.emit(chunk(1, 2, 0, "c0", true));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 3,
        });

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));
        assert_eq!(harness.sink.audio_payloads(), ["a0", "c0"]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn barge_in_discards_flushes_and_counts() {
        let mut harness = start();

        // Turn 1: fragment 0 delivered, fragment 1 still buffered and
        // incomplete when the caller starts talking.
        harness.bus.emit(chunk(1, 0, 0, "a0", true));
        harness.sink.wait_for_audio(1).await;
        harness.bus.emit(chunk(1, 1, 0, "b0", false));

        harness
            .bus
            .emit(CallEvent::Utterance(TranscriptEvent::now("wait")));

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::Interrupted { turn: 1 }
        ));
        assert_eq!(harness.ctx.interruption_count(), 1);

        // The straggler chunk of the barred turn is dropped on arrival.
        harness.bus.emit(chunk(1, 1, 1, "b1", true));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 2,
        });

        // A second utterance with nothing in flight changes nothing.
        harness
            .bus
            .emit(CallEvent::Utterance(TranscriptEvent::now("hello?")));

        // Next turn flows normally.
        harness.bus.emit(chunk(2, 0, 0, "n0", true));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 2,
            fragments: 1,
        });
        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 2 }
        ));

        let ops = harness.sink.ops();
        assert_eq!(
            ops,
            [
                SinkOp::Audio("a0".into()),
                SinkOp::Clear,
                SinkOp::Audio("n0".into()),
            ],
            "exactly one clear, nothing of the barred turn after it"
        );
        assert_eq!(harness.ctx.interruption_count(), 1);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn utterance_without_reply_in_flight_is_ignored() {
        let mut harness = start();

        harness
            .bus
            .emit(CallEvent::Utterance(TranscriptEvent::now("hi")));

        // Deliver a turn afterwards to bound the assertion.
        harness.bus.emit(chunk(1, 0, 0, "a0", true));
        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 1,
        });
        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));

        assert_eq!(harness.sink.ops(), [SinkOp::Audio("a0".into())]);
        assert_eq!(harness.ctx.interruption_count(), 0);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn interrupts_generation_before_any_audio_exists() {
        let mut harness = start();

        // Generation announced the turn (fragment event) but synthesis has
        // produced nothing yet.
        harness.activity.active_turn.store(1, Ordering::Release);
        harness.activity.generating.store(true, Ordering::Release);
        harness.bus.emit(CallEvent::ReplyFragment(ReplyFragment {
            turn: 1,
            ordinal: 0,
            text: "pending".into(),
            sentence_end: true,
            function_call: None,
        }));

        harness
            .bus
            .emit(CallEvent::Utterance(TranscriptEvent::now("stop")));

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::Interrupted { turn: 1 }
        ));
        assert!(harness.activity.is_barred(1));
        assert_eq!(harness.sink.ops(), [SinkOp::Clear]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn aborted_reply_completes_after_partial_delivery() {
        let mut harness = start();

        harness.bus.emit(chunk(1, 0, 0, "a0", true));
        // Generation died after emitting one fragment.
        harness.bus.emit(CallEvent::ReplyAborted {
            turn: 1,
            fragments: 1,
        });

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));
        assert_eq!(harness.sink.audio_payloads(), ["a0"]);

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn empty_reply_completes_immediately() {
        let mut harness = start();

        harness.bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 0,
        });

        assert!(matches!(
            wait_event(&mut harness).await,
            CallEvent::TurnDelivered { turn: 1 }
        ));
        assert!(harness.sink.ops().is_empty());

        harness.cancel.cancel();
        let _ = harness.task.await;
    }

    #[tokio::test]
    async fn paced_delivery_stays_ordered() {
        // Pacing on, tiny lead: ordering must hold regardless.
        let ctx = Arc::new(CallContext::new(
            CallSetup::default(),
            &ConversationConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(RecordingSink::new());
        let activity = Arc::new(TurnActivity::default());
        let mut events = bus.channel(&[EventKind::TurnDelivered]);
        let cancel = CancellationToken::new();
        let sequencer = StreamSequencer::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            Arc::clone(&sink) as _,
            Arc::clone(&activity),
            SequencerConfig {
                pacing_enabled: true,
                // 1 kB chunks play out in ~1 ms at this rate.
                bytes_per_second: 1_000_000,
                lead_ms: 0,
            },
            cancel.clone(),
        );
        let task = tokio::spawn(sequencer.run());

        bus.emit(CallEvent::AudioChunk(AudioChunk {
            turn: 1,
            ordinal: 1,
            seq: 0,
            payload: Bytes::from(vec![1u8; 1000]),
            last: true,
        }));
        bus.emit(CallEvent::AudioChunk(AudioChunk {
            turn: 1,
            ordinal: 0,
            seq: 0,
            payload: Bytes::from(vec![0u8; 1000]),
            last: true,
        }));
        bus.emit(CallEvent::ReplyComplete {
            turn: 1,
            fragments: 2,
        });

        let done = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timeout")
            .expect("bus closed");
        assert!(matches!(done, CallEvent::TurnDelivered { turn: 1 }));

        let payloads = sink.audio_payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].as_bytes()[0], 0, "ordinal 0 first");

        cancel.cancel();
        let _ = task.await;
    }
}
