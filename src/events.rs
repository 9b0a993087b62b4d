//! Typed event bus connecting the per-call channels.
//!
//! Every cross-channel signal in a call travels as a [`CallEvent`] through
//! the [`EventBus`]. Emission is fire-and-forget: current subscribers get the
//! event in subscription order, a failing subscriber never blocks the rest,
//! and events emitted while nobody is subscribed are gone. This is live
//! conversation, not a replay log.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// A transcript hypothesis or settled result.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// Transcribed text.
    pub text: String,
    /// When the event was produced.
    pub at: DateTime<Utc>,
}

impl TranscriptEvent {
    /// Build a transcript event stamped now.
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// A function call surfaced by the generation backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInvocation {
    /// Function name.
    pub name: String,
    /// Parsed arguments.
    pub arguments: serde_json::Value,
}

/// A sentence-level unit of generated reply text; the unit of synthesis
/// and of delivery ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFragment {
    /// Reply turn this fragment belongs to.
    pub turn: u64,
    /// Position within the turn, assigned at generation time. Synthesis
    /// completion order is unrelated; delivery is ordered by this.
    pub ordinal: u32,
    /// Fragment text.
    pub text: String,
    /// Whether the text ends at a sentence boundary (false for a flushed
    /// remainder at stream end).
    pub sentence_end: bool,
    /// Function call announced by this fragment, if any.
    pub function_call: Option<FunctionInvocation>,
}

/// One chunk of synthesized reply audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Reply turn, inherited from the fragment.
    pub turn: u64,
    /// Fragment ordinal, inherited from the fragment.
    pub ordinal: u32,
    /// Chunk position within the fragment, contiguous from 0.
    pub seq: u32,
    /// Raw audio payload in the configured transport format.
    pub payload: Bytes,
    /// Whether this is the fragment's last chunk.
    pub last: bool,
}

/// Everything that can happen during a call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Caller speech detected. Fires at onset, before any text settles;
    /// this is the barge-in trigger.
    Utterance(TranscriptEvent),
    /// Improving transcript hypothesis. Never stored in history.
    TranscriptPartial(TranscriptEvent),
    /// Settled transcript for one utterance. Exactly one per utterance.
    TranscriptFinal(TranscriptEvent),
    /// A reply fragment crossed its sentence boundary.
    ReplyFragment(ReplyFragment),
    /// The generation backend requested a function call.
    FunctionCall {
        /// Reply turn the call belongs to.
        turn: u64,
        /// Ordinal of the announce fragment.
        ordinal: u32,
        /// The call itself.
        invocation: FunctionInvocation,
    },
    /// A reply finished generating; `fragments` is the total fragment count.
    ReplyComplete {
        /// The finished turn.
        turn: u64,
        /// Fragments emitted for it.
        fragments: u32,
    },
    /// A reply was cut short by a backend failure. Fragments up to
    /// `fragments` were already emitted and may still be delivered.
    ReplyAborted {
        /// The aborted turn.
        turn: u64,
        /// Fragments emitted before the abort.
        fragments: u32,
    },
    /// Synthesized audio for one fragment chunk.
    AudioChunk(AudioChunk),
    /// A fragment's synthesis failed; no further chunks will come for it.
    FragmentFailed {
        /// Turn of the failed fragment.
        turn: u64,
        /// Ordinal of the failed fragment.
        ordinal: u32,
    },
    /// A chunk was handed to the outbound transport.
    AudioDelivered {
        /// Turn of the delivered chunk.
        turn: u64,
        /// Fragment ordinal.
        ordinal: u32,
        /// Chunk sequence within the fragment.
        seq: u32,
    },
    /// The caller barged in; the named turn is dead. Generation and
    /// synthesis reset their turn state on this.
    Interrupted {
        /// The interrupted turn (0 when nothing had started delivering).
        turn: u64,
    },
    /// Every chunk of the turn was delivered.
    TurnDelivered {
        /// The fully delivered turn.
        turn: u64,
    },
    /// The agent decided to hang up.
    EndCall {
        /// Reason passed to the telephony collaborator.
        reason: String,
    },
}

/// Discriminant for [`CallEvent`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`CallEvent::Utterance`]
    Utterance,
    /// [`CallEvent::TranscriptPartial`]
    TranscriptPartial,
    /// [`CallEvent::TranscriptFinal`]
    TranscriptFinal,
    /// [`CallEvent::ReplyFragment`]
    ReplyFragment,
    /// [`CallEvent::FunctionCall`]
    FunctionCall,
    /// [`CallEvent::ReplyComplete`]
    ReplyComplete,
    /// [`CallEvent::ReplyAborted`]
    ReplyAborted,
    /// [`CallEvent::AudioChunk`]
    AudioChunk,
    /// [`CallEvent::FragmentFailed`]
    FragmentFailed,
    /// [`CallEvent::AudioDelivered`]
    AudioDelivered,
    /// [`CallEvent::Interrupted`]
    Interrupted,
    /// [`CallEvent::TurnDelivered`]
    TurnDelivered,
    /// [`CallEvent::EndCall`]
    EndCall,
}

impl CallEvent {
    /// The discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Utterance(_) => EventKind::Utterance,
            Self::TranscriptPartial(_) => EventKind::TranscriptPartial,
            Self::TranscriptFinal(_) => EventKind::TranscriptFinal,
            Self::ReplyFragment(_) => EventKind::ReplyFragment,
            Self::FunctionCall { .. } => EventKind::FunctionCall,
            Self::ReplyComplete { .. } => EventKind::ReplyComplete,
            Self::ReplyAborted { .. } => EventKind::ReplyAborted,
            Self::AudioChunk(_) => EventKind::AudioChunk,
            Self::FragmentFailed { .. } => EventKind::FragmentFailed,
            Self::AudioDelivered { .. } => EventKind::AudioDelivered,
            Self::Interrupted { .. } => EventKind::Interrupted,
            Self::TurnDelivered { .. } => EventKind::TurnDelivered,
            Self::EndCall { .. } => EventKind::EndCall,
        }
    }
}

type Handler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

struct Subscriber {
    /// `None` subscribes to every kind (observer tap).
    filter: Option<EventKind>,
    handler: Handler,
}

/// Typed publish/subscribe hub for one call.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event kind.
    ///
    /// Handlers run synchronously on the emitting task, in subscription
    /// order. A panicking handler is reported and skipped; delivery to the
    /// remaining subscribers continues.
    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&CallEvent) + Send + Sync + 'static) {
        self.push(Some(kind), Arc::new(handler));
    }

    /// Subscribe a handler to every event kind. Observer tap; read-only by
    /// convention, never a control path.
    pub fn subscribe_all(&self, handler: impl Fn(&CallEvent) + Send + Sync + 'static) {
        self.push(None, Arc::new(handler));
    }

    fn push(&self, filter: Option<EventKind>, handler: Handler) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.push(Arc::new(Subscriber { filter, handler }));
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: CallEvent) {
        let kind = event.kind();
        // Snapshot outside the handler calls so a handler that emits (or
        // subscribes) can't deadlock the bus.
        let matching: Vec<Arc<Subscriber>> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(kind))
                .cloned()
                .collect()
        };

        trace!(?kind, subscribers = matching.len(), "emit");
        for subscriber in matching {
            let handler = Arc::clone(&subscriber.handler);
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(?kind, "event handler panicked; continuing delivery");
            }
        }
    }

    /// Subscribe the given kinds into a channel, the form the channel tasks
    /// consume. Events arriving after the receiver is dropped are discarded.
    pub fn channel(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for &kind in kinds {
            let tx = tx.clone();
            self.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len();
        f.debug_struct("EventBus")
            .field("subscribers", &count)
            .finish()
    }
}

/// Attach a logging observer that mirrors the call's event flow into
/// `tracing`. Display-only; never a control path.
pub fn attach_log_observer(bus: &EventBus, call_id: &str) {
    let call_id = call_id.to_owned();
    bus.subscribe_all(move |event| match event {
        CallEvent::Utterance(_) => trace!(%call_id, "caller speech onset"),
        CallEvent::TranscriptPartial(t) => trace!(%call_id, text = %t.text, "partial transcript"),
        CallEvent::TranscriptFinal(t) => {
            tracing::info!(%call_id, text = %t.text, "final transcript");
        }
        CallEvent::ReplyFragment(f) => {
            tracing::debug!(%call_id, turn = f.turn, ordinal = f.ordinal, text = %f.text, "reply fragment");
        }
        CallEvent::FunctionCall { invocation, .. } => {
            tracing::info!(%call_id, function = %invocation.name, "function call");
        }
        CallEvent::ReplyComplete { turn, fragments } => {
            tracing::debug!(%call_id, turn, fragments, "reply complete");
        }
        CallEvent::ReplyAborted { turn, .. } => {
            tracing::warn!(%call_id, turn, "reply aborted");
        }
        CallEvent::AudioChunk(c) => {
            trace!(%call_id, turn = c.turn, ordinal = c.ordinal, seq = c.seq, "audio chunk");
        }
        CallEvent::FragmentFailed { turn, ordinal } => {
            tracing::warn!(%call_id, turn, ordinal, "fragment synthesis failed");
        }
        CallEvent::AudioDelivered { turn, ordinal, seq } => {
            trace!(%call_id, turn, ordinal, seq, "audio delivered");
        }
        CallEvent::Interrupted { turn } => {
            tracing::info!(%call_id, turn, "caller barge-in");
        }
        CallEvent::TurnDelivered { turn } => {
            tracing::debug!(%call_id, turn, "turn fully delivered");
        }
        CallEvent::EndCall { reason } => {
            tracing::info!(%call_id, reason = %reason, "agent requested hangup");
        }
    });
}
