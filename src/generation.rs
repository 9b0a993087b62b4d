//! Final transcripts → streamed reply fragments.
//!
//! The generation channel is the call's only history writer. Each final
//! transcript becomes a user turn and starts a reply turn: the backend's
//! token stream is aggregated into sentence fragments that are emitted the
//! moment their boundary is crossed, which is what bounds time-to-first-audio.
//! Fragment ordinals are assigned here, in generation order; everything
//! downstream reorders by them.
//!
//! Per-turn state machine:
//! idle → awaiting-reply → streaming-reply → (idle | awaiting-function-result)

use crate::call::{CallContext, Turn, TurnActivity};
use crate::events::{CallEvent, EventBus, FunctionInvocation, ReplyFragment, TranscriptEvent};
use crate::functions::FunctionRegistry;
use crate::providers::{GenerationBackend, GeneratorEvent};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Function hops allowed within one reply turn.
const MAX_FUNCTION_HOPS: u32 = 4;

/// How a reply turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyOutcome {
    /// Reply streamed to completion.
    Completed,
    /// Caller barged in; the turn is dead.
    Interrupted,
    /// Backend failed; the turn is abandoned, call stays up.
    Failed,
    /// The agent hung up via the end-call function.
    EndedCall,
    /// The call itself is shutting down.
    Cancelled,
}

/// Accumulates streamed text and cuts it at sentence boundaries.
#[derive(Debug, Default)]
pub(crate) struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    /// Feed a text delta; returns any sentences completed by it.
    pub(crate) fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        while let Some(pos) = find_sentence_boundary(&self.buffer) {
            let sentence = self.buffer[..=pos].trim().to_owned();
            self.buffer = self.buffer[pos + 1..].to_owned();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Take whatever incomplete tail remains.
    pub(crate) fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let tail = tail.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_owned())
        }
    }
}

/// Find a sentence-ending character (`.`, `!`, `?`, `\n`) that is followed
/// by whitespace or end of text, so decimals like "3.5" stay intact.
///
/// Returns the byte index of the boundary character.
pub(crate) fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Drives one call's reply generation.
pub struct GenerationChannel {
    ctx: Arc<CallContext>,
    bus: Arc<EventBus>,
    backend: Arc<dyn GenerationBackend>,
    functions: Arc<FunctionRegistry>,
    activity: Arc<TurnActivity>,
    cancel: CancellationToken,
    // Subscribed at construction so no event can slip past before `run`.
    rx: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

impl GenerationChannel {
    /// Create the channel for one call.
    pub fn new(
        ctx: Arc<CallContext>,
        bus: Arc<EventBus>,
        backend: Arc<dyn GenerationBackend>,
        functions: Arc<FunctionRegistry>,
        activity: Arc<TurnActivity>,
        cancel: CancellationToken,
    ) -> Self {
        let rx = bus.channel(&[
            crate::events::EventKind::TranscriptFinal,
            crate::events::EventKind::Interrupted,
        ]);
        Self {
            ctx,
            bus,
            backend,
            functions,
            activity,
            cancel,
            rx: Some(rx),
        }
    }

    /// Run until the call is cancelled or the agent hangs up.
    pub async fn run(mut self) {
        let mut rx = self.rx.take().expect("generation channel runs once");
        let mut next_turn: u64 = 1;
        let mut pending: VecDeque<TranscriptEvent> = VecDeque::new();

        if !self.ctx.greeting.trim().is_empty() {
            self.speak_greeting(next_turn);
            next_turn += 1;
        }

        loop {
            let transcript = if let Some(queued) = pending.pop_front() {
                queued
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(CallEvent::TranscriptFinal(t)) => t,
                        // A stale interrupt for a turn already over.
                        Some(CallEvent::Interrupted { .. }) => continue,
                        Some(_) => continue,
                        None => return,
                    },
                }
            };

            if transcript.text.trim().is_empty() {
                continue;
            }

            let turn = next_turn;
            next_turn += 1;
            self.ctx.append_turn(Turn::user(transcript.text));
            let outcome = self.run_reply(turn, &mut rx, &mut pending).await;
            debug!(turn, ?outcome, "reply turn finished");

            match outcome {
                ReplyOutcome::EndedCall | ReplyOutcome::Cancelled => return,
                ReplyOutcome::Completed | ReplyOutcome::Interrupted | ReplyOutcome::Failed => {}
            }
        }
    }

    /// Speak the configured greeting as the first reply turn.
    fn speak_greeting(&self, turn: u64) {
        self.activity.active_turn.store(turn, Ordering::Release);
        self.ctx.append_turn(Turn::assistant(self.ctx.greeting.clone()));
        self.bus.emit(CallEvent::ReplyFragment(ReplyFragment {
            turn,
            ordinal: 0,
            text: self.ctx.greeting.clone(),
            sentence_end: true,
            function_call: None,
        }));
        self.bus.emit(CallEvent::ReplyComplete { turn, fragments: 1 });
        info!(turn, "greeting queued");
    }

    /// Generate one reply turn, including any function hops.
    async fn run_reply(
        &self,
        turn: u64,
        rx: &mut mpsc::UnboundedReceiver<CallEvent>,
        pending: &mut VecDeque<TranscriptEvent>,
    ) -> ReplyOutcome {
        self.activity.active_turn.store(turn, Ordering::Release);
        self.activity.generating.store(true, Ordering::Release);

        let mut fragments: u32 = 0;
        let mut hop_spoken: Vec<String> = Vec::new();
        let mut hops: u32 = 0;

        let outcome = 'reply: loop {
            debug!(turn, "awaiting reply stream");
            let history = self.ctx.history_snapshot();
            let specs = self.functions.specs();
            let open = self.backend.stream(&self.ctx.system_instructions, &history, &specs);
            tokio::pin!(open);

            let mut stream = loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break 'reply ReplyOutcome::Cancelled,
                    event = rx.recv() => {
                        match self.absorb_event(event, turn, pending) {
                            Absorbed::Interrupt => break 'reply ReplyOutcome::Interrupted,
                            Absorbed::ChannelClosed => break 'reply ReplyOutcome::Cancelled,
                            Absorbed::Continue => {}
                        }
                    }
                    opened = &mut open => match opened {
                        Ok(stream) => break stream,
                        Err(e) => {
                            error!(turn, "generation backend refused the turn: {e}");
                            break 'reply ReplyOutcome::Failed;
                        }
                    },
                }
            };

            debug!(turn, "streaming reply");
            let mut splitter = SentenceSplitter::default();
            let mut pending_call: Option<FunctionInvocation> = None;

            let hop_end = loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break 'reply ReplyOutcome::Cancelled,
                    event = rx.recv() => {
                        match self.absorb_event(event, turn, pending) {
                            Absorbed::Interrupt => break 'reply ReplyOutcome::Interrupted,
                            Absorbed::ChannelClosed => break 'reply ReplyOutcome::Cancelled,
                            Absorbed::Continue => {}
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(GeneratorEvent::TextDelta { text })) => {
                            for sentence in splitter.push(&text) {
                                self.emit_fragment(turn, &mut fragments, sentence.clone(), true, None);
                                hop_spoken.push(sentence);
                            }
                        }
                        Some(Ok(GeneratorEvent::FunctionCall { name, arguments })) => {
                            pending_call = Some(FunctionInvocation { name, arguments });
                        }
                        Some(Ok(GeneratorEvent::Done)) | None => break HopEnd::StreamDone,
                        Some(Err(e)) => {
                            warn!(turn, "generation stream failed: {e}");
                            break HopEnd::StreamFailed;
                        }
                    },
                }
            };

            if matches!(hop_end, HopEnd::StreamFailed) {
                break 'reply ReplyOutcome::Failed;
            }

            if let Some(tail) = splitter.flush() {
                self.emit_fragment(turn, &mut fragments, tail.clone(), false, None);
                hop_spoken.push(tail);
            }

            let Some(invocation) = pending_call.take() else {
                break 'reply ReplyOutcome::Completed;
            };

            hops += 1;
            if hops > MAX_FUNCTION_HOPS {
                warn!(turn, hops, "function hop limit reached, closing the reply");
                break 'reply ReplyOutcome::Completed;
            }

            debug!(turn, "awaiting function result");
            match self
                .handle_function(turn, &mut fragments, &mut hop_spoken, invocation, rx, pending)
                .await
            {
                FunctionOutcome::Resume => {}
                FunctionOutcome::EndCall => break 'reply ReplyOutcome::EndedCall,
                FunctionOutcome::Interrupted => break 'reply ReplyOutcome::Interrupted,
                FunctionOutcome::Cancelled => break 'reply ReplyOutcome::Cancelled,
            }
        };

        match outcome {
            ReplyOutcome::Completed => {
                if !hop_spoken.is_empty() {
                    self.ctx.append_turn(Turn::assistant(hop_spoken.join(" ")));
                }
                self.bus.emit(CallEvent::ReplyComplete { turn, fragments });
            }
            ReplyOutcome::Failed => {
                // No assistant turn: the caller's next utterance is a fresh
                // turn and already-spoken fragments stand unrecorded.
                self.bus.emit(CallEvent::ReplyAborted { turn, fragments });
            }
            ReplyOutcome::Interrupted => {
                debug!(turn, "reply interrupted, history untouched");
            }
            ReplyOutcome::EndedCall | ReplyOutcome::Cancelled => {}
        }

        self.activity.generating.store(false, Ordering::Release);
        outcome
    }

    /// Announce, execute, and absorb one function call.
    async fn handle_function(
        &self,
        turn: u64,
        fragments: &mut u32,
        hop_spoken: &mut Vec<String>,
        invocation: FunctionInvocation,
        rx: &mut mpsc::UnboundedReceiver<CallEvent>,
        pending: &mut VecDeque<TranscriptEvent>,
    ) -> FunctionOutcome {
        let Some(function) = self.functions.get(&invocation.name) else {
            warn!(turn, function = %invocation.name, "model called an unknown function");
            self.ctx.append_turn(Turn::function(
                invocation.name.clone(),
                "Unknown function.".to_owned(),
            ));
            return FunctionOutcome::Resume;
        };
        let spec = function.spec();

        // Close out text spoken so far, then announce the function.
        if !hop_spoken.is_empty() {
            self.ctx
                .append_turn(Turn::assistant(hop_spoken.join(" ")));
            hop_spoken.clear();
        }
        let ordinal = *fragments;
        self.emit_fragment(
            turn,
            fragments,
            spec.say.clone(),
            true,
            Some(invocation.clone()),
        );
        self.ctx.append_turn(Turn::assistant(spec.say.clone()));
        self.bus.emit(CallEvent::FunctionCall {
            turn,
            ordinal,
            invocation: invocation.clone(),
        });
        info!(turn, function = %invocation.name, "executing call function");

        if !function.resumes_generation() {
            // Hanging up: the turn's fragments are known now, so delivery can
            // finish while the function (and its goodbye grace) runs.
            self.bus.emit(CallEvent::ReplyComplete {
                turn,
                fragments: *fragments,
            });
            match self
                .execute_interruptible(turn, &function, invocation.arguments, rx, pending)
                .await
            {
                ExecuteEnd::Result(result) => {
                    let reason = match result {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(turn, "end-call function failed: {e}");
                            "hangup requested".to_owned()
                        }
                    };
                    self.bus.emit(CallEvent::EndCall { reason });
                    FunctionOutcome::EndCall
                }
                ExecuteEnd::Interrupted => FunctionOutcome::Interrupted,
                ExecuteEnd::Cancelled => FunctionOutcome::Cancelled,
            }
        } else {
            match self
                .execute_interruptible(turn, &function, invocation.arguments.clone(), rx, pending)
                .await
            {
                ExecuteEnd::Result(result) => {
                    let text = match result {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(turn, function = %invocation.name, "function failed: {e}");
                            format!("The function failed: {e}")
                        }
                    };
                    self.ctx
                        .append_turn(Turn::function(invocation.name, text));
                    FunctionOutcome::Resume
                }
                ExecuteEnd::Interrupted => FunctionOutcome::Interrupted,
                ExecuteEnd::Cancelled => FunctionOutcome::Cancelled,
            }
        }
    }

    /// Await a function result, still honoring barge-in: an interrupt while
    /// the result is pending abandons it and returns the turn to idle.
    async fn execute_interruptible(
        &self,
        turn: u64,
        function: &Arc<dyn crate::functions::CallFunction>,
        arguments: serde_json::Value,
        rx: &mut mpsc::UnboundedReceiver<CallEvent>,
        pending: &mut VecDeque<TranscriptEvent>,
    ) -> ExecuteEnd {
        let execute = function.execute(&self.ctx, arguments);
        tokio::pin!(execute);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return ExecuteEnd::Cancelled,
                event = rx.recv() => {
                    match self.absorb_event(event, turn, pending) {
                        Absorbed::Interrupt => return ExecuteEnd::Interrupted,
                        Absorbed::ChannelClosed => return ExecuteEnd::Cancelled,
                        Absorbed::Continue => {}
                    }
                }
                result = &mut execute => return ExecuteEnd::Result(result),
            }
        }
    }

    /// Classify a bus event received while a reply turn is active.
    fn absorb_event(
        &self,
        event: Option<CallEvent>,
        turn: u64,
        pending: &mut VecDeque<TranscriptEvent>,
    ) -> Absorbed {
        match event {
            Some(CallEvent::Interrupted { turn: barred }) if barred >= turn => Absorbed::Interrupt,
            Some(CallEvent::Interrupted { .. }) => Absorbed::Continue,
            Some(CallEvent::TranscriptFinal(t)) => {
                // The caller spoke during generation; the barge-in path will
                // have killed this turn already (or is about to). Keep the
                // transcript so the next turn starts from it.
                pending.push_back(t);
                Absorbed::Continue
            }
            Some(_) => Absorbed::Continue,
            None => Absorbed::ChannelClosed,
        }
    }

    fn emit_fragment(
        &self,
        turn: u64,
        fragments: &mut u32,
        text: String,
        sentence_end: bool,
        function_call: Option<FunctionInvocation>,
    ) {
        let ordinal = *fragments;
        *fragments += 1;
        self.bus.emit(CallEvent::ReplyFragment(ReplyFragment {
            turn,
            ordinal,
            text,
            sentence_end,
            function_call,
        }));
    }
}

enum HopEnd {
    StreamDone,
    StreamFailed,
}

enum Absorbed {
    Interrupt,
    ChannelClosed,
    Continue,
}

enum FunctionOutcome {
    Resume,
    EndCall,
    Interrupted,
    Cancelled,
}

enum ExecuteEnd {
    Result(crate::error::Result<String>),
    Interrupted,
    Cancelled,
}
