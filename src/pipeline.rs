//! Per-call orchestrator that wires the channels together.
//!
//! One [`CallPipeline`] per active call. Construction picks the backends;
//! `run` spawns one task per channel and owns teardown: the pipeline ends
//! when the inbound audio source ends (caller hangup), when the agent hangs
//! up via the end-call function, or when [`CallPipeline::shutdown`] fires.
//! Teardown cancels every channel; in-flight backend requests are abandoned,
//! not awaited. Nothing is shared between calls, so nothing here can stall
//! another call.

use crate::call::{CallContext, CallSetup, TurnActivity};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::events::{CallEvent, EventBus, EventKind, attach_log_observer};
use crate::functions::FunctionRegistry;
use crate::generation::GenerationChannel;
use crate::providers::{
    AudioFrame, CallControl, GenerationBackend, MediaSink, SynthesisBackend, TranscriptionBackend,
    build_generation_backend, build_synthesis_backend, build_transcription_backend,
};
use crate::sequencer::StreamSequencer;
use crate::synthesis::SynthesisChannel;
use crate::transcription::TranscriptionChannel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Orchestrates one full-duplex call.
pub struct CallPipeline {
    config: AgentConfig,
    ctx: Arc<CallContext>,
    bus: Arc<EventBus>,
    activity: Arc<TurnActivity>,
    cancel: CancellationToken,
    transcription: Arc<dyn TranscriptionBackend>,
    generation: Arc<dyn GenerationBackend>,
    synthesis: Arc<dyn SynthesisBackend>,
    sink: Arc<dyn MediaSink>,
    functions: Arc<FunctionRegistry>,
}

impl CallPipeline {
    /// Build a pipeline with backends selected from configuration and the
    /// built-in call functions wired to `control`.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured provider cannot be constructed.
    pub fn from_config(
        config: AgentConfig,
        setup: CallSetup,
        sink: Arc<dyn MediaSink>,
        control: Arc<dyn CallControl>,
    ) -> Result<Self> {
        let transcription = build_transcription_backend(&config.transcription)?;
        let generation = build_generation_backend(&config.generation)?;
        let synthesis = build_synthesis_backend(&config.synthesis)?;
        let functions = Arc::new(FunctionRegistry::builtin(control, &config.functions));
        Ok(Self::with_backends(
            config,
            setup,
            transcription,
            generation,
            synthesis,
            sink,
            functions,
        ))
    }

    /// Build a pipeline around explicit backend instances.
    #[allow(clippy::too_many_arguments)]
    pub fn with_backends(
        config: AgentConfig,
        setup: CallSetup,
        transcription: Arc<dyn TranscriptionBackend>,
        generation: Arc<dyn GenerationBackend>,
        synthesis: Arc<dyn SynthesisBackend>,
        sink: Arc<dyn MediaSink>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        let ctx = Arc::new(CallContext::new(setup, &config.conversation));
        Self {
            config,
            ctx,
            bus: Arc::new(EventBus::new()),
            activity: Arc::new(TurnActivity::default()),
            cancel: CancellationToken::new(),
            transcription,
            generation,
            synthesis,
            sink,
            functions,
        }
    }

    /// The call's event bus, for read-only observers.
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// The call's shared context.
    pub fn context(&self) -> Arc<CallContext> {
        Arc::clone(&self.ctx)
    }

    /// Token that ends the call when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request teardown of the call.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the call until hangup.
    ///
    /// `frames` is the inbound caller audio from the telephony transport;
    /// its end means the caller hung up.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the signature leaves room for setup
    /// failures surfaced at run time.
    pub async fn run(self, frames: mpsc::Receiver<AudioFrame>) -> Result<()> {
        info!(call_id = %self.ctx.call_id, caller = %self.ctx.caller_number, "call starting");
        attach_log_observer(&self.bus, &self.ctx.call_id);

        let mut hangup_rx = self.bus.channel(&[EventKind::EndCall]);

        // Construct every channel before spawning any: construction is where
        // bus subscriptions happen, and the first events (the greeting) must
        // not race them.
        let transcription = TranscriptionChannel::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.transcription),
            self.cancel.clone(),
        );
        let generation = GenerationChannel::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.bus),
            Arc::clone(&self.generation),
            Arc::clone(&self.functions),
            Arc::clone(&self.activity),
            self.cancel.clone(),
        );
        let synthesis = SynthesisChannel::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.synthesis),
            Arc::clone(&self.activity),
            self.cancel.clone(),
            self.config.synthesis.max_concurrent,
        );
        let sequencer = StreamSequencer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.bus),
            Arc::clone(&self.sink),
            Arc::clone(&self.activity),
            self.config.sequencer.clone(),
            self.cancel.clone(),
        );

        let mut transcription_handle = tokio::spawn(transcription.run(frames));
        let generation_handle = tokio::spawn(generation.run());
        let synthesis_handle = tokio::spawn(synthesis.run());
        let sequencer_handle = tokio::spawn(sequencer.run());

        let source_ended = tokio::select! {
            () = self.cancel.cancelled() => {
                info!(call_id = %self.ctx.call_id, "call shutdown requested");
                false
            }
            _ = &mut transcription_handle => {
                info!(call_id = %self.ctx.call_id, "inbound audio ended");
                true
            }
            event = hangup_rx.recv() => {
                if let Some(CallEvent::EndCall { reason }) = event {
                    info!(call_id = %self.ctx.call_id, reason = %reason, "agent ended the call");
                }
                false
            }
        };

        self.ctx.mark_ended();
        self.cancel.cancel();

        if !source_ended {
            let _ = transcription_handle.await;
        }
        let _ = tokio::join!(generation_handle, synthesis_handle, sequencer_handle);

        info!(
            call_id = %self.ctx.call_id,
            turns = self.ctx.history_len(),
            interruptions = self.ctx.interruption_count(),
            "call finished"
        );
        Ok(())
    }
}
