//! Switchboard: real-time, interruptible voice-call AI agent orchestration.
//!
//! One [`CallPipeline`] per phone call turns three pluggable streaming
//! backends into a coherent conversation:
//!
//! Inbound audio → transcription → generation → synthesis → sequencer →
//! outbound transport
//!
//! # Architecture
//!
//! The channels run as independent tasks connected only by a typed
//! [`events::EventBus`]; the conversation history has a single writer and
//! everything else reads snapshots. Reply fragments carry generation-order
//! ordinals so the sequencer can deliver audio strictly in order even while
//! fragments synthesize concurrently — and discard it all, with one `clear`
//! to the transport, the instant the caller barges in.
//!
//! The telephony transport, request front end, and UI live outside this
//! crate; they connect through the traits in [`providers`] (inbound frames,
//! [`providers::MediaSink`], [`providers::CallControl`]) and may observe
//! everything via the bus.

pub mod call;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod functions;
pub mod generation;
pub mod pipeline;
pub mod providers;
pub mod sequencer;
pub mod synthesis;
pub mod test_utils;
pub mod transcription;

pub use call::{CallContext, CallSetup, Turn, TurnRole};
pub use config::AgentConfig;
pub use error::{CallError, Result};
pub use events::{CallEvent, EventBus, EventKind};
pub use pipeline::CallPipeline;
pub use providers::{AudioFrame, CallControl, MediaSink};
