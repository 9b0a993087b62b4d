//! Per-call shared state.
//!
//! One [`CallContext`] exists per active call and is shared read-mostly by
//! every channel. The conversation history has a single writer (the
//! generation channel); everyone else reads snapshots. Counters and flags
//! are atomics so no channel ever blocks another on context access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The human caller.
    User,
    /// The agent.
    Assistant,
    /// A call function result re-entering the conversation.
    Function,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker role.
    pub role: TurnRole,
    /// Turn text.
    pub content: String,
    /// Name of the function that produced this turn (function turns only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Wall-clock append time. History is ordered by this.
    pub appended_at: DateTime<Utc>,
}

impl Turn {
    /// A caller turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            function: None,
            appended_at: Utc::now(),
        }
    }

    /// An agent turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            function: None,
            appended_at: Utc::now(),
        }
    }

    /// A function-result turn.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Function,
            content: content.into(),
            function: Some(name.into()),
            appended_at: Utc::now(),
        }
    }
}

/// Identity of one call, fixed at setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallSetup {
    /// Transport-assigned call identifier.
    pub call_id: String,
    /// Caller number (E.164 or transport-native).
    pub caller_number: String,
    /// Number the caller dialed.
    pub callee_number: String,
    /// Override for the configured system instructions. Empty keeps them.
    pub system_instructions: String,
    /// Override for the configured greeting. Empty keeps it.
    pub greeting: String,
}

/// Shared per-call state.
///
/// Owned by the call's pipeline; dropped when the call ends.
pub struct CallContext {
    /// Transport-assigned call identifier.
    pub call_id: String,
    /// Caller number.
    pub caller_number: String,
    /// Number the caller dialed.
    pub callee_number: String,
    /// System instructions for the generation backend.
    pub system_instructions: String,
    /// Greeting spoken at call start.
    pub greeting: String,
    /// Whether the call is being recorded.
    pub recording_enabled: bool,
    history: Mutex<Vec<Turn>>,
    interruptions: AtomicU32,
    ended: AtomicBool,
}

impl CallContext {
    /// Build the context for a new call, applying per-call overrides on top
    /// of the agent defaults.
    pub fn new(setup: CallSetup, conversation: &crate::config::ConversationConfig) -> Self {
        let system_instructions = if setup.system_instructions.trim().is_empty() {
            conversation.system_instructions.clone()
        } else {
            setup.system_instructions
        };
        let greeting = if setup.greeting.trim().is_empty() {
            conversation.greeting.clone()
        } else {
            setup.greeting
        };
        let call_id = if setup.call_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            setup.call_id
        };

        Self {
            call_id,
            caller_number: setup.caller_number,
            callee_number: setup.callee_number,
            system_instructions,
            greeting,
            recording_enabled: conversation.recording_enabled,
            history: Mutex::new(Vec::new()),
            interruptions: AtomicU32::new(0),
            ended: AtomicBool::new(false),
        }
    }

    /// Append a turn to the conversation history.
    ///
    /// Single-writer discipline: only the generation channel calls this.
    pub fn append_turn(&self, turn: Turn) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push(turn);
    }

    /// A point-in-time copy of the conversation history.
    pub fn history_snapshot(&self) -> Vec<Turn> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of turns appended so far.
    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Record one barge-in.
    pub fn record_interruption(&self) -> u32 {
        self.interruptions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// How many times the caller has interrupted the agent.
    pub fn interruption_count(&self) -> u32 {
        self.interruptions.load(Ordering::Relaxed)
    }

    /// Mark the call as ended.
    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Relaxed);
    }

    /// Whether the call has ended.
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("call_id", &self.call_id)
            .field("caller_number", &self.caller_number)
            .field("turns", &self.history_len())
            .field("interruptions", &self.interruption_count())
            .field("ended", &self.has_ended())
            .finish()
    }
}

/// Cross-channel turn activity, shared as atomics.
///
/// The generation channel writes `generating` and `active_turn`; the
/// sequencer writes `speaking` and `barred_turn`. Everyone else only reads.
/// Turn ids start at 1 so 0 can mean "none".
#[derive(Debug, Default)]
pub struct TurnActivity {
    /// A reply is being generated or synthesized.
    pub generating: AtomicBool,
    /// Reply audio is being delivered to the transport.
    pub speaking: AtomicBool,
    /// Turn id of the reply currently in flight (0 = none).
    pub active_turn: AtomicU64,
    /// Highest interrupted turn id; chunks at or below it are stale.
    pub barred_turn: AtomicU64,
}

impl TurnActivity {
    /// Whether any reply work is in flight (generating, buffered, or
    /// mid-delivery).
    pub fn reply_in_flight(&self) -> bool {
        self.generating.load(Ordering::Relaxed) || self.speaking.load(Ordering::Relaxed)
    }

    /// Whether the given turn has been interrupted.
    pub fn is_barred(&self, turn: u64) -> bool {
        turn <= self.barred_turn.load(Ordering::Acquire)
    }

    /// Bar a turn and everything before it.
    pub fn bar_up_to(&self, turn: u64) {
        self.barred_turn.fetch_max(turn, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversationConfig;

    fn context() -> CallContext {
        CallContext::new(
            CallSetup {
                call_id: "CA123".into(),
                caller_number: "+15550100".into(),
                callee_number: "+15550199".into(),
                ..CallSetup::default()
            },
            &ConversationConfig::default(),
        )
    }

    #[test]
    fn history_preserves_append_order() {
        let ctx = context();
        ctx.append_turn(Turn::user("hello"));
        ctx.append_turn(Turn::assistant("hi there"));
        ctx.append_turn(Turn::function("transfer-call", "Call transferred."));

        let history = ctx.history_snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[1].role, TurnRole::Assistant);
        assert_eq!(history[2].function.as_deref(), Some("transfer-call"));
        assert!(history[0].appended_at <= history[1].appended_at);
        assert!(history[1].appended_at <= history[2].appended_at);
    }

    #[test]
    fn snapshot_is_detached() {
        let ctx = context();
        ctx.append_turn(Turn::user("hello"));
        let snapshot = ctx.history_snapshot();
        ctx.append_turn(Turn::assistant("hi"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(ctx.history_len(), 2);
    }

    #[test]
    fn interruption_counter() {
        let ctx = context();
        assert_eq!(ctx.interruption_count(), 0);
        assert_eq!(ctx.record_interruption(), 1);
        assert_eq!(ctx.record_interruption(), 2);
        assert_eq!(ctx.interruption_count(), 2);
    }

    #[test]
    fn setup_overrides_win() {
        let ctx = CallContext::new(
            CallSetup {
                greeting: "Custom greeting.".into(),
                system_instructions: "Be terse.".into(),
                ..CallSetup::default()
            },
            &ConversationConfig::default(),
        );
        assert_eq!(ctx.greeting, "Custom greeting.");
        assert_eq!(ctx.system_instructions, "Be terse.");
        assert!(!ctx.call_id.is_empty(), "call id is generated when absent");
    }

    #[test]
    fn turn_barring() {
        let activity = TurnActivity::default();
        assert!(!activity.is_barred(1));
        activity.bar_up_to(3);
        assert!(activity.is_barred(2));
        assert!(activity.is_barred(3));
        assert!(!activity.is_barred(4));
        // Barring never moves backwards.
        activity.bar_up_to(1);
        assert!(activity.is_barred(3));
    }
}
