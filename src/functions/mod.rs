//! Call functions the generation backend may invoke mid-reply.
//!
//! Each function carries a JSON-schema spec handed to the backend and a
//! spoken announce phrase emitted before execution, so the caller hears
//! something while the function runs. Results re-enter the conversation
//! history as function turns.

use crate::call::CallContext;
use crate::config::FunctionConfig;
use crate::error::{CallError, Result};
use crate::providers::CallControl;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name of the hangup function.
pub const END_CALL: &str = "end-call";
/// Name of the transfer function.
pub const TRANSFER_CALL: &str = "transfer-call";

/// What a function looks like to the generation backend.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    /// Function name.
    pub name: String,
    /// What the function does, for the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
    /// Phrase spoken to the caller when the function is invoked.
    pub say: String,
}

/// A function the agent can execute during a call.
#[async_trait]
pub trait CallFunction: Send + Sync {
    /// The spec advertised to the generation backend.
    fn spec(&self) -> FunctionSpec;

    /// Whether generation resumes with the result after execution.
    /// Hanging up does not resume; everything else does.
    fn resumes_generation(&self) -> bool {
        true
    }

    /// Execute the function. The returned text re-enters the conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying collaborator rejects the request.
    async fn execute(&self, ctx: &CallContext, arguments: serde_json::Value) -> Result<String>;
}

/// Registry of functions available to one call.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn CallFunction>>,
    order: Vec<String>,
}

impl FunctionRegistry {
    /// An empty registry (no functions advertised).
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in registry: hangup and transfer wired to the given
    /// telephony control collaborator.
    pub fn builtin(control: Arc<dyn CallControl>, config: &FunctionConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EndCallFunction {
            control: Arc::clone(&control),
            grace: Duration::from_millis(config.end_call_grace_ms),
        }));
        registry.register(Arc::new(TransferCallFunction {
            control,
            grace: Duration::from_millis(config.transfer_grace_ms),
            default_target: config.default_transfer_target.clone(),
        }));
        registry
    }

    /// Register a function. A later registration under the same name wins.
    pub fn register(&mut self, function: Arc<dyn CallFunction>) {
        let name = function.spec().name;
        if self.functions.insert(name.clone(), function).is_none() {
            self.order.push(name);
        }
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CallFunction>> {
        self.functions.get(name).cloned()
    }

    /// Specs of all registered functions, in registration order.
    pub fn specs(&self) -> Vec<FunctionSpec> {
        self.order
            .iter()
            .filter_map(|name| self.functions.get(name))
            .map(|f| f.spec())
            .collect()
    }

    /// Whether any functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.order)
            .finish()
    }
}

/// Hang up the call once the goodbye has had time to play out.
struct EndCallFunction {
    control: Arc<dyn CallControl>,
    grace: Duration,
}

#[async_trait]
impl CallFunction for EndCallFunction {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: END_CALL.to_owned(),
            description: "End the call when the conversation has reached a natural close or \
                          the caller asks to hang up."
                .to_owned(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" }
                },
                "required": []
            }),
            say: "Thank you for calling. Goodbye!".to_owned(),
        }
    }

    fn resumes_generation(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext, arguments: serde_json::Value) -> Result<String> {
        let reason = arguments
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("conversation complete");

        // Let the goodbye reach the caller before the leg drops.
        tokio::time::sleep(self.grace).await;

        let status = self.control.end_call(&ctx.call_id, reason).await?;
        info!(call_id = %ctx.call_id, reason, "call ended");
        Ok(format!("Call ended. {status}"))
    }
}

/// Transfer the call to a human.
struct TransferCallFunction {
    control: Arc<dyn CallControl>,
    grace: Duration,
    default_target: String,
}

#[async_trait]
impl CallFunction for TransferCallFunction {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: TRANSFER_CALL.to_owned(),
            description: "Transfer the caller to a human agent when they ask for one or the \
                          request is beyond what you can handle."
                .to_owned(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "target_number": { "type": "string" }
                },
                "required": []
            }),
            say: "One moment while I transfer your call.".to_owned(),
        }
    }

    async fn execute(&self, ctx: &CallContext, arguments: serde_json::Value) -> Result<String> {
        let target = arguments
            .get("target_number")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.default_target)
            .to_owned();
        if target.trim().is_empty() {
            return Err(CallError::Function(
                "no transfer target configured".to_owned(),
            ));
        }

        tokio::time::sleep(self.grace).await;

        let status = self.control.transfer_call(&ctx.call_id, &target).await?;
        info!(call_id = %ctx.call_id, target = %target, "call transferred");
        Ok(format!("Call transferred. {status}"))
    }
}
