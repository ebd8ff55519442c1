//! Tool Dispatcher (§4.4).
//!
//! Routes parsed tool calls to registered [`Tool`] implementations and
//! serializes their results back into the conversation as tool-role
//! messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::parser::ParsedToolCall;
use crate::task::Message;

/// A function the agent can invoke. Individual tools own their own
/// argument parsing from `content`; the dispatcher treats it opaquely.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name; must match the `id` under which it's registered.
    fn name(&self) -> &str;

    /// Executes the tool and returns the result text, or an error message.
    /// `attributes` always contains the injected `__task_id` key in
    /// addition to whatever the assistant supplied. `cancel` is the
    /// driving task's cancellation token (§9 "Tool registry shape": `execute(ctx,
    /// call) -> (string, error)`); a tool that performs I/O should race it
    /// against `cancel.cancelled()` the same way the LLM Invoker does.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        attributes: &HashMap<String, String>,
        content: &str,
    ) -> Result<String, String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}

#[derive(Serialize)]
struct ToolResultEnvelope<'a> {
    tool_name: &'a str,
    arguments: &'a str,
    result: Option<&'a str>,
    error: Option<&'a str>,
}

/// Dispatches every parsed tool call from one assistant turn, producing the
/// tool-role reply messages to append to the task.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Dispatches a single call. `task_id` is injected into the call's
    /// attributes as `__task_id` before invocation (§4.4 step 2). `cancel`
    /// is threaded straight through to `Tool::execute` so a tool invocation
    /// is a cancellable suspension point (§5 "Inside a tool invocation").
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        call: &ParsedToolCall,
    ) -> Message {
        let mut attributes = call.attributes.clone();
        attributes.insert("__task_id".to_string(), task_id.to_string());

        let (result, error) = match self.registry.get(&call.name) {
            None => {
                tracing::warn!(tool = %call.name, "tool not found");
                (None, Some(format!("Error: Tool '{}' not found.", call.name)))
            }
            Some(tool) => match tool.execute(cancel, &attributes, &call.content).await {
                Ok(text) => (Some(text), None),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                    (None, Some(e))
                }
            },
        };

        let envelope = ToolResultEnvelope {
            tool_name: &call.name,
            arguments: &call.content,
            result: result.as_deref(),
            error: error.as_deref(),
        };
        let body = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
        Message::tool_reply(call.id.clone(), body)
    }

    /// Dispatches every call from one assistant turn, preserving order.
    pub async fn dispatch_all(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
        calls: &[ParsedToolCall],
    ) -> Vec<Message> {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            out.push(self.dispatch(cancel, task_id, call).await);
        }
        out
    }
}

/// Convenience for tools that want their `content` as JSON.
pub fn parse_json_content(content: &str) -> Result<Value, String> {
    serde_json::from_str(content).map_err(|e| format!("invalid JSON arguments: {e}"))
}
