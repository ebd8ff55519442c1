//! Task Executor (§4.2): the per-task driver loop. Owns the resume-channel
//! table and drives a task through the state machine one LLM round-trip at
//! a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::llm::LlmInvoker;
use crate::prompt::PromptBuilder;
use crate::stream::StreamingWriter;
use crate::task::{Message, Role, Task, TaskState};
use crate::tools::Dispatcher;
use crate::store::TaskStore;

const ASK_FOLLOWUP_QUESTION: &str = "ask_followup_question";
const INPUT_REQUIRED_SENTINEL: &str = "[INPUT_REQUIRED]";
const NEW_TASK_SENTINEL: &str = "__NEW_TASK_REQUEST__";

#[derive(Serialize)]
struct StateEventPayload<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct NewSubTaskInfo<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    parent: &'a str,
    new_id: &'a str,
    new_name: &'a str,
}

#[derive(Deserialize)]
struct NewTaskRequest {
    name: String,
    system_prompt: String,
    #[allow(dead_code)]
    description: String,
    #[serde(default)]
    parent_task_id: Option<String>,
}

enum WaitOutcome {
    Resumed,
    Cancelled,
}

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    prompt_builder: Arc<PromptBuilder>,
    llm: Arc<dyn LlmInvoker>,
    dispatcher: Arc<Dispatcher>,
    resume_channels: Mutex<HashMap<String, mpsc::Sender<()>>>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        prompt_builder: Arc<PromptBuilder>,
        llm: Arc<dyn LlmInvoker>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            prompt_builder,
            llm,
            dispatcher,
            resume_channels: Mutex::new(HashMap::new()),
        }
    }

    /// Non-streaming drive to completion.
    pub async fn execute(&self, task_id: &str, ctx: CancellationToken) -> Result<Task, EngineError> {
        let result = self.run_driver(task_id, &ctx, None).await;
        self.resume_channels.lock().unwrap().remove(task_id);
        result
    }

    /// Drives to completion, routing incremental bytes and lifecycle events
    /// through `writer`.
    pub async fn execute_stream(
        &self,
        task_id: &str,
        ctx: CancellationToken,
        writer: Arc<StreamingWriter>,
    ) -> Result<Task, EngineError> {
        let result = self.run_driver(task_id, &ctx, Some(&writer)).await;
        self.resume_channels.lock().unwrap().remove(task_id);
        result
    }

    /// Appends a message (role forced to `user`), transitions state per the
    /// rules in §4.2, and signals the resume channel if the task was
    /// waiting in INPUT_REQUIRED.
    pub async fn add_user_message_and_process(
        &self,
        task_id: &str,
        mut message: Message,
    ) -> Result<Task, EngineError> {
        message.role = Role::User;
        let current = self.store.get(task_id).await?;
        if current.state == TaskState::Canceled {
            return Err(EngineError::Conflict(
                "cannot add a message to a canceled task".to_string(),
            ));
        }
        let was_waiting = current.state == TaskState::InputRequired;
        let task_id_owned = task_id.to_string();
        let updated = self
            .store
            .update(
                task_id,
                Box::new(move |t| {
                    t.messages.push(message);
                    t.state = TaskState::Working;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(task_id = %task_id_owned, from = ?current.state, to = ?TaskState::Working, "state transition");

        if was_waiting {
            self.signal_resume(task_id);
        }
        Ok(updated)
    }

    /// Signals a task parked in INPUT_REQUIRED to continue. Fails if no
    /// such task is waiting.
    pub fn resume(&self, task_id: &str) -> Result<(), EngineError> {
        let channels = self.resume_channels.lock().unwrap();
        let tx = channels
            .get(task_id)
            .ok_or_else(|| EngineError::Conflict(format!("task {task_id} is not waiting for input")))?;
        if tx.try_send(()).is_err() {
            tracing::warn!(task_id, "resume channel full or closed, signal dropped");
        }
        Ok(())
    }

    fn signal_resume(&self, task_id: &str) {
        let channels = self.resume_channels.lock().unwrap();
        if let Some(tx) = channels.get(task_id) {
            if tx.try_send(()).is_err() {
                tracing::warn!(task_id, "resume channel full or closed, signal dropped");
            }
        }
    }

    async fn emit_state(&self, writer: Option<&Arc<StreamingWriter>>, task: &Task) {
        let Some(writer) = writer else { return };
        let status = match task.state {
            TaskState::Submitted => "SUBMITTED",
            TaskState::Working => "WORKING",
            TaskState::InputRequired => "INPUT_REQUIRED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Canceled => "CANCELED",
        };
        let payload = StateEventPayload {
            status,
            error: task.error.as_deref(),
        };
        let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        let _ = writer.send_event("state", data).await;
    }

    async fn transition(
        &self,
        task_id: &str,
        writer: Option<&Arc<StreamingWriter>>,
        state: TaskState,
    ) -> Result<Task, EngineError> {
        let from = self.store.get(task_id).await?.state;
        let updated = self.store.set_state(task_id, state).await?;
        tracing::info!(task_id, ?from, to = ?state, "state transition");
        self.emit_state(writer, &updated).await;
        Ok(updated)
    }

    async fn fail(
        &self,
        task_id: &str,
        writer: Option<&Arc<StreamingWriter>>,
        error: String,
    ) -> Result<Task, EngineError> {
        let task_id_owned = task_id.to_string();
        let updated = self
            .store
            .update(
                task_id,
                Box::new(move |t| {
                    t.error = Some(error);
                    t.state = TaskState::Failed;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(task_id = %task_id_owned, to = ?TaskState::Failed, "state transition");
        self.emit_state(writer, &updated).await;
        Ok(updated)
    }

    /// Waits for either the resume channel or cancellation, creating the
    /// channel lazily on first use (§4.2 step 6/8, §9 "Resume channels").
    async fn wait_for_resume(&self, task_id: &str, ctx: &CancellationToken) -> WaitOutcome {
        // The driver loop is the only waiter for a given task (§5: strictly
        // sequential within a task), so it's safe to (re)create the channel
        // here and hold the receiver locally for the duration of the wait.
        let mut rx = {
            let (tx, rx) = mpsc::channel(1);
            self.resume_channels.lock().unwrap().insert(task_id.to_string(), tx);
            rx
        };

        tokio::select! {
            _ = rx.recv() => WaitOutcome::Resumed,
            _ = ctx.cancelled() => WaitOutcome::Cancelled,
        }
    }

    async fn run_driver(
        &self,
        task_id: &str,
        ctx: &CancellationToken,
        writer: Option<&Arc<StreamingWriter>>,
    ) -> Result<Task, EngineError> {
        loop {
            let task = self.store.get(task_id).await?;
            if task.state == TaskState::Canceled {
                return Ok(task);
            }
            if ctx.is_cancelled() {
                return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
            }
            if task.state == TaskState::Submitted {
                self.transition(task_id, writer, TaskState::Working).await?;
            }

            // Step 2: build the prompt.
            let task = self.store.get(task_id).await?;
            let (messages, _content_found) = match self.prompt_builder.build(&task, ctx).await {
                Ok(v) => v,
                Err(EngineError::Cancellation) => {
                    return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
                }
                Err(e) => return Ok(self.fail(task_id, writer, e.to_string()).await?),
            };

            // Step 3: invoke the LLM, streaming through `writer` when present.
            let chunk_tx = match writer {
                Some(w) => Some(self.spawn_chunk_forwarder(Arc::clone(w))),
                None => None,
            };
            let chat_result = self
                .llm
                .chat(ctx, &messages, writer.is_some(), chunk_tx)
                .await;

            // Step 4: handle LLM errors and cancellation.
            let chat_result = match chat_result {
                Ok(r) => r,
                Err(EngineError::Cancellation) => {
                    return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
                }
                Err(e) => return Ok(self.fail(task_id, writer, e.to_string()).await?),
            };

            // Open question (resolved per §9): a cancellation observed
            // after the LLM call returns but before the assistant message
            // is appended commits CANCELED and drops the generated output.
            if ctx.is_cancelled() {
                return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
            }

            // Step 5: construct and append the assistant message.
            let assistant_message = Message::text(Role::Assistant, chat_result.full_text.clone());
            let parsed_tool_calls = assistant_message.parsed_tool_calls.clone();
            self.store.add_message(task_id, assistant_message).await?;

            let asks_followup = parsed_tool_calls
                .iter()
                .any(|c| c.name == ASK_FOLLOWUP_QUESTION);

            if asks_followup {
                // Step 6.
                self.transition(task_id, writer, TaskState::InputRequired).await?;
                match self.wait_for_resume(task_id, ctx).await {
                    WaitOutcome::Resumed => {
                        self.transition(task_id, writer, TaskState::Working).await?;
                        continue;
                    }
                    WaitOutcome::Cancelled => {
                        return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
                    }
                }
            }

            if !parsed_tool_calls.is_empty() {
                // Step 7.
                self.dispatch_and_append(task_id, ctx, writer, &parsed_tool_calls).await?;
                self.transition(task_id, writer, TaskState::Working).await?;
                continue;
            }

            if chat_result.full_text.contains(INPUT_REQUIRED_SENTINEL) {
                // Step 8: identical wait as step 6.
                self.transition(task_id, writer, TaskState::InputRequired).await?;
                match self.wait_for_resume(task_id, ctx).await {
                    WaitOutcome::Resumed => {
                        self.transition(task_id, writer, TaskState::Working).await?;
                        continue;
                    }
                    WaitOutcome::Cancelled => {
                        return Ok(self.transition(task_id, writer, TaskState::Canceled).await?);
                    }
                }
            }

            // Step 9: plain completion.
            let text = chat_result.full_text;
            let task_id_owned = task_id.to_string();
            let updated = self
                .store
                .update(
                    task_id,
                    Box::new(move |t| {
                        t.artifacts.insert(
                            "llm_response".to_string(),
                            crate::task::Artifact {
                                id: "llm_response".to_string(),
                                mime_type: "text/plain".to_string(),
                                filename: "llm_response.txt".to_string(),
                                bytes: text.into_bytes(),
                            },
                        );
                        t.state = TaskState::Completed;
                        t.error = None;
                        Ok(())
                    }),
                )
                .await?;
            tracing::info!(task_id = %task_id_owned, to = ?TaskState::Completed, "state transition");
            self.emit_state(writer, &updated).await;
            return Ok(updated);
        }
    }

    /// Bridges the LLM's chunk sender into the streaming writer, so the
    /// executor's caller never needs to plumb `StreamingWriter` into the
    /// `LlmInvoker` trait directly.
    fn spawn_chunk_forwarder(&self, writer: Arc<StreamingWriter>) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if writer.write(chunk.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Dispatches every parsed call from one assistant turn, handling the
    /// `__NEW_TASK_REQUEST__` sentinel in each tool result (§4.2 step 7).
    async fn dispatch_and_append(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
        writer: Option<&Arc<StreamingWriter>>,
        calls: &[crate::parser::ParsedToolCall],
    ) -> Result<(), EngineError> {
        let raw_messages = self.dispatcher.dispatch_all(cancel, task_id, calls).await;
        for (call, message) in calls.iter().zip(raw_messages.into_iter()) {
            let rewritten = self.rewrite_if_sub_task_request(task_id, writer, call, &message).await?;
            self.store.add_message(task_id, rewritten).await?;
        }
        Ok(())
    }

    async fn rewrite_if_sub_task_request(
        &self,
        task_id: &str,
        writer: Option<&Arc<StreamingWriter>>,
        call: &crate::parser::ParsedToolCall,
        message: &Message,
    ) -> Result<Message, EngineError> {
        let body = message.first_text();
        let Ok(envelope) = serde_json::from_str::<serde_json::Value>(body) else {
            return Ok(message.clone());
        };
        let Some(result_str) = envelope.get("result").and_then(|v| v.as_str()) else {
            return Ok(message.clone());
        };
        let Some(rest) = result_str.strip_prefix(NEW_TASK_SENTINEL) else {
            return Ok(message.clone());
        };
        let request: NewTaskRequest = match serde_json::from_str(rest) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "malformed __NEW_TASK_REQUEST__ payload, leaving tool result as-is");
                return Ok(message.clone());
            }
        };
        let parent = request.parent_task_id.clone().unwrap_or_else(|| task_id.to_string());
        let sub_task = self
            .store
            .create(request.name.clone(), request.system_prompt.clone(), vec![], Some(parent.clone()))
            .await?;

        if let Some(writer) = writer {
            let info = NewSubTaskInfo {
                kind: "new_sub_task_created",
                parent: &parent,
                new_id: &sub_task.id,
                new_name: &sub_task.name,
            };
            if let Ok(data) = serde_json::to_string(&info) {
                let _ = writer.send_event("info", data).await;
            }
        }

        Ok(Message::tool_reply(
            call.id.clone(),
            format!("New task {} created successfully.", sub_task.id),
        ))
    }
}
