//! Top-level `Engine` facade: wires the Task Store, Prompt Builder, LLM
//! Invoker, Tool Dispatcher and Task Executor together and exposes the
//! inbound control surface a transport layer consumes (§6).

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::executor::TaskExecutor;
use crate::llm::{LlmInvoker, OpenAiLlmInvoker};
use crate::prompt::PromptBuilder;
use crate::stream::StreamingWriter;
use crate::store::{FileTaskStore, TaskStore};
use crate::task::{Artifact, Message, Task, TaskState};
use crate::tools::{Dispatcher, ToolRegistry};

const DEFAULT_STORE_DIR: &str = "./.task-store";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2048;

pub struct Engine {
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        prompt_builder: Arc<PromptBuilder>,
        llm: Arc<dyn LlmInvoker>,
        tool_registry: ToolRegistry,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(tool_registry)));
        let executor = Arc::new(TaskExecutor::new(store.clone(), prompt_builder, llm, dispatcher));
        Self { store, executor }
    }

    /// Constructs an `Engine` from the process environment (ADD-3):
    /// `.env`/XDG config is applied first, then `TASK_STORE_DIR`,
    /// `TASK_ENGINE_LLM_MODEL`, `TASK_ENGINE_LLM_TEMPERATURE` and
    /// `TASK_ENGINE_LLM_MAX_TOKENS` are read.
    pub async fn from_env(tool_registry: ToolRegistry) -> Result<Self, EngineError> {
        if let Err(e) = env_config::load_and_apply("engine", None) {
            tracing::warn!(error = %e, "config load_and_apply failed, continuing with bare process env");
        }

        let store_dir = std::env::var("TASK_STORE_DIR").unwrap_or_else(|_| DEFAULT_STORE_DIR.to_string());
        let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(store_dir).await.map_err(EngineError::from)?);

        let model = std::env::var("TASK_ENGINE_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let temperature = parse_env_f32("TASK_ENGINE_LLM_TEMPERATURE", DEFAULT_TEMPERATURE)?;
        let max_tokens = parse_env_u32("TASK_ENGINE_LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS)?;

        let client = Client::<OpenAIConfig>::new();
        let llm: Arc<dyn LlmInvoker> = Arc::new(OpenAiLlmInvoker::new(client, model, temperature, max_tokens));
        let prompt_builder = Arc::new(PromptBuilder::new());

        Ok(Self::new(store, prompt_builder, llm, tool_registry))
    }

    /// `submit(name, system_prompt, messages) -> task_id` (async-start).
    pub async fn submit(
        &self,
        name: String,
        system_prompt: String,
        messages: Vec<Message>,
    ) -> Result<String, EngineError> {
        let task = self.store.create(name, system_prompt, messages, None).await?;
        self.spawn_driver(task.id.clone());
        Ok(task.id)
    }

    /// `submit_and_stream(name, system_prompt, messages, writer)`.
    pub async fn submit_and_stream(
        &self,
        name: String,
        system_prompt: String,
        messages: Vec<Message>,
        writer: Arc<StreamingWriter>,
    ) -> Result<String, EngineError> {
        let task = self.store.create(name, system_prompt, messages, None).await?;
        let task_id = task.id.clone();
        let executor = Arc::clone(&self.executor);
        let spawn_id = task_id.clone();
        tokio::spawn(async move {
            let _ = executor.execute_stream(&spawn_id, CancellationToken::new(), writer).await;
        });
        Ok(task_id)
    }

    /// `provide_input(task_id, message)`: only legal when state ==
    /// INPUT_REQUIRED.
    pub async fn provide_input(&self, task_id: &str, message: Message) -> Result<Task, EngineError> {
        let current = self.store.get(task_id).await?;
        if current.state != TaskState::InputRequired {
            return Err(EngineError::Conflict(format!(
                "task {task_id} is not awaiting input"
            )));
        }
        self.executor.add_user_message_and_process(task_id, message).await
    }

    /// The general-purpose path: also wakes INPUT_REQUIRED waiters, and
    /// (re)starts the driver loop when the task wasn't already being
    /// driven (COMPLETED/FAILED/SUBMITTED → WORKING).
    pub async fn add_user_message(&self, task_id: &str, message: Message) -> Result<Task, EngineError> {
        let previous_state = self.store.get(task_id).await?.state;
        let updated = self.executor.add_user_message_and_process(task_id, message).await?;
        if matches!(
            previous_state,
            TaskState::Completed | TaskState::Failed | TaskState::Submitted
        ) {
            self.spawn_driver(task_id.to_string());
        }
        Ok(updated)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, EngineError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.list().await?)
    }

    pub async fn get_artifact(
        &self,
        task_id: &str,
        artifact_id: &str,
    ) -> Result<(Vec<u8>, Artifact), EngineError> {
        Ok(self.store.get_artifact(task_id, artifact_id).await?)
    }

    pub async fn delete(&self, task_id: &str) -> Result<(), EngineError> {
        Ok(self.store.delete(task_id).await?)
    }

    fn spawn_driver(&self, task_id: String) {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let _ = executor.execute(&task_id, CancellationToken::new()).await;
        });
    }
}

fn parse_env_f32(key: &str, default: f32) -> Result<f32, EngineError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid {key}: {v}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(key: &str, default: u32) -> Result<u32, EngineError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid {key}: {v}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmInvoker;
    use crate::store::InMemoryTaskStore;
    use crate::task::Role;

    fn engine(responses: Vec<&str>) -> Engine {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let prompt_builder = Arc::new(PromptBuilder::new());
        let llm: Arc<dyn LlmInvoker> = Arc::new(MockLlmInvoker::new(responses));
        Engine::new(store, prompt_builder, llm, ToolRegistry::new())
    }

    #[tokio::test]
    async fn submit_drives_task_to_completion_in_background() {
        let engine = engine(vec!["hello"]);
        let task_id = engine
            .submit("t1".into(), "".into(), vec![Message::text(Role::User, "hi")])
            .await
            .unwrap();

        let mut waited = 0;
        loop {
            let t = engine.get(&task_id).await.unwrap();
            if t.state == TaskState::Completed {
                break;
            }
            waited += 1;
            assert!(waited < 200);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn provide_input_rejects_when_not_awaiting() {
        let engine = engine(vec!["hello"]);
        let task_id = engine
            .submit("t1".into(), "".into(), vec![Message::text(Role::User, "hi")])
            .await
            .unwrap();
        // Task is SUBMITTED/WORKING, not INPUT_REQUIRED.
        let err = engine
            .provide_input(&task_id, Message::text(Role::User, "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let engine = engine(vec!["hello"]);
        let task_id = engine
            .submit("t1".into(), "".into(), vec![Message::text(Role::User, "hi")])
            .await
            .unwrap();
        engine.delete(&task_id).await.unwrap();
        assert!(matches!(engine.get(&task_id).await, Err(EngineError::NotFound(_))));
    }
}
