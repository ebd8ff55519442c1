//! LLM Invoker (§4.6): streams a completion from the external LLM,
//! detecting first byte, returning the full concatenated output and token
//! counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::prompt::ChatMessage;

pub struct ChatResult {
    pub full_text: String,
    pub input_tokens: u32,
    pub completion_tokens: u32,
}

/// `chat(ctx, messages, stream, out_writer) -> (full_text, input_tokens,
/// completion_tokens, error)`, modeled as a `Result<ChatResult,
/// EngineError>` with cancellation surfaced as `EngineError::Cancellation`.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        stream: bool,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatResult, EngineError>;
}

/// Scripted responses for deterministic tests, modeled on the teacher's
/// `MockLlm`. Each call to `chat` consumes the next scripted response;
/// calling past the end of the script is a test bug and panics.
pub struct MockLlmInvoker {
    responses: Mutex<Vec<String>>,
    next: AtomicUsize,
}

impl MockLlmInvoker {
    pub fn new(responses: Vec<impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmInvoker for MockLlmInvoker {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        _messages: &[ChatMessage],
        _stream: bool,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancellation);
        }
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        let content = {
            let responses = self.responses.lock().unwrap();
            responses
                .get(idx)
                .cloned()
                .unwrap_or_else(|| panic!("MockLlmInvoker: no scripted response for call {idx}"))
        };
        if let Some(tx) = chunk_tx {
            let _ = tx.send(content.clone()).await;
        }
        let completion_tokens = content.split_whitespace().count() as u32;
        Ok(ChatResult {
            full_text: content,
            input_tokens: 0,
            completion_tokens,
        })
    }
}

/// Real LLM invoker backed by `async-openai`. The wire-level HTTP/SSE
/// parsing is delegated entirely to that crate.
pub struct OpenAiLlmInvoker {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiLlmInvoker {
    pub fn new(client: Client<OpenAIConfig>, model: String, temperature: f32, max_tokens: u32) -> Self {
        Self {
            client,
            model,
            temperature,
            max_tokens,
        }
    }

    fn to_openai_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, EngineError> {
        messages
            .iter()
            .map(|m| match m.role {
                "system" => ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map(Into::into)
                    .map_err(|e| EngineError::Transport(e.to_string())),
                "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map(Into::into)
                    .map_err(|e| EngineError::Transport(e.to_string())),
                "tool" => ChatCompletionRequestToolMessageArgs::default()
                    .content(m.content.clone())
                    .tool_call_id(String::new())
                    .build()
                    .map(Into::into)
                    .map_err(|e| EngineError::Transport(e.to_string())),
                _ => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map(Into::into)
                    .map_err(|e| EngineError::Transport(e.to_string())),
            })
            .collect()
    }
}

#[async_trait]
impl LlmInvoker for OpenAiLlmInvoker {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        stream: bool,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancellation);
        }
        let openai_messages = Self::to_openai_messages(messages)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .messages(openai_messages)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !stream {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancellation),
                r = self.client.chat().create(request) => r,
            }
            .map_err(|e| EngineError::Transport(e.to_string()))?;

            let full_text = response
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();
            let usage = response.usage;
            return Ok(ChatResult {
                full_text,
                input_tokens: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
                completion_tokens: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            });
        }

        let mut response_stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let mut full_text = String::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancellation),
                n = response_stream.next() => n,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| EngineError::Transport(e.to_string()))?;
            if let Some(choice) = chunk.choices.first() {
                if let Some(delta) = &choice.delta.content {
                    if !delta.is_empty() {
                        full_text.push_str(delta);
                        if let Some(tx) = &chunk_tx {
                            let _ = tx.send(delta.clone()).await;
                        }
                    }
                }
            }
        }

        let completion_tokens = full_text.split_whitespace().count() as u32;
        Ok(ChatResult {
            full_text,
            input_tokens: 0,
            completion_tokens,
        })
    }
}
