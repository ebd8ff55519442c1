//! Prompt Builder (§4.5): converts a task's system prompt + message history
//! into the LLM's flat `{role, content}` message list.

use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::task::{Part, Role, Task};

const HTTP_FETCH_CAP_BYTES: usize = 1024 * 1024;
const SNIPPET_MAX_CHARS: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

pub struct PromptBuilder {
    http: reqwest::Client,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the LLM message list from `task`. Returns `content_found`
    /// alongside the list: false only when both the system prompt was
    /// empty and no part contributed content. `cancel` is threaded into
    /// every part render so an in-flight HTTP fetch is a cancellable
    /// suspension point (§4.5 "Safety", §5).
    pub async fn build(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ChatMessage>, bool), EngineError> {
        if !task.messages.iter().any(|m| matches!(m.role, Role::User)) {
            return Err(EngineError::Validation(
                "input validation failed: no user message".to_string(),
            ));
        }

        let mut out = Vec::new();
        let mut content_found = false;

        if !task.system_prompt.is_empty() {
            out.push(ChatMessage {
                role: "system",
                content: task.system_prompt.clone(),
            });
            content_found = true;
        }

        for message in &task.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::System => continue,
            };
            let mut rendered = String::new();
            for part in &message.parts {
                if let Some(chunk) = self.render_part(cancel, part).await? {
                    if !rendered.is_empty() {
                        rendered.push('\n');
                    }
                    rendered.push_str(&chunk);
                }
            }
            if rendered.is_empty() {
                continue;
            }
            content_found = true;
            out.push(ChatMessage {
                role,
                content: rendered,
            });
        }

        Ok((out, content_found))
    }

    /// Renders one `Part` into its textual contribution. Returns `Ok(None)`
    /// for parts contributing nothing (e.g. an absent URI); a URI whose
    /// scheme none of http(s)/file/data recognize is malformed and fails
    /// the whole build with a precise error (§4.5 "Safety").
    async fn render_part(
        &self,
        cancel: &CancellationToken,
        part: &Part,
    ) -> Result<Option<String>, EngineError> {
        match part {
            Part::TextPart { text } => {
                if text.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(text.clone()))
                }
            }
            Part::DataPart { mime_type, .. } => Ok(Some(format!("[Data: {mime_type}]"))),
            Part::FilePart {
                mime_type,
                uri,
                artifact_id: _,
            } => {
                let Some(uri) = uri.as_deref() else {
                    return Ok(None);
                };
                if let Some(data) = uri.strip_prefix("data:") {
                    Ok(Some(self.render_data_uri(mime_type, data)))
                } else if uri.starts_with("http://") || uri.starts_with("https://") {
                    self.fetch_http(cancel, uri, mime_type).await.map(Some)
                } else if uri.starts_with("file:") {
                    Ok(Some(format!("[File: {uri} ({mime_type})]")))
                } else {
                    Err(EngineError::Validation(format!(
                        "malformed file part URI (unsupported scheme): {uri}"
                    )))
                }
            }
        }
    }

    fn render_data_uri(&self, mime_type: &str, data_uri_rest: &str) -> String {
        // data:[<mediatype>][;base64],<data>
        let payload = data_uri_rest.split(',').next_back().unwrap_or("");
        match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let snippet = truncate(&text, SNIPPET_MAX_CHARS);
                format!("[File Content from URI ({mime_type})]:\n{snippet}\n[/File Content]")
            }
            Err(e) => format!("[File: data URI decode error ({mime_type}): {e}]"),
        }
    }

    /// Fetches `uri`, racing the request and body read against `cancel`
    /// the same way `OpenAiLlmInvoker::chat` races the chat completion
    /// call — a hanging fetch must not block the cancellation path.
    async fn fetch_http(
        &self,
        cancel: &CancellationToken,
        uri: &str,
        mime_type: &str,
    ) -> Result<String, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancellation);
        }
        let send_result = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancellation),
            r = self.http.get(uri).send() => r,
        };
        match send_result {
            Ok(resp) => {
                let bytes_result = tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancellation),
                    r = resp.bytes() => r,
                };
                match bytes_result {
                    Ok(bytes) => {
                        let capped = &bytes[..bytes.len().min(HTTP_FETCH_CAP_BYTES)];
                        if bytes.len() > HTTP_FETCH_CAP_BYTES {
                            tracing::warn!(uri, "http fetch exceeded cap, truncating");
                        }
                        let text = String::from_utf8_lossy(capped);
                        let snippet = truncate(&text, SNIPPET_MAX_CHARS);
                        Ok(format!(
                            "[File Content from URI ({mime_type})]:\n{snippet}\n[/File Content]"
                        ))
                    }
                    Err(e) => Ok(format!("[File: fetch error reading body ({mime_type}): {e}]")),
                }
            }
            Err(e) => Ok(format!("[File: fetch error ({mime_type}): {e}]")),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Message, Task};

    #[tokio::test]
    async fn empty_history_with_system_prompt_yields_one_system_message() {
        let mut task = Task::new("t", "be nice", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        let builder = PromptBuilder::new();
        let (messages, content_found) = builder.build(&task, &CancellationToken::new()).await.unwrap();
        assert!(content_found);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "be nice");
    }

    #[tokio::test]
    async fn history_without_user_message_fails_validation() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::Assistant, "hello"));
        let builder = PromptBuilder::new();
        let err = builder.build(&task, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn skips_messages_with_empty_concatenation() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        task.messages.push(Message::new(Role::Assistant, vec![Part::TextPart { text: String::new() }]));
        let builder = PromptBuilder::new();
        let (messages, _) = builder.build(&task, &CancellationToken::new()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn file_uri_renders_placeholder() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        task.messages.push(Message::new(
            Role::User,
            vec![Part::FilePart {
                mime_type: "text/plain".to_string(),
                uri: Some("file:///tmp/x.txt".to_string()),
                artifact_id: None,
            }],
        ));
        let builder = PromptBuilder::new();
        let (messages, _) = builder.build(&task, &CancellationToken::new()).await.unwrap();
        assert!(messages.last().unwrap().content.contains("[File: file:///tmp/x.txt"));
    }

    #[tokio::test]
    async fn data_uri_decodes_and_truncates() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        let encoded = base64::engine::general_purpose::STANDARD.encode("hello world");
        task.messages.push(Message::new(
            Role::User,
            vec![Part::FilePart {
                mime_type: "text/plain".to_string(),
                uri: Some(format!("data:text/plain;base64,{encoded}")),
                artifact_id: None,
            }],
        ));
        let builder = PromptBuilder::new();
        let (messages, _) = builder.build(&task, &CancellationToken::new()).await.unwrap();
        assert!(messages.last().unwrap().content.contains("hello world"));
    }

    #[tokio::test]
    async fn unsupported_uri_scheme_fails_build_with_validation_error() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        task.messages.push(Message::new(
            Role::User,
            vec![Part::FilePart {
                mime_type: "text/plain".to_string(),
                uri: Some("ftp://example.com/x.txt".to_string()),
                artifact_id: None,
            }],
        ));
        let builder = PromptBuilder::new();
        let err = builder.build(&task, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn data_part_renders_placeholder() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        task.messages.push(Message::new(
            Role::User,
            vec![Part::DataPart {
                mime_type: "application/json".to_string(),
                data: "{}".to_string(),
            }],
        ));
        let builder = PromptBuilder::new();
        let (messages, _) = builder.build(&task, &CancellationToken::new()).await.unwrap();
        assert!(messages.last().unwrap().content.contains("[Data: application/json]"));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_http_fetch_before_sending() {
        let mut task = Task::new("t", "", vec![], None);
        task.messages.push(Message::text(Role::User, "hi"));
        task.messages.push(Message::new(
            Role::User,
            vec![Part::FilePart {
                mime_type: "text/plain".to_string(),
                uri: Some("http://example.invalid/x.txt".to_string()),
                artifact_id: None,
            }],
        ));
        let builder = PromptBuilder::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = builder.build(&task, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancellation));
    }
}
