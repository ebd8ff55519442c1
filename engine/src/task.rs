//! The Task data model: `Task`, `Message`, `Part`, `Artifact`, `TaskState`.
//!
//! `parsed_tool_calls` is derived state — never persisted, recomputed on
//! load by running the parser over the latest assistant message's first
//! `TextPart` (§4.3, §9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parser::{self, ParsedToolCall};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Canceled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One sub-piece of a message. Tagged by `type` so unknown variants can be
/// skipped with a warning on load instead of failing the whole record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    TextPart { text: String },
    FilePart {
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact_id: Option<String>,
    },
    DataPart { mime_type: String, data: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Derived; never persisted. Recomputed by `Message::recompute_parsed_tool_calls`.
    #[serde(skip)]
    pub parsed_tool_calls: Vec<ParsedToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        let mut m = Message {
            role,
            parts,
            tool_call_id: None,
            parsed_tool_calls: Vec::new(),
            timestamp: Utc::now(),
        };
        if matches!(m.role, Role::Assistant) {
            m.recompute_parsed_tool_calls();
        }
        m
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Part::TextPart { text: text.into() }])
    }

    pub fn tool_reply(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut m = Self::new(Role::Tool, vec![Part::TextPart { text: text.into() }]);
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    /// First `TextPart`'s text, or empty string if none.
    pub fn first_text(&self) -> &str {
        self.parts
            .iter()
            .find_map(|p| match p {
                Part::TextPart { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    /// Recomputes `parsed_tool_calls` by running the parser over the first
    /// `TextPart`. A pure function of the message content (§9).
    pub fn recompute_parsed_tool_calls(&mut self) {
        self.parsed_tool_calls = parser::parse_tool_calls(self.first_text());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub mime_type: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub messages: Vec<Message>,
    pub artifacts: HashMap<String, Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        initial_messages: Vec<Message>,
        parent_task_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let mut messages = initial_messages;
        for m in &mut messages {
            m.timestamp = now;
        }
        Task {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            state: TaskState::Submitted,
            system_prompt: system_prompt.into(),
            parent_task_id,
            messages,
            artifacts: HashMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Loading-time repair: zero-value timestamps on older records fall back
    /// to `updated_at` (then `created_at`), and assistant messages get their
    /// `parsed_tool_calls` recomputed (§4.1 "Loading-time repair").
    pub fn repair_on_load(&mut self) {
        let fallback = self.updated_at;
        for m in &mut self.messages {
            if m.timestamp.timestamp() == 0 {
                m.timestamp = fallback;
            }
            if matches!(m.role, Role::Assistant) {
                m.recompute_parsed_tool_calls();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_stamps_timestamps_and_state() {
        let t = Task::new("t1", "", vec![Message::text(Role::User, "hi")], None);
        assert_eq!(t.state, TaskState::Submitted);
        assert_eq!(t.created_at, t.updated_at);
        assert_eq!(t.messages[0].timestamp, t.created_at);
    }

    #[test]
    fn touch_advances_updated_at_without_changing_created_at() {
        let mut t = Task::new("t1", "", vec![], None);
        let created = t.created_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        t.touch();
        assert_eq!(t.created_at, created);
        assert!(t.updated_at >= created);
    }

    #[test]
    fn assistant_message_parses_tool_calls_on_construction() {
        let m = Message::text(Role::Assistant, "<tool id=\"x\">hi</tool>");
        assert_eq!(m.parsed_tool_calls.len(), 1);
        assert_eq!(m.parsed_tool_calls[0].name, "x");
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Working.is_terminal());
        assert!(!TaskState::InputRequired.is_terminal());
        assert!(!TaskState::Submitted.is_terminal());
    }
}
