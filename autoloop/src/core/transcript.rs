//! Line-oriented transcript parsing.
//!
//! Agents emit one JSON record per line. Records come in a few shapes
//! (stream events with a nested `message`, flat `{role, content}` records and
//! a trailing `result` event carrying token usage). Anything that does not
//! parse or carries no recognised role is skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" | "human" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Text(String),
    ToolUse {
        name: String,
        path: Option<String>,
        command: Option<String>,
    },
    ToolResult(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl Message {
    /// Text blocks of this message joined by newlines.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|block| match block {
                Block::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }
}

/// Token usage reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Tokens occupying the context window after the reported turn.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub messages: Vec<Message>,
    pub usage: Option<Usage>,
    /// Agent-side session identifier, used to resume within a cycle.
    pub agent_session_id: Option<String>,
    /// Size of the raw transcript, for byte-based usage estimates.
    pub bytes: usize,
}

impl Transcript {
    pub fn assistant_messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == Role::Assistant)
    }

    /// Text of the last assistant message that carried any text.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.assistant_messages()
            .rev()
            .map(Message::text)
            .find(|text| !text.trim().is_empty())
    }
}

pub fn parse_transcript(raw: &str) -> Transcript {
    let mut transcript = Transcript {
        bytes: raw.len(),
        ..Transcript::default()
    };
    let mut result_usage = None;
    let mut assistant_usage = None;

    for line in raw.lines() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(id) = record.get("session_id").and_then(Value::as_str)
            && !id.is_empty()
        {
            transcript.agent_session_id = Some(id.to_string());
        }

        if record.get("type").and_then(Value::as_str) == Some("result") {
            if let Some(usage) = parse_usage(record.get("usage")) {
                result_usage = Some(usage);
            }
            continue;
        }

        let message = record.get("message").unwrap_or(&record);
        let role = message
            .get("role")
            .or_else(|| record.get("role"))
            .or_else(|| record.get("type"))
            .and_then(Value::as_str)
            .and_then(Role::parse);
        let Some(role) = role else {
            continue;
        };

        if role == Role::Assistant
            && let Some(usage) = parse_usage(message.get("usage"))
        {
            assistant_usage = Some(usage);
        }

        let blocks = message
            .get("content")
            .map(parse_blocks)
            .unwrap_or_default();
        if blocks.is_empty() {
            continue;
        }
        transcript.messages.push(Message { role, blocks });
    }

    transcript.usage = assistant_usage.or(result_usage);
    transcript
}

fn parse_usage(value: Option<&Value>) -> Option<Usage> {
    let value = value?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn parse_blocks(content: &Value) -> Vec<Block> {
    match content {
        Value::String(text) => vec![Block::Text(text.clone())],
        Value::Array(items) => items.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(item: &Value) -> Option<Block> {
    if let Value::String(text) = item {
        return Some(Block::Text(text.clone()));
    }
    match item.get("type").and_then(Value::as_str)? {
        "text" => item
            .get("text")
            .and_then(Value::as_str)
            .map(|text| Block::Text(text.to_string())),
        "tool_use" => {
            let name = item.get("name").and_then(Value::as_str)?.to_string();
            let input = item.get("input");
            let field = |key: &str| {
                input
                    .and_then(|input| input.get(key))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let path = field("file_path")
                .or_else(|| field("path"))
                .or_else(|| field("notebook_path"));
            Some(Block::ToolUse {
                name,
                path,
                command: field("command"),
            })
        }
        "tool_result" => {
            let text = match item.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            Some(Block::ToolResult(text))
        }
        _ => None,
    }
}
