use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Name of the single tool the model is offered.
pub const COMPUTER_TOOL: &str = "computer";
/// Media type of every screenshot returned by an instance.
pub const IMAGE_MEDIA_TYPE: &str = "image/png";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String, // "base64"
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn png_base64(data: impl Into<String>) -> Self {
        Self {
            kind: "base64".into(),
            media_type: IMAGE_MEDIA_TYPE.into(),
            data: data.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

/// Body of a tool result: either already block-structured or plain text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolPayload {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl ToolPayload {
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            ToolPayload::Blocks(blocks) => blocks,
            ToolPayload::Text(text) => vec![ContentBlock::Text { text }],
        }
    }

    pub fn image_data(&self) -> Option<&str> {
        match self {
            ToolPayload::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::Image { source } => Some(source.data.as_str()),
                ContentBlock::Text { .. } => None,
            }),
            ToolPayload::Text(_) => None,
        }
    }
}

/// One entry of the conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    Human {
        content: String,
    },
    Assistant {
        #[serde(default)]
        text: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        content: ToolPayload,
        #[serde(default)]
        is_error: bool,
    },
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Turn::Human { content: content.into() }
    }

    pub fn screenshot(tool_call_id: impl Into<String>, base64_png: impl Into<String>) -> Self {
        Turn::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: ToolPayload::Blocks(vec![ContentBlock::Image {
                source: ImageSource::png_base64(base64_png),
            }]),
            is_error: false,
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Turn::Assistant { tool_calls, .. } => tool_calls,
            Turn::Human { .. } | Turn::ToolResult { .. } => &[],
        }
    }

    /// First call in this turn addressed to the computer tool.
    pub fn computer_call(&self) -> Option<&ToolCall> {
        self.tool_calls().iter().find(|c| c.name == COMPUTER_TOOL)
    }
}

pub fn is_computer_tool_call(calls: &[ToolCall]) -> bool {
    calls.iter().any(|c| c.name == COMPUTER_TOOL)
}

/// State threaded through the loop. `stream_url` and `authenticated_id`
/// are caches: once set they are never cleared.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub messages: Vec<Turn>,
    pub instance_id: Option<String>,
    stream_url: Option<String>,
    authenticated_id: Option<String>,
}

impl SessionState {
    pub fn new(messages: Vec<Turn>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn push(&mut self, turn: Turn) {
        self.messages.push(turn);
    }

    pub fn last(&self) -> Option<&Turn> {
        self.messages.last()
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }

    pub fn authenticated_id(&self) -> Option<&str> {
        self.authenticated_id.as_deref()
    }

    /// Records the stream url unless one is already known. Returns whether it was stored.
    pub fn set_stream_url(&mut self, url: String) -> bool {
        if self.stream_url.is_some() {
            return false;
        }
        self.stream_url = Some(url);
        true
    }

    pub fn set_authenticated_id(&mut self, id: String) {
        self.authenticated_id = Some(id);
    }

    /// Tool calls that no later tool-result turn answers.
    pub fn unresolved_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|t| match t {
                Turn::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        self.messages
            .iter()
            .flat_map(Turn::tool_calls)
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }
}
