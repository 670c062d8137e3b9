use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;

use crate::messages::{ContentBlock, ImageSource, ToolCall, Turn, COMPUTER_TOOL};

// The instance backend does not let us pick a display size, so the tool
// must advertise exactly what it renders.
pub const DISPLAY_WIDTH: u32 = 1024;
pub const DISPLAY_HEIGHT: u32 = 768;

pub const COMPUTER_TOOL_TYPE: &str = "computer_20250124";
pub const COMPUTER_USE_BETA: &str = "computer-use-2025-01-24";
pub const TEMPERATURE: f32 = 0.0;
const API_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct CuaConfig {
    pub api_base: String, // e.g. "https://api.anthropic.com/v1"
    pub api_key: String,  // env ANTHROPIC_API_KEY
}

impl Default for CuaConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1".into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
        }
    }
}

// ========================= Wire Format =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    // thinking blocks and anything newer than this client
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComputerToolDef {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub display_width_px: u32,
    pub display_height_px: u32,
}

pub fn computer_tool() -> ComputerToolDef {
    ComputerToolDef {
        kind: COMPUTER_TOOL_TYPE,
        name: COMPUTER_TOOL,
        display_width_px: DISPLAY_WIDTH,
        display_height_px: DISPLAY_HEIGHT,
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<WireBlock>>,
    pub messages: Vec<WireMessage>,
    pub tools: Vec<ComputerToolDef>,
    // sent as the `anthropic-beta` header
    #[serde(skip)]
    pub betas: Vec<String>,
}

impl MessagesRequest {
    /// Request for the next turn of `history` with the computer tool attached.
    pub fn for_history(model: &str, max_tokens: u32, system: Option<&str>, history: &[Turn]) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            temperature: TEMPERATURE,
            system: system
                .filter(|s| !s.is_empty())
                .map(|s| vec![WireBlock::Text { text: s.to_string() }]),
            messages: to_wire(history),
            tools: vec![computer_tool()],
            betas: vec![COMPUTER_USE_BETA.to_string()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    pub content: Vec<WireBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

// ========================= Format Adapter =========================

/// Converts conversation history into provider messages.
pub fn to_wire(history: &[Turn]) -> Vec<WireMessage> {
    history
        .iter()
        .map(|turn| match turn {
            Turn::Human { content } => WireMessage {
                role: Role::User,
                content: WireContent::Text(content.clone()),
            },
            Turn::Assistant { text, tool_calls } => {
                let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
                if !text.is_empty() {
                    blocks.push(WireBlock::Text { text: text.clone() });
                }
                blocks.extend(tool_calls.iter().map(|c| WireBlock::ToolUse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    input: c.args.clone(),
                }));
                WireMessage { role: Role::Assistant, content: WireContent::Blocks(blocks) }
            }
            Turn::ToolResult { tool_call_id, content, is_error } => WireMessage {
                role: Role::User,
                content: WireContent::Blocks(vec![WireBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: content.clone().into_blocks(),
                    is_error: *is_error,
                }]),
            },
        })
        .collect()
}

/// Folds the content blocks of a model response into one assistant turn.
/// No tool-use block means the model is done.
pub fn from_response(content: Vec<WireBlock>) -> Turn {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block {
            WireBlock::Text { text } => texts.push(text),
            WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall { id, name, args: input }),
            WireBlock::Image { .. } | WireBlock::ToolResult { .. } | WireBlock::Unsupported => {}
        }
    }
    Turn::Assistant { text: texts.join(" "), tool_calls }
}

// ========================= Client =========================

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn create_message(&self, req: &MessagesRequest) -> Result<MessagesResponse>;
}

#[derive(Clone)]
pub struct CuaClient {
    http: Client,
    cfg: CuaConfig,
}

impl CuaClient {
    pub fn new(cfg: CuaConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }
}

#[async_trait]
impl ModelProvider for CuaClient {
    async fn create_message(&self, req: &MessagesRequest) -> Result<MessagesResponse> {
        let url = format!("{}/messages", self.cfg.api_base);
        let mut builder = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION);
        if !req.betas.is_empty() {
            builder = builder.header("anthropic-beta", req.betas.join(","));
        }
        let resp = builder.json(req).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Anthropic error {}: {}", status, text);
        }
        serde_json::from_str(&text).context("failed to parse Anthropic response JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ToolPayload;
    use serde_json::json;

    #[test]
    fn human_turn_is_plain_user_text() {
        let wire = to_wire(&[Turn::human("hello")]);
        assert_eq!(serde_json::to_value(&wire).unwrap(), json!([{"role": "user", "content": "hello"}]));
    }

    #[test]
    fn assistant_turn_carries_text_then_tool_uses() {
        let turn = Turn::Assistant {
            text: "Looking".into(),
            tool_calls: vec![ToolCall { id: "t1".into(), name: "computer".into(), args: json!({"action": "screenshot"}) }],
        };
        let wire = serde_json::to_value(to_wire(&[turn])).unwrap();
        assert_eq!(
            wire,
            json!([{"role": "assistant", "content": [
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "t1", "name": "computer", "input": {"action": "screenshot"}}
            ]}])
        );
    }

    #[test]
    fn tool_result_wraps_text_payload() {
        let turn = Turn::ToolResult { tool_call_id: "t1".into(), content: ToolPayload::Text("ok".into()), is_error: false };
        let wire = serde_json::to_value(to_wire(&[turn])).unwrap();
        assert_eq!(
            wire,
            json!([{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "ok"}]}
            ]}])
        );
    }

    #[test]
    fn tool_result_keeps_image_blocks() {
        let wire = serde_json::to_value(to_wire(&[Turn::screenshot("t9", "iVBOR")])).unwrap();
        assert_eq!(
            wire[0]["content"][0]["content"][0],
            json!({"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBOR"}})
        );
    }

    #[test]
    fn tool_calls_survive_a_round_trip() {
        let calls = vec![
            ToolCall { id: "toolu_1".into(), name: "computer".into(), args: json!({"action": "left_click", "coordinate": [3, 4]}) },
            ToolCall { id: "toolu_2".into(), name: "computer".into(), args: json!({"action": "type", "text": "hi"}) },
        ];
        let turn = Turn::Assistant { text: "two steps".into(), tool_calls: calls.clone() };
        let wire = to_wire(&[turn.clone()]);
        let WireContent::Blocks(blocks) = wire[0].content.clone() else {
            panic!("assistant content must be blocks");
        };
        assert_eq!(from_response(blocks), turn);
    }

    #[test]
    fn response_text_is_space_joined_and_unknown_blocks_ignored() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "thinking", "thinking": "...", "signature": "x"},
                {"type": "text", "text": "second"}
            ],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        let turn = from_response(resp.content);
        assert_eq!(turn, Turn::Assistant { text: "first second".into(), tool_calls: vec![] });
        assert!(turn.tool_calls().is_empty());
    }

    #[test]
    fn request_pins_tool_and_sampling() {
        let req = MessagesRequest::for_history("m", 4096, Some("be careful"), &[Turn::human("go")]);
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["temperature"], json!(0.0));
        assert_eq!(body["max_tokens"], json!(4096));
        assert_eq!(body["system"], json!([{"type": "text", "text": "be careful"}]));
        assert_eq!(
            body["tools"],
            json!([{"type": "computer_20250124", "name": "computer", "display_width_px": 1024, "display_height_px": 768}])
        );
        assert!(body.get("betas").is_none());
        assert_eq!(req.betas, vec![COMPUTER_USE_BETA.to_string()]);

        let bare = serde_json::to_value(MessagesRequest::for_history("m", 1, None, &[])).unwrap();
        assert!(bare.get("system").is_none());
    }

    #[test]
    fn client_requires_api_key() {
        assert!(CuaClient::new(CuaConfig { api_base: "http://localhost".into(), api_key: String::new() }).is_err());
    }
}
