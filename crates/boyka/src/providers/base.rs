use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::configs::BackendConfig;
use super::stream::StreamDecoder;
use crate::errors::AgentResult;
use crate::models::content::{ContentBlock, ToolUse};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Add another response's usage to this one. Unknown counts stay unknown
    /// only while both sides are unknown.
    pub fn accumulate(&mut self, other: &Usage) {
        fn add(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        self.input_tokens = add(self.input_tokens, other.input_tokens);
        self.output_tokens = add(self.output_tokens, other.output_tokens);
        self.total_tokens = add(self.total_tokens, other.total_tokens);
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Stop,
    ToolCallsPending,
    MaxTokens,
    LengthTruncated,
    ContentFiltered,
    #[default]
    Unknown,
}

/// How a backend expects tool definitions to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDialect {
    /// `{type: "function", function: {name, description, parameters}}`
    Function,
    /// `{name, description, input_schema}`
    InputSchema,
}

/// Everything a backend needs to build one request body.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [Tool],
    pub stream: bool,
}

/// A backend response in backend-neutral form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub blocks: Vec<ContentBlock>,
    pub reason: CompletionReason,
    pub role: Option<Role>,
    pub usage: Usage,
    /// Tool calls whose arguments could not be decoded, keyed by call id.
    /// Each one is answered with this message as an error result instead of
    /// being executed.
    pub invalid_arguments: HashMap<String, String>,
}

impl ParsedResponse {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(ContentBlock::as_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        self.blocks
            .iter()
            .filter_map(ContentBlock::as_tool_use)
            .collect()
    }

    /// Append text produced by a continuation request to the first text
    /// block, or add one in front of any tool calls.
    pub fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.blocks.iter_mut().find_map(|b| match b {
            ContentBlock::Text(block) => Some(block),
            _ => None,
        }) {
            Some(block) => block.text.push_str(text),
            None => self.blocks.insert(0, ContentBlock::text(text)),
        }
    }
}

/// A chat backend, described as pure data transformations.
///
/// Implementations never perform I/O; the transport and the agent loop own
/// the network. That keeps one orchestration loop for every backend.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &BackendConfig;

    fn tool_dialect(&self) -> ToolDialect;

    /// Full URL requests are posted to
    fn endpoint(&self) -> String;

    /// Authentication and versioning headers sent with every request
    fn headers(&self) -> &HeaderMap;

    /// Serialize a request. Same input, same output.
    fn build_request(&self, request: &CompletionRequest<'_>) -> AgentResult<Value>;

    /// Decode a complete (non-streaming) response body
    fn parse_response(&self, body: &Value) -> AgentResult<ParsedResponse>;

    /// A fresh decoder for one streamed response
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}
