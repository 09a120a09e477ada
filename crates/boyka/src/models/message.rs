use std::borrow::Cow;

use super::content::{ContentBlock, ToolResult, ToolUse};
use super::role::Role;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message content is either plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::new(Role::User, MessageContent::default())
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::new(Role::Assistant, MessageContent::default())
    }

    /// Create a new tool-result message with the current timestamp
    pub fn tool() -> Self {
        Self::new(Role::Tool, MessageContent::default())
    }

    pub fn user_text<S: Into<String>>(text: S) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant_text<S: Into<String>>(text: S) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Build a message from parsed blocks. A lone text block collapses into
    /// plain text content.
    pub fn from_blocks(role: Role, mut blocks: Vec<ContentBlock>) -> Self {
        if blocks.len() == 1 {
            if let Some(ContentBlock::Text(block)) = blocks.first_mut() {
                let text = std::mem::take(&mut block.text);
                return Self::new(role, MessageContent::Text(text));
            }
        }
        Self::new(role, MessageContent::Blocks(blocks))
    }

    /// Add any block to the message
    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.push_block(block);
        self
    }

    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_block(ContentBlock::text(text))
    }

    pub fn with_tool_use<I: Into<String>, N: Into<String>>(
        self,
        id: I,
        name: N,
        arguments: Value,
    ) -> Self {
        self.with_block(ContentBlock::tool_use(id, name, arguments))
    }

    pub fn with_tool_result<I: Into<String>, O: Into<String>>(
        self,
        tool_use_id: I,
        output: O,
        is_error: bool,
    ) -> Self {
        self.with_block(ContentBlock::tool_result(tool_use_id, output, is_error))
    }

    pub fn push_block(&mut self, block: ContentBlock) {
        match &mut self.content {
            MessageContent::Blocks(blocks) => blocks.push(block),
            MessageContent::Text(text) => {
                let existing = ContentBlock::text(std::mem::take(text));
                self.content = MessageContent::Blocks(vec![existing, block]);
            }
        }
    }

    /// The content as blocks, whichever form it is stored in.
    pub fn blocks(&self) -> Cow<'_, [ContentBlock]> {
        match &self.content {
            MessageContent::Text(text) => Cow::Owned(vec![ContentBlock::text(text.clone())]),
            MessageContent::Blocks(blocks) => Cow::Borrowed(blocks),
        }
    }

    /// All text in the message, joined by newlines
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn tool_uses(&self) -> Vec<&ToolUse> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => {
                blocks.iter().filter_map(ContentBlock::as_tool_use).collect()
            }
        }
    }

    pub fn tool_results(&self) -> Vec<&ToolResult> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_tool_result)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_text_promotes_plain_content_to_blocks() {
        let message = Message::assistant_text("Let me look.").with_tool_use(
            "call_1",
            "read_file",
            json!({"path": "a.txt"}),
        );

        match &message.content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[0].as_text(), Some("Let me look."));
            }
            MessageContent::Text(_) => panic!("Expected block content"),
        }
        assert_eq!(message.tool_uses().len(), 1);
        assert_eq!(message.text(), "Let me look.");
    }

    #[test]
    fn test_from_blocks_collapses_single_text() {
        let message = Message::from_blocks(Role::Assistant, vec![ContentBlock::text("done")]);
        assert_eq!(message.content, MessageContent::Text("done".to_string()));

        let message = Message::from_blocks(
            Role::Assistant,
            vec![
                ContentBlock::text("a"),
                ContentBlock::tool_use("1", "list_files", json!({})),
            ],
        );
        assert!(matches!(message.content, MessageContent::Blocks(_)));
    }

    #[test]
    fn test_tool_results() {
        let message = Message::tool()
            .with_tool_result("call_1", "ok", false)
            .with_tool_result("call_2", "Unknown tool: nope", true);

        let results = message.tool_results();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_error);
        assert!(message.tool_uses().is_empty());
    }

    #[test]
    fn test_content_serializes_untagged() {
        let message = Message::user_text("hello");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"], json!("hello"));
        assert_eq!(value["role"], json!("user"));
    }
}
