use serde_json::Value;
use tracing::{debug, warn};

use super::base::{CompletionReason, ParsedResponse, Usage};
use super::sse::SseFrame;
use crate::errors::{AgentError, AgentResult, TransportError};
use crate::models::content::{ContentBlock, ToolResult, ToolUse};
use crate::models::role::Role;

/// What kind of content block a stream is opening.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
    Other(String),
}

/// Backend-neutral streaming events, named after the Anthropic wire events.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart { role: Option<Role>, usage: Usage },
    ContentBlockStart { index: usize, kind: BlockKind },
    TextDelta { index: usize, text: String },
    InputJsonDelta { index: usize, partial_json: String },
    ContentBlockStop { index: usize },
    MessageDelta { reason: CompletionReason, usage: Usage },
    MessageStop,
    Ping,
}

/// Turns SSE frames from one response into [`StreamEvent`]s.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> AgentResult<Vec<StreamEvent>>;
}

#[derive(Debug, Clone, PartialEq)]
enum ParserState {
    AwaitingStart,
    InMessage,
    InToolUse {
        id: String,
        name: String,
        buffer: String,
    },
    Complete,
}

/// What the driver should do after feeding one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserStep {
    Continue,
    /// A text fragment to show the user right away
    Text(String),
    /// A tool block finished. The driver runs it (or reports the argument
    /// error) and hands the result back through [`StreamParser::record_result`]
    /// before feeding the next event.
    ToolCall(PendingToolCall),
    /// `message_stop` arrived
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub tool_use: ToolUse,
    /// Set when the accumulated arguments were not valid JSON
    pub argument_error: Option<String>,
}

/// Accumulates one streamed response.
///
/// Blocks keep their arrival order, so the result has the same shape as a
/// batch response. Tool blocks are emitted as soon as they close so they can
/// run while the stream is still open.
#[derive(Debug)]
pub struct StreamParser {
    state: ParserState,
    blocks: Vec<ContentBlock>,
    /// Index into `blocks` of the text block deltas currently extend
    open_text: Option<usize>,
    results: Vec<ToolResult>,
    invalid: Vec<(String, String)>,
    reason: CompletionReason,
    role: Option<Role>,
    usage: Usage,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitingStart,
            blocks: Vec::new(),
            open_text: None,
            results: Vec::new(),
            invalid: Vec::new(),
            reason: CompletionReason::Unknown,
            role: None,
            usage: Usage::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    pub fn handle(&mut self, event: StreamEvent) -> AgentResult<ParserStep> {
        if self.is_complete() {
            debug!(?event, "ignoring event after message_stop");
            return Ok(ParserStep::Continue);
        }

        match event {
            StreamEvent::Ping => Ok(ParserStep::Continue),
            StreamEvent::MessageStart { role, usage } => {
                if matches!(self.state, ParserState::InToolUse { .. }) {
                    return Err(AgentError::parse(
                        "message_start arrived inside an open tool_use block",
                    ));
                }
                *self = Self::new();
                self.role = role;
                self.usage = usage;
                self.state = ParserState::InMessage;
                Ok(ParserStep::Continue)
            }
            event if self.state == ParserState::AwaitingStart => Err(AgentError::parse(format!(
                "stream event before message_start: {:?}",
                event
            ))),
            StreamEvent::ContentBlockStart { kind, .. } => {
                self.expect_in_message("content_block_start")?;
                match kind {
                    BlockKind::ToolUse { id, name } => {
                        self.state = ParserState::InToolUse {
                            id,
                            name,
                            buffer: String::new(),
                        };
                    }
                    BlockKind::Text => self.open_text_block(),
                    BlockKind::Other(kind) => debug!(kind = %kind, "ignoring unsupported content block"),
                }
                Ok(ParserStep::Continue)
            }
            StreamEvent::TextDelta { text, .. } => {
                self.expect_in_message("text_delta")?;
                Ok(ParserStep::Text(self.push_text(text)))
            }
            StreamEvent::InputJsonDelta { partial_json, .. } => match &mut self.state {
                ParserState::InToolUse { buffer, .. } => {
                    buffer.push_str(&partial_json);
                    Ok(ParserStep::Continue)
                }
                state => Err(AgentError::parse(format!(
                    "input_json_delta outside a tool_use block (state {:?})",
                    state
                ))),
            },
            StreamEvent::ContentBlockStop { .. } => {
                match std::mem::replace(&mut self.state, ParserState::InMessage) {
                    ParserState::InToolUse { id, name, buffer } => {
                        Ok(ParserStep::ToolCall(self.close_tool_block(id, name, buffer)))
                    }
                    ParserState::InMessage => {
                        self.open_text = None;
                        Ok(ParserStep::Continue)
                    }
                    state => {
                        self.state = state;
                        self.expect_in_message("content_block_stop")?;
                        Ok(ParserStep::Continue)
                    }
                }
            }
            StreamEvent::MessageDelta { reason, usage } => {
                self.expect_in_message("message_delta")?;
                // usage-only deltas carry no reason and must not erase one
                if reason != CompletionReason::Unknown {
                    self.reason = reason;
                }
                self.usage.accumulate(&usage);
                Ok(ParserStep::Continue)
            }
            StreamEvent::MessageStop => {
                self.expect_in_message("message_stop")?;
                self.state = ParserState::Complete;
                Ok(ParserStep::Finished)
            }
        }
    }

    fn expect_in_message(&self, event: &str) -> AgentResult<()> {
        if self.state == ParserState::InMessage {
            Ok(())
        } else {
            Err(AgentError::parse(format!(
                "unexpected {} in state {:?}",
                event, self.state
            )))
        }
    }

    fn open_text_block(&mut self) {
        self.blocks.push(ContentBlock::text(""));
        self.open_text = Some(self.blocks.len() - 1);
    }

    /// Append a delta to the open text block. The first fragment of a block
    /// that follows earlier text carries the newline that
    /// [`ParsedResponse::text`] puts between text blocks.
    fn push_text(&mut self, text: String) -> String {
        let index = match self.open_text {
            Some(index) => index,
            None => {
                self.open_text_block();
                self.blocks.len() - 1
            }
        };
        let earlier_text = self.blocks[..index]
            .iter()
            .filter_map(ContentBlock::as_text)
            .any(|t| !t.is_empty());

        let Some(ContentBlock::Text(block)) = self.blocks.get_mut(index) else {
            return text;
        };
        let separate = block.text.is_empty() && !text.is_empty() && earlier_text;
        block.text.push_str(&text);
        if separate {
            format!("\n{}", text)
        } else {
            text
        }
    }

    fn close_tool_block(&mut self, id: String, name: String, buffer: String) -> PendingToolCall {
        let (arguments, argument_error) = if buffer.trim().is_empty() {
            (Value::Object(Default::default()), None)
        } else {
            match serde_json::from_str::<Value>(&buffer) {
                Ok(arguments) => (arguments, None),
                Err(e) => {
                    warn!(tool = %name, error = %e, "tool arguments are not valid JSON");
                    let message = format!("Invalid JSON arguments for tool '{}': {}", name, e);
                    self.invalid.push((id.clone(), message.clone()));
                    (Value::Object(Default::default()), Some(message))
                }
            }
        };

        let tool_use = ToolUse {
            id,
            name,
            arguments,
        };
        self.open_text = None;
        self.blocks.push(ContentBlock::ToolUse(tool_use.clone()));
        PendingToolCall {
            tool_use,
            argument_error,
        }
    }

    /// Record the result of the tool call most recently handed out.
    pub fn record_result(&mut self, result: ToolResult) {
        self.results.push(result);
    }

    /// Collapse the accumulated state into a response plus the results of the
    /// tools that already ran. Fails if `message_stop` never arrived.
    pub fn finish(self) -> AgentResult<(ParsedResponse, Vec<ToolResult>)> {
        if !self.is_complete() {
            return Err(TransportError::StreamInterrupted(
                "stream ended before message_stop".into(),
            )
            .into());
        }

        let blocks: Vec<ContentBlock> = self
            .blocks
            .into_iter()
            .filter(|block| !matches!(block.as_text(), Some("")))
            .collect();

        let response = ParsedResponse {
            blocks,
            reason: self.reason,
            role: self.role,
            usage: self.usage,
            invalid_arguments: self.invalid.into_iter().collect(),
        };
        Ok((response, self.results))
    }
}
