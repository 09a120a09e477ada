use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use super::base::{
    CompletionReason, CompletionRequest, ParsedResponse, Provider, ToolDialect, Usage,
};
use super::configs::{BackendConfig, OpenAiProviderConfig};
use super::sse::SseFrame;
use super::stream::{BlockKind, StreamDecoder, StreamEvent};
use super::utils::{
    get_openai_usage, messages_to_openai_spec, openai_finish_reason, openai_response_to_parsed,
    tools_to_openai_spec,
};
use crate::errors::{AgentError, AgentResult, ConfigError};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;

pub struct OpenAiProvider {
    config: OpenAiProviderConfig,
    headers: HeaderMap,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> AgentResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.backend.api_key()))
            .map_err(|e| ConfigError::Invalid {
                field: "api_key",
                reason: e.to_string(),
            })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self { config, headers })
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn config(&self) -> &BackendConfig {
        &self.config.backend
    }

    fn tool_dialect(&self) -> ToolDialect {
        ToolDialect::Function
    }

    fn endpoint(&self) -> String {
        self.config.backend.url("v1/chat/completions")
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn build_request(&self, request: &CompletionRequest<'_>) -> AgentResult<Value> {
        let system_message =
            Message::new(Role::System, MessageContent::Text(request.system.to_string()));
        let mut messages_array = messages_to_openai_spec(std::slice::from_ref(&system_message));
        messages_array.extend(messages_to_openai_spec(request.messages));

        let mut payload = json!({
            "model": self.config.backend.model(),
            "messages": messages_array,
            "max_tokens": self.config.backend.max_tokens(),
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(request.tools)?);
        }
        if request.stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({"include_usage": true});
        }

        Ok(payload)
    }

    fn parse_response(&self, body: &Value) -> AgentResult<ParsedResponse> {
        openai_response_to_parsed(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(usize),
    Tool { block: usize, call: u64 },
}

/// Rebuilds block boundaries from OpenAI's chunked deltas.
///
/// OpenAI never says when a block starts or stops, so a block is opened by the
/// first delta of its kind and closed by the next delta of a different kind,
/// by `finish_reason`, or by `[DONE]`.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    started: bool,
    next_block: usize,
    open: Option<OpenBlock>,
    finished: bool,
}

impl OpenAiStreamDecoder {
    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open.take() {
            let index = match open {
                OpenBlock::Text(index) => index,
                OpenBlock::Tool { block, .. } => block,
            };
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn open_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        self.close_block(events);
        let index = self.next_block;
        self.next_block += 1;
        events.push(StreamEvent::ContentBlockStart { index, kind });
        index
    }

    fn ensure_started(&mut self, role: Option<Role>, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                role,
                usage: Usage::default(),
            });
        }
    }

    fn decode_chunk(&mut self, chunk: &Value, events: &mut Vec<StreamEvent>) -> AgentResult<()> {
        let choice = chunk["choices"].as_array().and_then(|c| c.first());
        let delta = choice.map(|c| &c["delta"]);
        let role = delta
            .and_then(|d| d["role"].as_str())
            .and_then(|r| r.parse().ok());
        self.ensure_started(role, events);

        if let Some(delta) = delta {
            if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
                let index = match self.open {
                    Some(OpenBlock::Text(index)) => index,
                    _ => {
                        let index = self.open_block(BlockKind::Text, events);
                        self.open = Some(OpenBlock::Text(index));
                        index
                    }
                };
                events.push(StreamEvent::TextDelta {
                    index,
                    text: text.to_string(),
                });
            }

            for tool_call in delta["tool_calls"].as_array().into_iter().flatten() {
                let call = tool_call["index"].as_u64().unwrap_or_default();
                let block = match self.open {
                    Some(OpenBlock::Tool { block, call: open }) if open == call => block,
                    _ => {
                        let (Some(id), Some(name)) = (
                            tool_call["id"].as_str(),
                            tool_call["function"]["name"].as_str(),
                        ) else {
                            return Err(AgentError::parse(format!(
                                "tool call {} started without id or name",
                                call
                            )));
                        };
                        let kind = BlockKind::ToolUse {
                            id: id.to_string(),
                            name: name.to_string(),
                        };
                        let block = self.open_block(kind, events);
                        self.open = Some(OpenBlock::Tool { block, call });
                        block
                    }
                };
                if let Some(fragment) = tool_call["function"]["arguments"]
                    .as_str()
                    .filter(|f| !f.is_empty())
                {
                    events.push(StreamEvent::InputJsonDelta {
                        index: block,
                        partial_json: fragment.to_string(),
                    });
                }
            }
        }

        let finish_reason = choice.and_then(|c| c["finish_reason"].as_str());
        let usage = if chunk["usage"].is_object() {
            get_openai_usage(chunk)
        } else {
            Usage::default()
        };
        if finish_reason.is_some() || usage != Usage::default() {
            self.close_block(events);
            events.push(StreamEvent::MessageDelta {
                reason: if finish_reason.is_some() {
                    openai_finish_reason(finish_reason)
                } else {
                    CompletionReason::Unknown
                },
                usage,
            });
        }
        Ok(())
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> AgentResult<Vec<StreamEvent>> {
        let mut events = Vec::new();
        if self.finished {
            return Ok(events);
        }

        if frame.data.trim() == "[DONE]" {
            self.ensure_started(None, &mut events);
            self.close_block(&mut events);
            events.push(StreamEvent::MessageStop);
            self.finished = true;
            return Ok(events);
        }

        let chunk: Value = serde_json::from_str(&frame.data)
            .map_err(|e| AgentError::parse(format!("malformed stream chunk: {}", e)))?;
        if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
            return Err(AgentError::parse(format!("backend reported an error: {}", error)));
        }
        debug!(chunk = %frame.data, "openai stream chunk");
        self.decode_chunk(&chunk, &mut events)?;
        Ok(events)
    }
}
