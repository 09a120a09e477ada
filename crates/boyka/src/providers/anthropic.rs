use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::base::{
    CompletionReason, CompletionRequest, ParsedResponse, Provider, ToolDialect, Usage,
};
use super::configs::{AnthropicProviderConfig, BackendConfig};
use super::sse::SseFrame;
use super::stream::{BlockKind, StreamDecoder, StreamEvent};
use crate::errors::{AgentError, AgentResult, ConfigError, TransportError};
use crate::models::content::ContentBlock;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;

pub struct AnthropicProvider {
    config: AnthropicProviderConfig,
    headers: HeaderMap,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> AgentResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            header_value("api_key", config.backend.api_key())?,
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            header_value("anthropic_version", &config.anthropic_version)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self { config, headers })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];
        let input_tokens = usage["input_tokens"].as_i64().map(|v| v as i32);
        let output_tokens = usage["output_tokens"].as_i64().map(|v| v as i32);
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    fn stop_reason(reason: Option<&str>) -> CompletionReason {
        match reason {
            Some("end_turn") | Some("stop_sequence") => CompletionReason::Stop,
            Some("tool_use") => CompletionReason::ToolCallsPending,
            Some("max_tokens") => CompletionReason::MaxTokens,
            _ => CompletionReason::Unknown,
        }
    }

    fn messages_to_anthropic_spec(messages: &[Message]) -> Vec<Value> {
        let mut anthropic_messages = Vec::new();

        for message in messages {
            let role = match message.role {
                Role::User | Role::Tool => "user",
                Role::Assistant => "assistant",
                Role::System => {
                    debug!("dropping system message from history; the system prompt is sent separately");
                    continue;
                }
            };

            let content = match &message.content {
                MessageContent::Text(text) => json!(text),
                MessageContent::Blocks(blocks) => {
                    Value::Array(blocks.iter().map(Self::block_to_anthropic_spec).collect())
                }
            };

            anthropic_messages.push(json!({
                "role": role,
                "content": content
            }));
        }

        anthropic_messages
    }

    fn block_to_anthropic_spec(block: &ContentBlock) -> Value {
        match block {
            ContentBlock::Text(block) => json!({"type": "text", "text": block.text}),
            ContentBlock::ToolUse(tool_use) => json!({
                "type": "tool_use",
                "id": tool_use.id,
                "name": tool_use.name,
                "input": tool_use.arguments,
            }),
            ContentBlock::ToolResult(result) => json!({
                "type": "tool_result",
                "tool_use_id": result.tool_use_id,
                "content": result.output,
                "is_error": result.is_error,
            }),
        }
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> AgentResult<Vec<Value>> {
        let mut names = HashSet::new();
        tools
            .iter()
            .map(|tool| {
                if !names.insert(&tool.name) {
                    return Err(AgentError::Internal(format!(
                        "Duplicate tool name: {}",
                        tool.name
                    )));
                }
                Ok(json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema(),
                }))
            })
            .collect()
    }

    fn response_to_parsed(response: &Value) -> AgentResult<ParsedResponse> {
        if !response.is_object() {
            return Err(AgentError::parse(format!(
                "expected a JSON object, got: {}",
                response
            )));
        }
        if response["type"] == "error" {
            return Err(AgentError::parse(format!(
                "backend reported an error: {}",
                response["error"]
            )));
        }

        let mut blocks = Vec::new();
        for block in response["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => match block["text"].as_str() {
                    Some(text) => blocks.push(ContentBlock::text(text)),
                    None => warn!(%block, "skipping text block without text"),
                },
                Some("tool_use") => match (block["id"].as_str(), block["name"].as_str()) {
                    (Some(id), Some(name)) => {
                        let input = match &block["input"] {
                            Value::Null => json!({}),
                            input => input.clone(),
                        };
                        blocks.push(ContentBlock::tool_use(id, name, input));
                    }
                    _ => warn!(%block, "skipping tool_use block without id or name"),
                },
                other => debug!(kind = ?other, "ignoring unsupported content block"),
            }
        }

        Ok(ParsedResponse {
            blocks,
            reason: Self::stop_reason(response["stop_reason"].as_str()),
            role: response["role"].as_str().and_then(|r| r.parse().ok()),
            usage: Self::get_usage(response),
            invalid_arguments: Default::default(),
        })
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn config(&self) -> &BackendConfig {
        &self.config.backend
    }

    fn tool_dialect(&self) -> ToolDialect {
        ToolDialect::InputSchema
    }

    fn endpoint(&self) -> String {
        self.config.backend.url("v1/messages")
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn build_request(&self, request: &CompletionRequest<'_>) -> AgentResult<Value> {
        let mut payload = json!({
            "model": self.config.backend.model(),
            "max_tokens": self.config.backend.max_tokens(),
            "system": request.system,
            "messages": Self::messages_to_anthropic_spec(request.messages),
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(Self::tools_to_anthropic_spec(request.tools)?);
        }
        if request.stream {
            payload["stream"] = json!(true);
        }

        Ok(payload)
    }

    fn parse_response(&self, body: &Value) -> AgentResult<ParsedResponse> {
        Self::response_to_parsed(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder)
    }
}

fn header_value(field: &'static str, value: &str) -> AgentResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        ConfigError::Invalid {
            field,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Maps Anthropic's named SSE events one to one.
pub struct AnthropicStreamDecoder;

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> AgentResult<Vec<StreamEvent>> {
        let data: Value = serde_json::from_str(&frame.data)
            .map_err(|e| AgentError::parse(format!("malformed stream event data: {}", e)))?;
        let event_type = frame
            .event
            .as_deref()
            .or_else(|| data["type"].as_str())
            .unwrap_or_default();
        let index = || data["index"].as_u64().unwrap_or_default() as usize;

        let event = match event_type {
            "message_start" => StreamEvent::MessageStart {
                role: data["message"]["role"].as_str().and_then(|r| r.parse().ok()),
                usage: AnthropicProvider::get_usage(&data["message"]),
            },
            "content_block_start" => {
                let block = &data["content_block"];
                let kind = match block["type"].as_str() {
                    Some("text") => BlockKind::Text,
                    Some("tool_use") => match (block["id"].as_str(), block["name"].as_str()) {
                        (Some(id), Some(name)) => BlockKind::ToolUse {
                            id: id.to_string(),
                            name: name.to_string(),
                        },
                        _ => {
                            return Err(AgentError::parse(
                                "tool_use block start without id or name",
                            ))
                        }
                    },
                    other => BlockKind::Other(other.unwrap_or("unknown").to_string()),
                };
                let mut events = vec![StreamEvent::ContentBlockStart {
                    index: index(),
                    kind,
                }];
                if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                    events.push(StreamEvent::TextDelta {
                        index: index(),
                        text: text.to_string(),
                    });
                }
                return Ok(events);
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => StreamEvent::TextDelta {
                        index: index(),
                        text: delta["text"].as_str().unwrap_or_default().to_string(),
                    },
                    Some("input_json_delta") => StreamEvent::InputJsonDelta {
                        index: index(),
                        partial_json: delta["partial_json"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    },
                    other => {
                        debug!(kind = ?other, "ignoring unsupported delta");
                        return Ok(Vec::new());
                    }
                }
            }
            "content_block_stop" => StreamEvent::ContentBlockStop { index: index() },
            "message_delta" => StreamEvent::MessageDelta {
                reason: AnthropicProvider::stop_reason(data["delta"]["stop_reason"].as_str()),
                usage: AnthropicProvider::get_usage(&data),
            },
            "message_stop" => StreamEvent::MessageStop,
            "ping" => StreamEvent::Ping,
            "error" => {
                return Err(TransportError::StreamInterrupted(format!(
                    "backend sent an error event: {}",
                    data["error"]
                ))
                .into())
            }
            other => {
                debug!(event = other, "ignoring unknown stream event");
                return Ok(Vec::new());
            }
        };
        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::configs::BackendConfig;

    fn provider() -> AnthropicProvider {
        let backend = BackendConfig::builder()
            .api_key("test_api_key")
            .base_url("https://api.anthropic.com")
            .model("claude-3-sonnet-20240229")
            .max_tokens(1024)
            .build()
            .unwrap();
        AnthropicProvider::new(AnthropicProviderConfig::new(backend)).unwrap()
    }

    fn frame(event: &str, data: Value) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_headers_and_endpoint() {
        let provider = provider();
        assert_eq!(provider.endpoint(), "https://api.anthropic.com/v1/messages");
        assert_eq!(provider.headers()["x-api-key"], "test_api_key");
        assert_eq!(provider.headers()["anthropic-version"], "2023-06-01");
        assert_eq!(provider.tool_dialect(), ToolDialect::InputSchema);
    }

    #[test]
    fn test_build_request_uses_input_schema_dialect() -> AgentResult<()> {
        let tools = vec![Tool::new(
            "read_file",
            "Read a file",
            json!({"path": {"type": "string"}}),
            ["path"],
        )];
        let messages = vec![
            Message::user_text("Read a.txt"),
            Message::assistant().with_tool_use("toolu_1", "read_file", json!({"path": "a.txt"})),
            Message::tool().with_tool_result("toolu_1", "hello", false),
        ];

        let payload = provider().build_request(&CompletionRequest {
            system: "You are helpful.",
            messages: &messages,
            tools: &tools,
            stream: false,
        })?;

        assert_eq!(payload["model"], "claude-3-sonnet-20240229");
        assert_eq!(payload["max_tokens"], 1024);
        assert_eq!(payload["system"], "You are helpful.");
        assert!(payload.get("stream").is_none());
        assert_eq!(
            payload["tools"][0],
            json!({
                "name": "read_file",
                "description": "Read a file",
                "input_schema": {
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }
            })
        );
        assert_eq!(payload["messages"][0], json!({"role": "user", "content": "Read a.txt"}));
        assert_eq!(payload["messages"][1]["content"][0]["input"], json!({"path": "a.txt"}));
        assert_eq!(payload["messages"][2]["role"], "user");
        assert_eq!(
            payload["messages"][2]["content"][0],
            json!({
                "type": "tool_result",
                "tool_use_id": "toolu_1",
                "content": "hello",
                "is_error": false
            })
        );
        Ok(())
    }

    #[test]
    fn test_build_request_is_deterministic_and_omits_empty_tools() -> AgentResult<()> {
        let messages = vec![Message::user_text("hi")];
        let request = CompletionRequest {
            system: "sys",
            messages: &messages,
            tools: &[],
            stream: true,
        };
        let provider = provider();
        let first = provider.build_request(&request)?;
        assert_eq!(first, provider.build_request(&request)?);
        assert!(first.get("tools").is_none());
        assert_eq!(first["stream"], true);
        Ok(())
    }

    #[test]
    fn test_parse_response_text_and_tool_use() -> AgentResult<()> {
        let body = json!({
            "id": "msg_123",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "a.txt"}},
                {"type": "tool_use", "name": "missing_id"},
                {"type": "text", "text": null}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 15}
        });

        let parsed = provider().parse_response(&body)?;

        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.text(), "Let me check.");
        assert_eq!(parsed.tool_uses()[0].arguments, json!({"path": "a.txt"}));
        assert_eq!(parsed.reason, CompletionReason::ToolCallsPending);
        assert_eq!(parsed.role, Some(Role::Assistant));
        assert_eq!(parsed.usage, Usage::new(Some(12), Some(15), Some(27)));
        Ok(())
    }

    #[test]
    fn test_parse_response_stop_reasons() -> AgentResult<()> {
        let provider = provider();
        for (raw, expected) in [
            ("end_turn", CompletionReason::Stop),
            ("stop_sequence", CompletionReason::Stop),
            ("max_tokens", CompletionReason::MaxTokens),
            ("something_new", CompletionReason::Unknown),
        ] {
            let parsed = provider.parse_response(&json!({"content": [], "stop_reason": raw}))?;
            assert_eq!(parsed.reason, expected, "stop_reason {}", raw);
        }
        Ok(())
    }

    #[test]
    fn test_parse_response_errors() {
        let provider = provider();
        let err = provider
            .parse_response(&json!({"type": "error", "error": {"type": "overloaded_error"}}))
            .unwrap_err();
        assert!(matches!(err, AgentError::ProtocolParse(_)));
        assert!(provider.parse_response(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_stream_decoder_maps_events() -> AgentResult<()> {
        let mut decoder = AnthropicStreamDecoder;

        let events = decoder.decode(&frame(
            "message_start",
            json!({"type": "message_start", "message": {"role": "assistant", "usage": {"input_tokens": 5}}}),
        ))?;
        assert_eq!(
            events,
            vec![StreamEvent::MessageStart {
                role: Some(Role::Assistant),
                usage: Usage::new(Some(5), None, None)
            }]
        );

        let events = decoder.decode(&frame(
            "content_block_start",
            json!({"index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {}}}),
        ))?;
        assert_eq!(
            events,
            vec![StreamEvent::ContentBlockStart {
                index: 1,
                kind: BlockKind::ToolUse {
                    id: "toolu_1".into(),
                    name: "read_file".into()
                }
            }]
        );

        let events = decoder.decode(&frame(
            "content_block_delta",
            json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"pa"}}),
        ))?;
        assert_eq!(
            events,
            vec![StreamEvent::InputJsonDelta {
                index: 1,
                partial_json: "{\"pa".into()
            }]
        );

        let events = decoder.decode(&frame(
            "message_delta",
            json!({"delta": {"stop_reason": "max_tokens"}, "usage": {"output_tokens": 9}}),
        ))?;
        assert_eq!(
            events,
            vec![StreamEvent::MessageDelta {
                reason: CompletionReason::MaxTokens,
                usage: Usage::new(None, Some(9), None)
            }]
        );

        assert!(decoder
            .decode(&frame("something_else", json!({})))?
            .is_empty());
        Ok(())
    }

    #[test]
    fn test_stream_decoder_errors() {
        let mut decoder = AnthropicStreamDecoder;
        let err = decoder
            .decode(&SseFrame {
                event: Some("content_block_delta".into()),
                data: "{not json".into(),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::ProtocolParse(_)));

        let err = decoder
            .decode(&frame("error", json!({"error": {"type": "overloaded_error"}})))
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Transport(TransportError::StreamInterrupted(_))
        ));
    }
}
