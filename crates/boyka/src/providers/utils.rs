use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use super::base::{CompletionReason, ParsedResponse, Usage};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::ContentBlock;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// Convert internal messages to OpenAI chat messages.
///
/// Tool results fan out into one `tool` message each, right after whatever
/// text the same message carried.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::Tool => Role::User,
            role => role,
        };
        let mut converted = json!({ "role": role });
        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for block in message.blocks().iter() {
            match block {
                ContentBlock::Text(block) => {
                    if !block.text.is_empty() {
                        text.push(block.text.clone());
                    }
                }
                ContentBlock::ToolUse(tool_use) => {
                    tool_calls.push(json!({
                        "id": tool_use.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&tool_use.name),
                            "arguments": tool_use.arguments.to_string(),
                        }
                    }));
                }
                ContentBlock::ToolResult(result) => {
                    let content = if result.is_error {
                        // shown as output so the model can interpret the error message
                        format!(
                            "The tool call returned the following error:\n{}",
                            result.output
                        )
                    } else {
                        result.output.clone()
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": result.tool_use_id,
                    }));
                }
            }
        }

        if !text.is_empty() {
            converted["content"] = json!(text.join("\n"));
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
            if text.is_empty() {
                converted["content"] = Value::Null;
            }
        }
        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert tools to OpenAI's `function` tool dialect
pub fn tools_to_openai_spec(tools: &[Tool]) -> AgentResult<Vec<Value>> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(AgentError::Internal(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
                "parameters": tool.input_schema(),
            }
        }));
    }

    Ok(result)
}

pub fn openai_finish_reason(reason: Option<&str>) -> CompletionReason {
    match reason {
        Some("stop") => CompletionReason::Stop,
        Some("tool_calls") | Some("function_call") => CompletionReason::ToolCallsPending,
        Some("length") => CompletionReason::LengthTruncated,
        Some("content_filter") => CompletionReason::ContentFiltered,
        _ => CompletionReason::Unknown,
    }
}

/// Convert an OpenAI chat completion body into a [`ParsedResponse`].
///
/// A missing or empty `choices` list yields no blocks and an unknown reason.
/// Tool calls without an id or name are logged and skipped.
pub fn openai_response_to_parsed(response: &Value) -> AgentResult<ParsedResponse> {
    if !response.is_object() {
        return Err(AgentError::parse(format!(
            "expected a JSON object, got: {}",
            response
        )));
    }
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(AgentError::parse(format!("backend reported an error: {}", error)));
    }

    let usage = get_openai_usage(response);
    let Some(choice) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return Ok(ParsedResponse {
            usage,
            ..Default::default()
        });
    };

    let original = &choice["message"];
    let mut blocks = Vec::new();
    let mut invalid_arguments = HashMap::new();

    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str();
            let function_name = tool_call["function"]["name"].as_str();
            let (Some(id), Some(function_name)) = (id, function_name) else {
                warn!(%tool_call, "skipping tool call without id or name");
                continue;
            };

            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            if !is_valid_function_name(function_name) {
                invalid_arguments.insert(
                    id.to_string(),
                    format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        function_name
                    ),
                );
                blocks.push(ContentBlock::tool_use(id, function_name, json!({})));
                continue;
            }

            let params = if arguments.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                match serde_json::from_str::<Value>(arguments) {
                    Ok(params) => params,
                    Err(e) => {
                        invalid_arguments.insert(
                            id.to_string(),
                            format!(
                                "Could not interpret tool use parameters for id {}: {}",
                                id, e
                            ),
                        );
                        Value::Object(Map::new())
                    }
                }
            };
            blocks.push(ContentBlock::tool_use(id, function_name, params));
        }
    }

    let role = original
        .get("role")
        .and_then(Value::as_str)
        .and_then(|r| r.parse::<Role>().ok());

    Ok(ParsedResponse {
        blocks,
        reason: openai_finish_reason(choice.get("finish_reason").and_then(Value::as_str)),
        role,
        usage,
        invalid_arguments,
    })
}

pub fn get_openai_usage(data: &Value) -> Usage {
    let usage = &data["usage"];
    let read = |key: &str| usage.get(key).and_then(Value::as_i64).map(|v| v as i32);

    let input_tokens = read("prompt_tokens").or_else(|| read("input_tokens"));
    let output_tokens = read("completion_tokens").or_else(|| read("output_tokens"));
    let total_tokens = read("total_tokens").or(match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}
