use boyka::agent::{AgentEvent, TurnOutcome};
use boyka::models::content::{ToolResult, ToolUse};
use console::style;
use serde_json::Value;
use std::io::{self, Write};

const MAX_PREVIEW_LENGTH: usize = 200;
const INDENT: &str = "    ";

pub fn event(event: &AgentEvent) {
    match event {
        AgentEvent::Text(text) => {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        AgentEvent::ToolCall(call) => tool_call(call),
        AgentEvent::ToolResult(result) => tool_result(result),
        AgentEvent::Notice(notice) => notice_line(notice),
    }
}

fn tool_call(call: &ToolUse) {
    println!();
    println!("{}", style(format!("─── {} ───", call.name)).magenta().dim());
    if let Value::Object(arguments) = &call.arguments {
        for (key, value) in arguments {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            println!(
                "{}{}: {}",
                INDENT,
                style(key).dim(),
                style(preview(&value)).green()
            );
        }
    }
}

fn tool_result(result: &ToolResult) {
    if result.is_error {
        println!("{}{}", INDENT, style(preview(&result.output)).red());
    } else {
        println!("{}{}", INDENT, style(preview(&result.output)).dim());
    }
    println!();
}

pub fn notice_line(notice: &str) {
    println!();
    println!("{}", style(notice).yellow());
}

pub fn error(message: &str) {
    eprintln!("{} {}", style("error:").red().bold(), style(message).red());
}

pub fn finish(outcome: &TurnOutcome) {
    println!();
    if let Some(total) = outcome.usage.total_tokens {
        tracing::info!(rounds = outcome.rounds, tokens = total, "turn finished");
    }
}

fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    let mut preview: String = first_line.chars().take(MAX_PREVIEW_LENGTH).collect();
    if preview.len() < text.len() {
        preview.push_str(" ...");
    }
    preview
}
