use serde::Serialize;
use tera::{Context, Error as TeraError, Tera};

/// The built-in system prompt. It expects `toolsets` and `context`.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("prompts/system.md");

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    tera.render("inline_template", &context)
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolsetInfo {
    pub name: String,
    pub description: String,
    pub instructions: String,
}

#[derive(Debug, Serialize)]
struct SystemPromptContext<'a> {
    toolsets: &'a [ToolsetInfo],
    context: &'a str,
}

/// Render a system prompt template with the project context substituted.
pub fn render_system_prompt(
    template: &str,
    toolsets: &[ToolsetInfo],
    context: &str,
) -> Result<String, TeraError> {
    load_prompt(template, &SystemPromptContext { toolsets, context })
}
