use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A tool that can be offered to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool, unique within a registry
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of each parameter, keyed by parameter name
    pub parameters: Value,
    /// Names of the parameters the model must supply
    #[serde(default)]
    pub required: Vec<String>,
}

impl Tool {
    pub fn new<N, D, I, R>(name: N, description: D, parameters: Value, required: I) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            parameters,
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// The full object schema a backend expects for this tool's input.
    pub fn input_schema(&self) -> Value {
        let properties = match &self.parameters {
            Value::Object(_) => self.parameters.clone(),
            _ => Value::Object(Map::new()),
        };
        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_schema_includes_required_names() {
        let tool = Tool::new(
            "read_file",
            "Read a file",
            json!({"path": {"type": "string"}}),
            ["path"],
        );

        assert_eq!(
            tool.input_schema(),
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })
        );
    }

    #[test]
    fn test_input_schema_without_parameters() {
        let tool = Tool::new("list_files", "List files", Value::Null, Vec::<String>::new());
        let schema = tool.input_schema();
        assert_eq!(schema["properties"], json!({}));
        assert!(schema.get("required").is_none());
    }
}
