use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by tool handlers and the registry.
///
/// These never end a turn: the executor folds them into an error tool result
/// that is sent back to the model.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),
}

pub type ToolCallResult<T> = Result<T, ToolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Backend returned status {status} after {attempts} attempts: {body}")]
    Status {
        status: u16,
        body: String,
        attempts: u32,
    },

    #[error("Request failed after {attempts} attempts: {message}")]
    Io { message: String, attempts: u32 },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to parse backend response: {0}")]
    ProtocolParse(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn parse<S: Into<String>>(message: S) -> Self {
        AgentError::ProtocolParse(message.into())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_messages() {
        assert_eq!(
            ToolError::ToolNotFound("frobnicate".into()).to_string(),
            "Unknown tool: frobnicate"
        );
        assert_eq!(
            ToolError::InvalidParameters("missing 'path'".into()).to_string(),
            "Invalid parameters: missing 'path'"
        );
    }

    #[test]
    fn test_transport_error_converts_into_agent_error() {
        let err: AgentError = TransportError::Status {
            status: 500,
            body: "boom".into(),
            attempts: 3,
        }
        .into();
        assert!(matches!(
            err,
            AgentError::Transport(TransportError::Status { status: 500, .. })
        ));
        assert_eq!(
            err.to_string(),
            "Backend returned status 500 after 3 attempts: boom"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing("api_key");
        assert_eq!(err.to_string(), "Missing required setting: api_key");
    }
}
