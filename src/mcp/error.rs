//! MCP error types

use thiserror::Error;

/// Errors raised by the tool front-end
#[derive(Debug, Error)]
pub enum McpError {
    /// A tool call failed; reported to the client as a tool result
    #[error("{message}")]
    Tool {
        /// Stable machine-readable code
        code: &'static str,
        /// Human-readable message
        message: String,
    },

    /// Reading stdin or writing stdout failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A response could not be serialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Tool failure with a code
    pub fn tool(code: &'static str, message: impl Into<String>) -> Self {
        McpError::Tool {
            code,
            message: message.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            McpError::Tool { code, .. } => code,
            McpError::Io(_) => "io_error",
            McpError::Json(_) => "internal_error",
        }
    }
}
