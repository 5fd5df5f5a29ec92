use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Structural errors, fatal to the whole run
    #[error("Flow graph contains a cycle: {}", cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<String> },

    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    // Per-node errors
    #[error("Invalid config for node {node}: {message}")]
    InvalidConfig { node: String, message: String },

    #[error("Verification failed: expected {expected}, got {actual}")]
    AssertionFailed {
        expected: serde_json::Value,
        actual: serde_json::Value,
    },

    #[error("Unsupported node kind: {0}")]
    UnsupportedNodeKind(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Build an `InvalidConfig` error for a node.
    pub fn invalid_config(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case category, reported alongside the message on node results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CyclicGraph { .. } => "cyclic_graph",
            Self::InvalidFlow(_) => "invalid_flow",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::AssertionFailed { .. } => "assertion_failed",
            Self::UnsupportedNodeKind(_) => "unsupported_node_kind",
            Self::Execution(_) => "execution_error",
            Self::Cancelled => "cancelled",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Database(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether this error aborts a whole run before any node executes.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::CyclicGraph { .. } | Self::InvalidFlow(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
