use thiserror::Error;

#[derive(Debug, Error)]
pub enum InkflowError {
    // Graph construction errors
    #[error("Graph configuration error: {0}")]
    GraphConfiguration(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // Run errors
    #[error("Router on '{node}' returned undeclared label '{label}'")]
    Routing { node: String, label: String },

    #[error("Recursion limit of {0} steps reached")]
    RecursionLimitExceeded(usize),

    #[error("Node '{node}' failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: Box<InkflowError>,
    },

    #[error("Node panicked: {0}")]
    Panic(String),

    #[error("Run cancelled")]
    Cancelled,

    // Model errors
    #[error("Model request failed: {0}")]
    Model(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Output errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Blocked by guardrail {guard}: {reason}")]
    GuardrailBlocked { guard: String, reason: String },

    // Storage errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InkflowError {
    /// Wrap an error raised inside a node, keeping the node name.
    pub fn node_failed(node: impl Into<String>, source: InkflowError) -> Self {
        Self::NodeFailed {
            node: node.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error, unwrapping any `NodeFailed` layers (subgraphs nest them).
    pub fn root_cause(&self) -> &InkflowError {
        match self {
            Self::NodeFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, InkflowError>;
