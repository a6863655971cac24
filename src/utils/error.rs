use thiserror::Error;

/// Errors raised while compiling a policy or applying it to the filter engine
#[derive(Error, Debug)]
pub enum FirewallError {
    /// Malformed address, range, CIDR, MAC, port or time syntax
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Syntactically valid input in a notation the compiler does not handle
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Rule compilation attempted before the table/chain exist
    #[error("Precondition failed: {0}")]
    PreconditionError(String),

    /// The filter engine rejected a table, chain, set or rule
    #[error("Engine error: {0}")]
    EngineError(String),

    /// An external command could not be run or exited non-zero
    #[error("Command `{command}` failed: {detail}")]
    ExecutionError { command: String, detail: String },

    /// Error from I/O operations
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl FirewallError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        FirewallError::ParseError(msg.into())
    }

    pub(crate) fn engine(msg: impl Into<String>) -> Self {
        FirewallError::EngineError(msg.into())
    }
}

/// Result type for the library
pub type FirewallResult<T> = Result<T, FirewallError>;
