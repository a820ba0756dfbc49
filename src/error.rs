use thiserror::Error;

/// Errors surfaced by graph operations.
///
/// Mutations and merges never fail; a record that loses or is not wanted
/// simply has no effect. Only one-shot reads and JSON import/export return
/// errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Request took longer than {wait_ms}ms to resolve")]
    Timeout { wait_ms: u64 },

    #[error("Graph dropped before the read resolved")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
