//! Error taxonomy shared across the memory crates.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the memory system.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The session does not exist or has already ended. 404-class.
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// Invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Storage operation failed; the enclosing transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM transport failure after retries. Extraction falls back to rules.
    #[error("llm error: {0}")]
    TransientLlm(String),

    /// LLM output did not match the requested structure. Not retried.
    #[error("llm schema error: {0}")]
    Schema(String),

    /// The operation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
