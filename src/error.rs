//! Component-boundary error types.
//!
//! Internal call sites that merely propagate use `anyhow::Result`; these
//! typed errors sit at the boundaries named in the error taxonomy (gateway,
//! retrieval, job store, pipeline) so callers can match on failure kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unrecognized provider: {0}")]
    UnknownProvider(String),
    #[error("provider {0} has no API key configured")]
    MissingKey(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding model not configured")]
    NoEmbeddingModel,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown job type: {0}")]
    UnknownJobType(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("tool context not configured")]
    NoContext,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no agent responded: missing API key(s) for provider(s): {0}")]
    NoAgentsResponded(String),
    #[error("unknown conversation")]
    UnknownConversation,
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}
