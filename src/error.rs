//! Error types for mail triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Mail provider error: {0}")]
    Mail(#[from] MailError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse template dataset: {0}")]
    Dataset(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Mail provider unreachable: {0}")]
    Network(String),

    #[error("Mail provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected mail provider payload: {0}")]
    Parse(String),
}

/// Errors raised while pulling the inbox into the store.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to fetch inbox: {0}")]
    Fetch(#[from] MailError),
}

/// Lifecycle transition errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Email {id} not found")]
    NotFound { id: String },

    #[error("Email {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The stored status moved on between the read and the write.
    #[error("Email {id} is no longer {expected}")]
    Conflict { id: String, expected: String },

    #[error("store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Per-record delivery failures. Display strings are surfaced to reviewers verbatim.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Email {id} not found")]
    NotFound { id: String },

    #[error("Email {id} is {status}, only Responded or Edited emails can be approved")]
    NotEligible { id: String, status: String },

    #[error("{0}")]
    Response(String),

    #[error("no recipient")]
    NoRecipient,

    #[error("empty body")]
    EmptyBody,

    #[error("folder resolution failed: {0}")]
    Folder(MailError),

    #[error("send failed: {0}")]
    SendFailed(MailError),

    #[error("sent message not found")]
    SentMessageNotFound,

    #[error("sent items lookup failed: {0}")]
    SentLookup(MailError),

    #[error("move failed: {0}")]
    MoveFailed(MailError),

    #[error("store error: {0}")]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Reasons a reply could not be composed. Recorded in the reply's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Could not generate query")]
    NoQuery,

    #[error("No matching client found")]
    NoRecord,

    #[error("No suitable template found")]
    NoTemplate,

    #[error("Record lookup failed: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
