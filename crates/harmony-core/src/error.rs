//! Error types for Harmony
//!
//! Every failure that can cross a component boundary is one of these
//! variants. Errors shown to the user always carry both a kind label and the
//! message, see [`HarmonyError::kind_label`].

use std::io;
use thiserror::Error;

/// Harmony error types
#[derive(Debug, Error)]
pub enum HarmonyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad credentials or a revoked access token
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The homeserver could not be reached at all (DNS, connect, timeout)
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Any other transport level failure
    #[error("Network error: {0}")]
    Network(String),

    /// The homeserver answered with something we do not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event of a type or msgtype the pipeline does not render
    #[error("Unsupported event {event_type}: {payload}")]
    UnsupportedEvent { event_type: String, payload: String },

    /// Event missing mandatory fields
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Account is not (or no longer) registered
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// Room is not known for the account
    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    /// Matrix identifier failed to parse
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Command failed while executing
    #[error("Command error: {0}")]
    Command(String),

    /// Command name is not in the command table
    #[error("Command not found: `/{0}`. Prepend `/` or `\\` to ignore command parsing, e.g. `//{0}` or `\\/{0}`.")]
    CommandNotFound(String),

    /// Credential file could not be read or written
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for Harmony operations
pub type Result<T> = std::result::Result<T, HarmonyError>;

impl HarmonyError {
    /// Short stable label used in user-visible error text and the error log.
    pub fn kind_label(&self) -> &'static str {
        match self {
            HarmonyError::Config(_) => "config",
            HarmonyError::Auth(_) => "auth",
            HarmonyError::Unreachable(_) => "unreachable",
            HarmonyError::Network(_) => "network",
            HarmonyError::Protocol(_) => "protocol",
            HarmonyError::UnsupportedEvent { .. } => "unsupported-event",
            HarmonyError::MalformedEvent(_) => "malformed-event",
            HarmonyError::UnknownAccount(_) => "unknown-account",
            HarmonyError::UnknownRoom(_) => "unknown-room",
            HarmonyError::InvalidId(_) => "invalid-id",
            HarmonyError::Command(_) => "command",
            HarmonyError::CommandNotFound(_) => "command-not-found",
            HarmonyError::Credentials(_) => "credentials",
            HarmonyError::Serialization(_) => "serialization",
            HarmonyError::Io(_) => "io",
            HarmonyError::Timeout(_) => "timeout",
            HarmonyError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Sync listeners reconnect on these and give up on everything else.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarmonyError::Unreachable(_) | HarmonyError::Network(_) | HarmonyError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for HarmonyError {
    fn from(err: serde_json::Error) -> Self {
        HarmonyError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HarmonyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HarmonyError::Timeout(err.to_string())
    }
}

impl From<figment::Error> for HarmonyError {
    fn from(err: figment::Error) -> Self {
        HarmonyError::Config(err.to_string())
    }
}

impl From<ruma::IdParseError> for HarmonyError {
    fn from(err: ruma::IdParseError) -> Self {
        HarmonyError::InvalidId(err.to_string())
    }
}
