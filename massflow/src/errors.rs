//! Error types for the massflow pipeline runtime.
//!
//! Every concern has its own error enum; [`MassflowError`] is the root type
//! that all of them convert into.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for massflow operations.
#[derive(Debug, Error)]
pub enum MassflowError {
    /// Frame registration, startup or liveness failure.
    #[error("{0}")]
    Frame(#[from] FrameError),

    /// Channel transport failure.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Payload encoding or decoding failure.
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// Sockets routing failure.
    #[error("{0}")]
    Socket(#[from] SocketError),

    /// External collaborator failure.
    #[error("{0}")]
    Collaborator(#[from] CollaboratorError),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the bounded message channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The other side of the channel is gone.
    #[error("channel closed")]
    Closed,

    /// Nothing is bound at the address.
    #[error("no endpoint bound at address '{0}'")]
    UnknownAddress(String),

    /// The address has already been bound.
    #[error("address '{0}' is already bound")]
    AddressInUse(String),
}

/// Errors raised while turning payloads into wire messages and back.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The message body is not a valid payload.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The message is not a valid compressed frame.
    #[error("failed to decompress message: {0}")]
    Decompress(String),

    /// The message declares a body larger than the codec accepts.
    #[error("message body of {declared} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// The body size the message declares.
        declared: usize,
        /// The largest accepted body size.
        limit: usize,
    },

    /// The message was written with a different wire version.
    #[error("unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion {
        /// The version this build reads and writes.
        expected: u16,
        /// The version found in the message.
        found: u16,
    },
}

/// Errors raised by stage sockets when routing a payload.
#[derive(Debug, Error)]
pub enum SocketError {
    /// `send` was called on a stage without a default next stage.
    #[error("stage '{stage}' has no next stage configured")]
    NoNextStage {
        /// The sending stage.
        stage: String,
    },

    /// The target stage is not part of the frame.
    #[error("stage '{from}' tried to send to unknown stage '{target}'")]
    UnknownStage {
        /// The sending stage.
        from: String,
        /// The requested target.
        target: String,
    },

    /// `send_instructed` was called on a payload without a stage instruction.
    #[error("payload sent by stage '{stage}' carries no stage instruction")]
    MissingInstruction {
        /// The sending stage.
        stage: String,
    },

    /// The underlying channel failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SocketError {
    /// Returns true if the error means the channel is permanently gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}

/// Errors raised by the analysis frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A stage with this name was already registered.
    #[error("stage '{0}' is already registered")]
    DuplicateStage(String),

    /// The stage registration is invalid.
    #[error("invalid stage '{stage}': {reason}")]
    InvalidStage {
        /// The stage name.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A stage names a next stage that is not registered.
    #[error("stage '{stage}' routes to unknown next stage '{next_stage}'")]
    UnknownNextStage {
        /// The routing stage.
        stage: String,
        /// The missing stage.
        next_stage: String,
    },

    /// The frame has no stages.
    #[error("frame has no stages")]
    Empty,

    /// A process-mode replica exited.
    #[error("replica {replica} of stage '{stage}' died: {reason}")]
    StageDied {
        /// The stage name.
        stage: String,
        /// The replica index.
        replica: usize,
        /// Panic message or exit reason.
        reason: String,
    },

    /// A relay exited.
    #[error("relay of stage '{stage}' died: {reason}")]
    RelayDied {
        /// The stage name.
        stage: String,
        /// Panic message or exit reason.
        reason: String,
    },

    /// The cooperative loop exited.
    #[error("cooperative stage loop died: {0}")]
    CooperativeLoopDied(String),

    /// A channel could not be bound.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The frame configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker thread or runtime could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised by external collaborators (work source, sinks, HTTP).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// No connection is registered under the alias.
    #[error("connection '{0}' is not registered")]
    UnknownConnection(String),

    /// The HTTP request failed.
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an unexpected status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The request URL.
        url: String,
    },

    /// The response body was not what we expected.
    #[error("invalid response from {url}: {reason}")]
    InvalidResponse {
        /// The request URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Reading a response took longer than allowed.
    #[error("request to {url} exceeded {limit:?}")]
    Timeout {
        /// The request URL.
        url: String,
        /// The time limit that was hit.
        limit: std::time::Duration,
    },

    /// The collaborator rejected the request.
    #[error("{0}")]
    Rejected(String),
}

/// Errors raised while building or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The configuration field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An environment variable could not be parsed.
    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv {
        /// The variable name.
        var: String,
        /// The raw value.
        value: String,
    },

    /// A required value is missing.
    #[error("missing required setting '{0}'")]
    Missing(String),
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage's channel is gone; the replica cannot continue.
    ChannelClosed,
    /// A routing or transport problem.
    Routing,
    /// A payload could not be encoded or decoded.
    Codec,
    /// An external collaborator failed.
    Collaborator,
    /// The stage's own logic failed.
    Stage,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "channel_closed"),
            Self::Routing => write!(f, "routing"),
            Self::Codec => write!(f, "codec"),
            Self::Collaborator => write!(f, "collaborator"),
            Self::Stage => write!(f, "stage"),
        }
    }
}

/// The failure a stage function returns for one invocation.
///
/// Returning a failure drops the payload being processed. Stages that want the
/// payload reported must forward a failure-tagged copy themselves before
/// returning (see [`crate::stages::forward_failure_blocking`]).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct StageFailure {
    /// The failure category.
    pub kind: FailureKind,
    /// Human readable message.
    pub message: String,
    /// Additional context.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl StageFailure {
    /// Creates a failure of the stage's own logic.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(FailureKind::Stage, message)
    }

    /// Creates a failure of the given kind.
    #[must_use]
    pub fn with_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Returns true if the replica's channel is gone.
    #[must_use]
    pub fn is_channel_closed(&self) -> bool {
        self.kind == FailureKind::ChannelClosed
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

impl From<SocketError> for StageFailure {
    fn from(err: SocketError) -> Self {
        let kind = match &err {
            SocketError::Transport(TransportError::Closed) => FailureKind::ChannelClosed,
            SocketError::Codec(_) => FailureKind::Codec,
            _ => FailureKind::Routing,
        };
        Self::with_kind(kind, err.to_string())
    }
}

impl From<TransportError> for StageFailure {
    fn from(err: TransportError) -> Self {
        SocketError::from(err).into()
    }
}

impl From<CodecError> for StageFailure {
    fn from(err: CodecError) -> Self {
        Self::with_kind(FailureKind::Codec, err.to_string())
    }
}

impl From<CollaboratorError> for StageFailure {
    fn from(err: CollaboratorError) -> Self {
        Self::with_kind(FailureKind::Collaborator, err.to_string())
    }
}

/// Result type returned by every stage function.
pub type StageResult = Result<(), StageFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_socket_error_maps_to_channel_closed() {
        let failure = StageFailure::from(SocketError::from(TransportError::Closed));
        assert!(failure.is_channel_closed());
        assert_eq!(failure.kind, FailureKind::ChannelClosed);
    }

    #[test]
    fn test_routing_errors_are_not_terminal() {
        let err = SocketError::UnknownStage {
            from: "a".to_string(),
            target: "b".to_string(),
        };
        assert!(!err.is_closed());

        let failure = StageFailure::from(err);
        assert_eq!(failure.kind, FailureKind::Routing);
        assert!(failure.message.contains("unknown stage 'b'"));
    }

    #[test]
    fn test_stage_failure_display_and_dict() {
        let failure = StageFailure::new("bad sample").with_context_entry("sample", "abc");
        assert_eq!(failure.to_string(), "stage failure: bad sample");

        let dict = failure.to_dict();
        assert_eq!(dict.get("kind").unwrap(), "stage");
        assert_eq!(dict["context"]["sample"], "abc");
    }

    #[test]
    fn test_unsupported_version_message() {
        let err = CodecError::UnsupportedVersion {
            expected: 1,
            found: 7,
        };
        assert_eq!(err.to_string(), "unsupported wire version 7 (expected 1)");
    }

    #[test]
    fn test_frame_error_wraps_into_root() {
        let err: MassflowError = FrameError::DuplicateStage("report".to_string()).into();
        assert!(matches!(err, MassflowError::Frame(FrameError::DuplicateStage(_))));
        assert_eq!(err.to_string(), "stage 'report' is already registered");
    }
}
