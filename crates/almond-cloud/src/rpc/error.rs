//! Errors surfaced by the control channel.

use std::time::Duration;

use almond_protocol::{RemoteError, error_codes};
use thiserror::Error;

/// Every way a remote call can fail.
///
/// Callers only need to tell three things apart: the backend is not there
/// ([`RpcError::is_backend_unavailable`]), the remote method itself failed
/// ([`RpcError::Remote`]), or the channel went away under the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No control channel is established.
    #[error("backend unavailable")]
    BackendUnavailable,

    /// The channel closed before the call completed.
    #[error("channel closed")]
    ChannelClosed,

    /// The target object was released or never existed.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The target object does not expose the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Arguments could not be decoded.
    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The remote method rejected, passed through verbatim.
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    /// The call did not complete in time.
    #[error("call to {method} timed out after {timeout:?}")]
    DeadlineExceeded { method: String, timeout: Duration },

    /// Too many calls are outstanding on the channel.
    #[error("too many outstanding calls (limit {limit})")]
    ResourceExhausted { limit: usize },

    /// A local delegate could not push to its socket.
    #[error("delegate failed: {0}")]
    Delegate(String),

    /// The peer answered with something this side cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    pub fn invalid_arguments(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            code: None,
        }
    }

    /// Stable code for this error, as carried on the wire.
    pub fn code(&self) -> &str {
        match self {
            Self::BackendUnavailable => error_codes::BACKEND_UNAVAILABLE,
            Self::ChannelClosed => error_codes::CHANNEL_CLOSED,
            Self::ObjectNotFound(_) => error_codes::OBJECT_NOT_FOUND,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidArguments { .. } => error_codes::INVALID_ARGS,
            Self::Remote { code, .. } => code.as_deref().unwrap_or(error_codes::INTERNAL),
            Self::DeadlineExceeded { .. } => error_codes::TIMEOUT,
            Self::ResourceExhausted { .. } => error_codes::RESOURCE_EXHAUSTED,
            Self::Delegate(_) => error_codes::DELEGATE_FAILED,
            Self::Protocol(_) => error_codes::INTERNAL,
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        self.code() == error_codes::BACKEND_UNAVAILABLE
    }

    /// Whether retrying on a fresh connection could succeed.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::BackendUnavailable | Self::ChannelClosed)
    }

    /// Encode for the peer that issued the failing call.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote { message, code } => RemoteError {
                message: message.clone(),
                code: code.clone(),
            },
            other => RemoteError {
                message: other.to_string(),
                code: Some(other.code().to_string()),
            },
        }
    }

    /// Decode an error received for one of our calls.
    ///
    /// The not-found codes map back onto their variants so callers can match
    /// on them; everything else stays verbatim.
    pub fn from_remote(error: RemoteError) -> Self {
        match error.code.as_deref() {
            Some(error_codes::OBJECT_NOT_FOUND) => Self::ObjectNotFound(
                error
                    .message
                    .strip_prefix("object not found: ")
                    .unwrap_or(&error.message)
                    .to_string(),
            ),
            Some(error_codes::METHOD_NOT_FOUND) => Self::MethodNotFound(
                error
                    .message
                    .strip_prefix("method not found: ")
                    .unwrap_or(&error.message)
                    .to_string(),
            ),
            _ => Self::Remote {
                message: error.message,
                code: error.code,
            },
        }
    }
}
