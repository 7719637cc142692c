//! Error taxonomy shared by the transport, session, and supervisor layers.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced by the secure chat stream.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Certificate, key, or trust anchor could not be read. Raised before any socket is opened.
    #[error("credential not found at {path}: {source}")]
    CredentialNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Credential file was readable but held no usable PEM material.
    #[error("invalid credential at {path}: {reason}")]
    InvalidCredential { path: PathBuf, reason: String },

    /// Peer untrusted, TLS failure, or protocol banner mismatch.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A user-initiated send could not be enqueued or written.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// A send attempted after the receive path already failed, and it failed too.
    #[error("send failed after receive-path failure: {0}")]
    SendAfterFailure(String),

    /// Peer-reported or transport-detected fault on the receive path.
    #[error("receive error: {0}")]
    ReceiveError(String),

    /// Graceful teardown exceeded its bound and was forced.
    #[error("teardown did not finish within {0:?}")]
    TeardownTimeout(Duration),

    /// A peer sent a line longer than the frame limit.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// A credential the selected mode needs was not supplied.
    #[error("no {0} configured")]
    CredentialNotConfigured(&'static str),

    /// Application code tried to send as the reserved heartbeat sender.
    #[error("sender id \"heartbeat\" is reserved for liveness messages")]
    ReservedSenderId,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_credential_names_what_is_missing() {
        let err = ChatError::CredentialNotConfigured("trust anchor");
        assert_eq!(err.to_string(), "no trust anchor configured");
    }

    #[test]
    fn credential_error_names_the_path() {
        let err = ChatError::CredentialNotFound {
            path: PathBuf::from("/etc/chat/client.pem"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/etc/chat/client.pem"));
    }
}
