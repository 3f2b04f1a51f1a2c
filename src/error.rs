//! Error taxonomy for the interaction protocol.

use thiserror::Error;

/// Errors surfaced by the codec, framer, sender and agent.
#[derive(Debug, Error)]
pub enum Error {
    /// Text that does not parse as one of the supported literal kinds.
    #[error("malformed literal: {0}")]
    MalformedLiteral(String),

    /// End of stream (or of a payload pipe) in the middle of a message.
    #[error("message truncated by end of stream")]
    TruncatedMessage,

    /// Descriptors were requested over a transport that cannot carry them.
    #[error("transport cannot carry file descriptors")]
    TransportIncapable,

    /// A well-formed literal with the wrong shape for the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A responder handler failed; the session is over.
    #[error("responder failed: {0:#}")]
    Responder(anyhow::Error),

    /// The stream closed without the end command. Carries the trailing text.
    #[error("interaction ended without ferny.end: {0}")]
    Unfinished(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Self {
        Error::Io(errno.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
