//! Typed error taxonomy shared by the sender and the receiver.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error kind.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall or stream I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A protocol-level contract was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The receiver aborted the session.
    #[error("target aborted the session (errno {errno})")]
    TargetAbort {
        /// The OS error number reported by the peer.
        errno: i32,
    },
}

/// Protocol-contract violations, always fatal to the current session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame header carried a discriminant outside `[OK, COUNT)`.
    #[error("received unknown message code {0}")]
    UnknownMessage(u8),

    /// A reply was received that is not legal at this point in a sequence.
    #[error("unexpected reply {got:?}, expected one of {expected:?}")]
    UnexpectedReply {
        /// The code actually received.
        got: u8,
        /// The codes that would have been legal.
        expected: &'static [u8],
    },

    /// A command arrived while the file-state machine was in an incompatible state.
    #[error("{0}")]
    StateViolation(&'static str),

    /// The source directory held an entry nested more than one level deep.
    #[error("source directory has entries nested more than one level deep")]
    UnsupportedDepth,
}
