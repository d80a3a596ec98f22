//! Signal streams shared by the sender and receiver event loops.
//!
//! `tokio::select!` over these streams, the socket, and (on the sender) the filesystem-watch
//! channel realizes the event multiplexer: one wake dispatches to exactly one arm, which runs to
//! completion before the loop waits again. This stands in for the original's poll(2)-based
//! multiplexer plus a dedicated signalfd; see `SPEC_FULL.md` §5 for the mapping rationale.

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};

/// The three signals both peers act on: graceful-shutdown requests and a broken pipe.
pub struct Signals {
    /// `SIGINT`: graceful shutdown.
    pub int: Signal,
    /// `SIGTERM`: graceful shutdown.
    pub term: Signal,
    /// `SIGPIPE`: the peer went away mid-write.
    pub pipe: Signal,
}

impl Signals {
    /// Install handlers for `SIGINT`, `SIGTERM`, `SIGPIPE`.
    pub fn install() -> Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            term: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
            pipe: signal(SignalKind::pipe()).context("install SIGPIPE handler")?,
        })
    }
}
