//! Socket bootstrap: listener bind / client connect.
//!
//! Generalized from the teacher's `listener.rs` long-path unix-socket handling to a plain TCP
//! listener/stream, since this protocol's CLI surface (`-p/--port`) takes a port, not a
//! filesystem socket path.

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

/// Bind a listening socket on `0.0.0.0:port`.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind to port {port}"))
}

/// Connect to `host:port`.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect to {host}:{port}"))
}
