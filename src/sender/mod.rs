//! Sender role: initial sync followed by an optional live watch loop.

pub mod sequences;
pub mod traversal;
pub mod watch;

use crate::error::Result;
use crate::net;
use crate::protocol::{Code, Frame, Message, Payload};
use crate::signals::Signals;
use std::path::Path;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use traversal::Entry;
use watch::{Action, WatchEngine};

/// A connected session to the receiver: the byte stream plus the settings it sent us.
pub struct Connection {
    stream: TcpStream,
    frame: Frame,
    /// Receiver's target filesystem block size; used as our write-chunk size.
    pub fs_block_size: u64,
    /// Whether to send all-zero blocks as sparse holes.
    pub sparse: bool,
}

impl Connection {
    /// Connect to `host:port` and read the initial `SETTINGS` frame.
    pub async fn establish(host: &str, port: u16, sparse: bool) -> Result<Self> {
        let mut stream = net::connect(host, port)
            .await
            .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;
        let mut frame = Frame::new();
        let settings = frame.read(&mut stream).await?;
        let fs_block_size = match settings.payload {
            Payload::Settings { fs_block_size } => fs_block_size,
            _ => {
                return Err(crate::error::Error::Protocol(
                    crate::error::ProtocolError::UnexpectedReply {
                        got: settings.code as u8,
                        expected: &[Code::Settings as u8],
                    },
                ))
            }
        };
        Ok(Self {
            stream,
            frame,
            fs_block_size,
            sparse,
        })
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        Frame::send(&mut self.stream, msg).await
    }

    /// Receive one message.
    pub async fn recv(&mut self) -> Result<Message> {
        self.frame.read(&mut self.stream).await
    }
}

/// Run the sender role to completion: connect, sync once, then watch unless `one_shot`.
pub async fn run(host: &str, source: &Path, port: u16, sparse: bool, one_shot: bool) -> Result<()> {
    let mut conn = Connection::establish(host, port, sparse).await?;
    info!(host, port, "connected to receiver");

    let entries = traversal::walk(source).await?;
    info!(count = entries.len(), "initial sync starting");
    for entry in &entries {
        match sequences::create(&mut conn, entry).await {
            Ok(_) => debug!(path = %entry.rel_path, "synced"),
            Err(e) => return Err(e),
        }
    }
    info!("initial sync complete");

    if one_shot {
        conn.send(&Message::empty(Code::EndConnection)).await?;
        return Ok(());
    }

    watch(conn, source, entries).await
}

async fn watch(mut conn: Connection, source: &Path, entries: Vec<Entry>) -> Result<()> {
    let mut engine = WatchEngine::new(
        source,
        entries.iter().map(|e| e.abs_path.clone()).collect::<Vec<_>>(),
    )?;
    let mut signals = Signals::install().map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;

    info!("watching for changes");
    loop {
        tokio::select! {
            event = engine.next_event() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(e) => { warn!(error = %e, "watch error"); continue; }
                };
                for action in watch::classify(&event) {
                    if let Err(e) = handle_action(&mut conn, &mut engine, source, action).await {
                        error!(error = %e, "fatal error handling watch event");
                        return Err(e);
                    }
                }
            }
            _ = signals.int.recv() => {
                info!("received SIGINT, ending session");
                break;
            }
            _ = signals.term.recv() => {
                info!("received SIGTERM, ending session");
                break;
            }
            _ = signals.pipe.recv() => {
                warn!("receiver closed the connection");
                return Err(crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "receiver closed the connection",
                )));
            }
        }
    }

    conn.send(&Message::empty(Code::EndConnection)).await?;
    Ok(())
}

async fn handle_action(
    conn: &mut Connection,
    engine: &mut WatchEngine,
    source: &Path,
    action: Action,
) -> Result<()> {
    match action {
        Action::Create(path) => {
            let entry = entry_for(source, &path);
            sequences::create(conn, &entry).await?;
            engine.add(path)?;
        }
        Action::DeleteRecreate(path) => {
            let entry = entry_for(source, &path);
            sequences::delete_and_recreate(conn, &entry).await?;
        }
        Action::Change(path) => {
            let entry = entry_for(source, &path);
            sequences::change(conn, &entry).await?;
        }
        Action::Delete(path) => {
            let entry = entry_for(source, &path);
            sequences::delete(conn, &entry.rel_path).await?;
            engine.remove(&path);
        }
    }
    Ok(())
}

fn entry_for(source: &Path, abs_path: &Path) -> Entry {
    let rel_path = abs_path
        .strip_prefix(source)
        .unwrap_or(abs_path)
        .to_string_lossy()
        .into_owned();
    Entry {
        rel_path,
        abs_path: abs_path.to_path_buf(),
    }
}
