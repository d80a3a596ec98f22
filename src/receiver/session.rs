//! Receiver session loop: single active connection, signal-driven shutdown.
//!
//! Grounded on `server/server.c` (`create_new_connection`'s at-most-one-connection enforcement,
//! `_connection_callback`/`reject_connection`, `_signal_callback`'s SIGPIPE-vs-SIGINT/SIGTERM
//! split, `event_loop`), restructured around `tokio::select!` the way
//! `conmon-rs/server/src/server.rs::start_backend` restructures the teacher's own accept loop.

use crate::error::Result;
use crate::lock::LockFile;
use crate::protocol::{Code, Frame, Message, Payload};
use crate::receiver::state::FileMachine;
use crate::signals::Signals;
use crate::{config::Config, net};
use nix::sys::statvfs::statvfs;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

struct ActiveConnection {
    stream: TcpStream,
    frame: Frame,
    machine: FileMachine,
}

/// Run the receiver role to completion: bind, accept one connection at a time, serve until a
/// shutdown signal arrives.
pub async fn run(target: PathBuf, port: u16) -> Result<()> {
    let lock = LockFile::acquire(Config::lock_path(&target))
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;
    debug!(path = %lock.path().display(), "acquired target lock");

    let fs_block_size = statvfs(&target)
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?
        .block_size();

    let listener = net::bind(port)
        .await
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;
    info!(port, "listening");

    let mut signals =
        Signals::install().map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;
    let mut active: Option<ActiveConnection> = None;

    loop {
        let next_msg = async {
            match &mut active {
                Some(a) => Some(a.frame.read(&mut a.stream).await),
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                if active.is_some() {
                    info!(%peer, "rejecting concurrent connection");
                    let _ = Frame::send(&mut stream, &Message::empty(Code::Rejected)).await;
                    continue;
                }
                info!(%peer, "accepted connection");
                if Frame::send(&mut stream, &Message {
                    code: Code::Settings,
                    payload: Payload::Settings { fs_block_size: fs_block_size as u64 },
                }).await.is_err() {
                    continue;
                }
                active = Some(ActiveConnection {
                    stream,
                    frame: Frame::new(),
                    machine: FileMachine::new(target.clone()),
                });
            }

            msg = next_msg => {
                let Some(result) = msg else { unreachable!() };
                match result {
                    Ok(msg) if msg.code == Code::EndConnection => {
                        info!("peer ended the session");
                        active = None;
                    }
                    Ok(msg) => {
                        if let Some(conn) = &mut active {
                            let fs_block_size = fs_block_size as u64;
                            match conn.machine.handle(msg, fs_block_size) {
                                Ok(replies) => {
                                    for reply in replies {
                                        if Frame::send(&mut conn.stream, &reply).await.is_err() {
                                            active = None;
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "aborting session");
                                    let errno = io_errno(&e);
                                    let _ = Frame::send(&mut conn.stream, &Message {
                                        code: Code::Abort,
                                        payload: Payload::Abort { errno },
                                    }).await;
                                    active = None;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "connection closed");
                        active = None;
                    }
                }
            }

            _ = signals.pipe.recv() => {
                warn!("SIGPIPE: closing active connection");
                active = None;
            }

            _ = signals.int.recv() => {
                info!("SIGINT: shutting down");
                drain(active, &mut signals, fs_block_size as u64).await;
                return Ok(());
            }

            _ = signals.term.recv() => {
                info!("SIGTERM: shutting down");
                drain(active, &mut signals, fs_block_size as u64).await;
                return Ok(());
            }
        }
    }
}

/// Finish serving an in-flight connection (if any) without accepting new ones, then return.
async fn drain(mut active: Option<ActiveConnection>, signals: &mut Signals, fs_block_size: u64) {
    let Some(conn) = &mut active else { return };
    loop {
        tokio::select! {
            result = conn.frame.read(&mut conn.stream) => {
                match result {
                    Ok(msg) if msg.code == Code::EndConnection => return,
                    Ok(msg) => {
                        if let Ok(replies) = conn.machine.handle(msg, fs_block_size) {
                            for reply in replies {
                                if Frame::send(&mut conn.stream, &reply).await.is_err() {
                                    return;
                                }
                            }
                        } else {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
            _ = signals.pipe.recv() => return,
            _ = signals.int.recv() => return,
            _ = signals.term.recv() => return,
        }
    }
}

fn io_errno(e: &crate::error::Error) -> i32 {
    match e {
        crate::error::Error::Io(io) => io.raw_os_error().unwrap_or(0),
        _ => 0,
    }
}
