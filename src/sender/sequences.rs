//! Per-file scripted request sequences.
//!
//! Grounded on `client/copy.c` (`client_copy_regular_file`, `get_op_response`) for the create
//! sequence, and `client/event.c`'s dispatch of watch events into `client_send_*` calls for the
//! change/delete/delete-rewrite sequences.

use crate::error::{Error, Result};
use crate::protocol::{path_message, Code, Message, Payload, Timespec};
use crate::sender::traversal::Entry;
use crate::sender::Connection;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Outcome of a per-file sequence: whether it actually ran to completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The receiver accepted the request chain.
    Completed,
    /// The receiver refused, non-fatally; no further steps were taken for this file.
    Skipped,
}

async fn expect(conn: &mut Connection, label: &str) -> Result<Outcome> {
    let reply = conn.recv().await?;
    match reply.code {
        Code::Ok => Ok(Outcome::Completed),
        Code::Nok => {
            warn!(step = label, "target refused request");
            Ok(Outcome::Skipped)
        }
        Code::Abort => {
            let errno = match reply.payload {
                Payload::Abort { errno } => errno,
                _ => 0,
            };
            Err(Error::TargetAbort { errno })
        }
        other => Err(Error::Protocol(crate::error::ProtocolError::UnexpectedReply {
            got: other as u8,
            expected: &[Code::Ok as u8, Code::Nok as u8, Code::Abort as u8],
        })),
    }
}

fn timestamps_of(meta: &std::fs::Metadata) -> (Timespec, Timespec) {
    (
        Timespec {
            sec: meta.atime(),
            nsec: meta.atime_nsec(),
        },
        Timespec {
            sec: meta.mtime(),
            nsec: meta.mtime_nsec(),
        },
    )
}

/// Run the create sequence for `entry`: `CREATE_FILE`, buffered metadata, file content, `DONE`,
/// then the three deferred metadata replies.
pub async fn create(conn: &mut Connection, entry: &Entry) -> Result<Outcome> {
    conn.send(&path_message(Code::CreateFile, &entry.rel_path))
        .await?;
    if expect(conn, "create_file").await? == Outcome::Skipped {
        return Ok(Outcome::Skipped);
    }

    let meta = tokio::fs::metadata(&entry.abs_path).await?;
    let (atime, mtime) = timestamps_of(&meta);

    conn.send(&Message {
        code: Code::SetTimestamps,
        payload: Payload::SetTimestamps { atime, mtime },
    })
    .await?;
    expect(conn, "set_timestamps (ack)").await?;

    conn.send(&Message {
        code: Code::SetPermModes,
        payload: Payload::SetPermModes {
            mode: meta.mode() & 0o777,
        },
    })
    .await?;
    expect(conn, "set_perm_modes (ack)").await?;

    conn.send(&Message {
        code: Code::SetOwner,
        payload: Payload::SetOwner {
            uid: meta.uid(),
            gid: meta.gid(),
        },
    })
    .await?;
    expect(conn, "set_owner (ack)").await?;

    write_blocks(conn, &entry.abs_path).await?;

    conn.send(&Message::empty(Code::Done)).await?;
    expect(conn, "done: timestamps").await?;
    expect(conn, "done: perm_modes").await?;
    expect(conn, "done: owner").await?;

    Ok(Outcome::Completed)
}

async fn write_blocks(conn: &mut Connection, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let block_size = conn.fs_block_size as usize;
    let mut buf = vec![0u8; block_size];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        let payload = if conn.sparse && chunk.iter().all(|b| *b == 0) {
            Vec::new()
        } else {
            chunk.to_vec()
        };
        conn.send(&Message {
            code: Code::WriteBlock,
            payload: Payload::WriteBlock(payload),
        })
        .await?;
        expect(conn, "write_block").await?;
    }

    Ok(())
}

/// Run one round of the change sequence for a single metadata field.
async fn change_round(conn: &mut Connection, rel_path: &str, set: Message) -> Result<Outcome> {
    conn.send(&path_message(Code::ChangeFile, rel_path)).await?;
    if expect(conn, "change_file").await? == Outcome::Skipped {
        return Ok(Outcome::Skipped);
    }

    conn.send(&set).await?;
    expect(conn, "change: set field").await?;

    conn.send(&Message::empty(Code::Done)).await?;
    // The receiver applies changes eagerly per SET_ call while `Changing`; no reply follows DONE.
    Ok(Outcome::Completed)
}

/// Run the full change sequence: three independent rounds, one per metadata field.
pub async fn change(conn: &mut Connection, entry: &Entry) -> Result<()> {
    let meta = tokio::fs::metadata(&entry.abs_path).await?;
    let (atime, mtime) = timestamps_of(&meta);

    change_round(
        conn,
        &entry.rel_path,
        Message {
            code: Code::SetTimestamps,
            payload: Payload::SetTimestamps { atime, mtime },
        },
    )
    .await?;

    change_round(
        conn,
        &entry.rel_path,
        Message {
            code: Code::SetOwner,
            payload: Payload::SetOwner {
                uid: meta.uid(),
                gid: meta.gid(),
            },
        },
    )
    .await?;

    change_round(
        conn,
        &entry.rel_path,
        Message {
            code: Code::SetPermModes,
            payload: Payload::SetPermModes {
                mode: meta.mode() & 0o777,
            },
        },
    )
    .await?;

    Ok(())
}

/// Run the delete sequence: `DELETE_FILE` alone.
pub async fn delete(conn: &mut Connection, rel_path: &str) -> Result<()> {
    conn.send(&path_message(Code::DeleteFile, rel_path)).await?;
    expect(conn, "delete_file").await?;
    Ok(())
}

/// Run the delete-then-rewrite sequence: `DELETE_FILE` followed by the full create sequence.
pub async fn delete_and_recreate(conn: &mut Connection, entry: &Entry) -> Result<Outcome> {
    delete(conn, &entry.rel_path).await?;
    create(conn, entry).await
}
