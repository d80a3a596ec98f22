//! Wire protocol: message codes, fixed-layout payload encoding, and framing.
//!
//! Every frame on the stream is `[code: u8][payload_size: u64 BE][payload]`. Codes whose payload
//! is a fixed set of integer fields (`ABORT`, `SETTINGS`, `SET_PERM_MODES`, `SET_OWNER`,
//! `SET_TIMESTAMPS`) are transmitted as that many big-endian `u64` arguments regardless of the
//! fields' native widths; `payload_size` for those codes is always `arg_count * 8`. Everything
//! else (paths, write blocks) passes its bytes through unchanged. The argument counts below come
//! directly from the original `PAYLOAD_CONV` table.

use crate::error::{Error, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Number of message codes, one past the highest legal discriminant.
pub const COUNT: u8 = 14;

/// Size of the frame header: one discriminant byte plus an 8-byte big-endian length.
const HEADER_LEN: usize = 9;

/// Message discriminants, in wire order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Code {
    /// Acknowledgement of a request.
    Ok = 0,
    /// Soft refusal of a request; the sequence continues.
    Nok = 1,
    /// Fatal refusal; the session ends.
    Abort = 2,
    /// Receiver's target filesystem block size, sent once per connection.
    Settings = 3,
    /// Begin creating a new file.
    CreateFile = 4,
    /// Set access/modification times on the file currently open.
    SetTimestamps = 5,
    /// Set permission bits on the file currently open.
    SetPermModes = 6,
    /// Set owning uid/gid on the file currently open.
    SetOwner = 7,
    /// A chunk of file content (empty payload = sparse hole of one block).
    WriteBlock = 8,
    /// End the current create/change sequence.
    Done = 9,
    /// End the session cleanly.
    EndConnection = 10,
    /// Remove a file.
    DeleteFile = 11,
    /// Begin modifying an existing file's metadata.
    ChangeFile = 12,
    /// A second connection attempt was refused.
    Rejected = 13,
}

impl TryFrom<u8> for Code {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        use Code::*;
        Ok(match value {
            0 => Ok_,
            1 => Nok,
            2 => Abort,
            3 => Settings,
            4 => CreateFile,
            5 => SetTimestamps,
            6 => SetPermModes,
            7 => SetOwner,
            8 => WriteBlock,
            9 => Done,
            10 => EndConnection,
            11 => DeleteFile,
            12 => ChangeFile,
            13 => Rejected,
            other => return Err(ProtocolError::UnknownMessage(other)),
        })
    }
}
// `Ok` collides with the prelude; alias the variant internally for the match above.
use Code::Ok as Ok_;

/// A POSIX timestamp pair as carried by `SET_TIMESTAMPS`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Timespec {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanosecond remainder.
    pub nsec: i64,
}

/// Message payloads. Variants map 1:1 to [`Code`] values.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// No payload.
    Empty,
    /// `ABORT` payload: the OS error number that ended the session.
    Abort {
        /// errno reported by the peer.
        errno: i32,
    },
    /// `SETTINGS` payload: target filesystem block size.
    Settings {
        /// Block size, used by the sender as its write-chunk size.
        fs_block_size: u64,
    },
    /// `CREATE_FILE`/`DELETE_FILE`/`CHANGE_FILE` payload: a relative path.
    Path(String),
    /// `SET_TIMESTAMPS` payload.
    SetTimestamps {
        /// Access time to apply.
        atime: Timespec,
        /// Modification time to apply.
        mtime: Timespec,
    },
    /// `SET_PERM_MODES` payload.
    SetPermModes {
        /// POSIX permission bits.
        mode: u32,
    },
    /// `SET_OWNER` payload.
    SetOwner {
        /// Owning user id.
        uid: u32,
        /// Owning group id.
        gid: u32,
    },
    /// `WRITE_BLOCK` payload: raw file bytes, or empty for a sparse hole.
    WriteBlock(Vec<u8>),
}

/// A fully decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The message's discriminant.
    pub code: Code,
    /// The message's payload.
    pub payload: Payload,
}

impl Message {
    /// Build an empty-payload message (`OK`, `NOK`, `DONE`, `END_CONNECTION`, `REJECTED`).
    pub fn empty(code: Code) -> Self {
        Self {
            code,
            payload: Payload::Empty,
        }
    }

    fn args(&self) -> Option<Vec<u64>> {
        Some(match &self.payload {
            Payload::Abort { errno } => vec![*errno as u32 as u64],
            Payload::Settings { fs_block_size } => vec![*fs_block_size],
            Payload::SetPermModes { mode } => vec![*mode as u64],
            Payload::SetOwner { uid, gid } => vec![*uid as u64, *gid as u64],
            Payload::SetTimestamps { atime, mtime } => vec![
                atime.sec as u64,
                atime.nsec as u64,
                mtime.sec as u64,
                mtime.nsec as u64,
            ],
            _ => return None,
        })
    }

    fn bytes_payload(&self) -> Option<std::borrow::Cow<'_, [u8]>> {
        match &self.payload {
            Payload::Path(p) => {
                let mut bytes = p.as_bytes().to_vec();
                bytes.push(0);
                Some(std::borrow::Cow::Owned(bytes))
            }
            Payload::WriteBlock(b) => Some(std::borrow::Cow::Borrowed(b)),
            _ => None,
        }
    }

    fn decode_fixed(code: Code, args: &[u64]) -> std::result::Result<Payload, ProtocolError> {
        Ok(match (code, args) {
            (Code::Abort, [errno]) => Payload::Abort {
                errno: *errno as u32 as i32,
            },
            (Code::Settings, [fs_block_size]) => Payload::Settings {
                fs_block_size: *fs_block_size,
            },
            (Code::SetPermModes, [mode]) => Payload::SetPermModes { mode: *mode as u32 },
            (Code::SetOwner, [uid, gid]) => Payload::SetOwner {
                uid: *uid as u32,
                gid: *gid as u32,
            },
            (Code::SetTimestamps, [a_sec, a_nsec, m_sec, m_nsec]) => Payload::SetTimestamps {
                atime: Timespec {
                    sec: *a_sec as i64,
                    nsec: *a_nsec as i64,
                },
                mtime: Timespec {
                    sec: *m_sec as i64,
                    nsec: *m_nsec as i64,
                },
            },
            _ => return Err(ProtocolError::StateViolation("payload argument count mismatch")),
        })
    }
}

/// Owned, grow-on-demand buffer backing one received frame.
///
/// Capacity never needs to shrink; [`Frame::read`] grows it lazily to fit the largest frame
/// seen so far.
#[derive(Debug, Default)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    /// Build an empty frame buffer, pre-sized to hold a header.
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; HEADER_LEN],
        }
    }

    fn ensure(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    /// Write one message to `writer`.
    pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
        if let Some(args) = msg.args() {
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.push(msg.code as u8);
            header.extend_from_slice(&((args.len() as u64) * 8).to_be_bytes());
            writer.write_all(&header).await?;
            for arg in args {
                writer.write_all(&arg.to_be_bytes()).await?;
            }
        } else {
            let bytes = msg
                .bytes_payload()
                .unwrap_or(std::borrow::Cow::Borrowed(&[]));
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.push(msg.code as u8);
            header.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
            writer.write_all(&header).await?;
            writer.write_all(&bytes).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Read one message from `reader`, growing this buffer as needed.
    pub async fn read<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let code = Code::try_from(header[0]).map_err(Error::Protocol)?;
        let payload_size = u64::from_be_bytes(header[1..9].try_into().unwrap()) as usize;

        self.ensure(payload_size);
        let body = &mut self.buf[..payload_size];
        reader.read_exact(body).await?;

        let payload = match fixed_arg_count(code) {
            Some(n) => {
                if payload_size != n * 8 {
                    return Err(Error::Protocol(ProtocolError::StateViolation(
                        "payload size does not match declared argument count",
                    )));
                }
                let args: Vec<u64> = body
                    .chunks_exact(8)
                    .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                    .collect();
                Message::decode_fixed(code, &args).map_err(Error::Protocol)?
            }
            None => match code {
                Code::CreateFile | Code::DeleteFile | Code::ChangeFile => {
                    let s = std::str::from_utf8(body)
                        .map_err(|_| {
                            Error::Protocol(ProtocolError::StateViolation("path is not valid utf-8"))
                        })?
                        .trim_end_matches('\0')
                        .to_owned();
                    Payload::Path(s)
                }
                Code::WriteBlock => Payload::WriteBlock(body.to_vec()),
                _ => Payload::Empty,
            },
        };

        Ok(Message { code, payload })
    }
}

fn fixed_arg_count(code: Code) -> Option<usize> {
    match code {
        Code::Abort => Some(1),
        Code::Settings => Some(1),
        Code::SetPermModes => Some(1),
        Code::SetOwner => Some(2),
        Code::SetTimestamps => Some(4),
        _ => None,
    }
}

/// Convenience constructor for a NUL-terminated path payload message.
pub fn path_message(code: Code, path: &str) -> Message {
    Message {
        code,
        payload: Payload::Path(path.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_settings() {
        let msg = Message {
            code: Code::Settings,
            payload: Payload::Settings {
                fs_block_size: 4096,
            },
        };
        let mut buf = Vec::new();
        Frame::send(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 8);

        let mut cursor = std::io::Cursor::new(buf);
        let mut frame = Frame::new();
        let decoded = frame.read(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn round_trips_set_owner() {
        let msg = Message {
            code: Code::SetOwner,
            payload: Payload::SetOwner { uid: 1, gid: 2 },
        };
        let mut buf = Vec::new();
        Frame::send(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let mut frame = Frame::new();
        assert_eq!(frame.read(&mut cursor).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn round_trips_path() {
        let msg = path_message(Code::CreateFile, "a/b");
        let mut buf = Vec::new();
        Frame::send(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let mut frame = Frame::new();
        assert_eq!(frame.read(&mut cursor).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn empty_write_block_is_sparse_hole() {
        let msg = Message {
            code: Code::WriteBlock,
            payload: Payload::WriteBlock(vec![]),
        };
        let mut buf = Vec::new();
        Frame::send(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        let mut cursor = std::io::Cursor::new(buf);
        let mut frame = Frame::new();
        assert_eq!(frame.read(&mut cursor).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let mut bytes = vec![200u8];
        bytes.extend_from_slice(&0u64.to_be_bytes());
        let mut cursor = std::io::Cursor::new(bytes);
        let mut frame = Frame::new();
        let err = frame.read(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownMessage(200))
        ));
    }
}
