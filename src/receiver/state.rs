//! Receiver file-state machine.
//!
//! Grounded on `server/command.c` (`CMD(create_file)`, `CMD(change_file)`, `CMD(delete_file)`,
//! `CMD(set_timestamps)`/`CMD(set_perm_modes)`/`CMD(set_owner)`, `CMD(write_block)`'s sparse-hole
//! branch) and `server/operation.c`'s `done()` (the asymmetric Creating-vs-Changing `DONE`
//! behavior resolved as Open Question (a) in `DESIGN.md`).

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Code, Message, Payload, Timespec};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// The three raw syscalls `finish_creating`/`apply_*` issue against an open file descriptor,
/// isolated behind a trait so tests can exercise the `NOK`-on-failure branches without depending
/// on which of them the test-running uid happens to be allowed to perform.
#[cfg_attr(test, automock)]
pub trait MetadataOps {
    /// `futimens(2)`.
    fn futimens(&self, fd: RawFd, atime: TimeSpec, mtime: TimeSpec) -> nix::Result<()>;
    /// `fchmod(2)`.
    fn fchmod(&self, fd: RawFd, mode: Mode) -> nix::Result<()>;
    /// `fchown(2)`.
    fn fchown(&self, fd: RawFd, uid: Uid, gid: Gid) -> nix::Result<()>;
}

/// Real syscalls, via `nix`.
#[derive(Debug, Default)]
pub struct DefaultMetadataOps;

impl MetadataOps for DefaultMetadataOps {
    fn futimens(&self, fd: RawFd, atime: TimeSpec, mtime: TimeSpec) -> nix::Result<()> {
        nix::sys::stat::futimens(fd, &atime, &mtime)
    }

    fn fchmod(&self, fd: RawFd, mode: Mode) -> nix::Result<()> {
        nix::sys::stat::fchmod(fd, mode)
    }

    fn fchown(&self, fd: RawFd, uid: Uid, gid: Gid) -> nix::Result<()> {
        nix::unistd::fchown(fd, Some(uid), Some(gid))
    }
}

fn ok() -> Message {
    Message::empty(Code::Ok)
}

fn nok() -> Message {
    Message::empty(Code::Nok)
}

/// Pending metadata buffered during `Creating`, applied all at once on `DONE`.
#[derive(Debug, Default)]
struct Pending {
    timestamps: Option<(Timespec, Timespec)>,
    mode: Option<u32>,
    owner: Option<(u32, u32)>,
}

/// The file currently being created or changed, and which of the two it is.
enum Inner {
    Idle,
    Creating {
        file: File,
        path: PathBuf,
        pending: Pending,
    },
    Changing {
        file: File,
        path: PathBuf,
        applied: bool,
    },
}

/// Tracks which file (if any) is open, and applies incoming commands to the target directory.
pub struct FileMachine<M: MetadataOps = DefaultMetadataOps> {
    root: PathBuf,
    inner: Inner,
    ops: M,
}

impl FileMachine<DefaultMetadataOps> {
    /// Build a machine rooted at `target`, using the real `futimens`/`fchmod`/`fchown` syscalls.
    pub fn new(root: PathBuf) -> Self {
        Self::with_ops(root, DefaultMetadataOps)
    }
}

impl<M: MetadataOps> FileMachine<M> {
    /// Build a machine rooted at `target`, applying metadata through `ops` instead of the real
    /// syscalls. Used by tests to exercise the `NOK`-on-failure branches deterministically.
    pub fn with_ops(root: PathBuf, ops: M) -> Self {
        Self {
            root,
            inner: Inner::Idle,
            ops,
        }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Apply one incoming message, returning the reply frame(s) to send back.
    ///
    /// `fs_block_size` is the receiver's own settings value, used to advance a sparse hole by
    /// exactly one block on an empty `WRITE_BLOCK`.
    ///
    /// `Err` here always means the session ends: either a protocol contract was violated, or an
    /// I/O failure occurred that the original treats as fatal (`ABORT`) rather than soft (`NOK`).
    pub fn handle(&mut self, msg: Message, fs_block_size: u64) -> Result<Vec<Message>> {
        match (&mut self.inner, msg.code) {
            (Inner::Idle, Code::CreateFile) => self.create_file(msg),
            (Inner::Idle, Code::ChangeFile) => self.change_file(msg),
            (Inner::Idle, Code::DeleteFile) => self.delete_file(msg),
            (Inner::Idle, _) => Err(violation("command requires an open file")),

            (Inner::Creating { .. }, Code::CreateFile | Code::ChangeFile) => {
                Err(violation("a file is already open"))
            }
            (Inner::Creating { .. }, Code::SetTimestamps) => self.buffer_timestamps(msg),
            (Inner::Creating { .. }, Code::SetPermModes) => self.buffer_mode(msg),
            (Inner::Creating { .. }, Code::SetOwner) => self.buffer_owner(msg),
            (Inner::Creating { .. }, Code::WriteBlock) => self.write_block(msg, fs_block_size),
            (Inner::Creating { .. }, Code::Done) => self.finish_creating(),
            (Inner::Creating { .. }, _) => Err(violation("unexpected command while creating")),

            (Inner::Changing { .. }, Code::CreateFile | Code::ChangeFile) => {
                Err(violation("a file is already open"))
            }
            (Inner::Changing { .. }, Code::SetTimestamps) => self.apply_timestamps(msg),
            (Inner::Changing { .. }, Code::SetPermModes) => self.apply_mode(msg),
            (Inner::Changing { .. }, Code::SetOwner) => self.apply_owner(msg),
            (Inner::Changing { .. }, Code::WriteBlock) => self.write_block(msg, fs_block_size),
            (Inner::Changing { .. }, Code::Done) => self.finish_changing(),
            (Inner::Changing { .. }, _) => Err(violation("unexpected command while changing")),
        }
    }

    fn create_file(&mut self, msg: Message) -> Result<Vec<Message>> {
        let path = path_of(msg)?;
        let full = self.resolve(&path);
        match OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o666)
            .open(&full)
        {
            Ok(file) => {
                self.inner = Inner::Creating {
                    file,
                    path: full,
                    pending: Pending::default(),
                };
                Ok(vec![ok()])
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(vec![nok()]),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn change_file(&mut self, msg: Message) -> Result<Vec<Message>> {
        let path = path_of(msg)?;
        let full = self.resolve(&path);
        match OpenOptions::new().read(true).write(true).open(&full) {
            Ok(file) => {
                self.inner = Inner::Changing {
                    file,
                    path: full,
                    applied: false,
                };
                Ok(vec![ok()])
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![nok()]),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn delete_file(&mut self, msg: Message) -> Result<Vec<Message>> {
        let path = path_of(msg)?;
        match std::fs::remove_file(self.resolve(&path)) {
            Ok(()) => Ok(vec![ok()]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![nok()]),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn buffer_timestamps(&mut self, msg: Message) -> Result<Vec<Message>> {
        let (atime, mtime) = timestamps_of(msg)?;
        if let Inner::Creating { pending, .. } = &mut self.inner {
            pending.timestamps = Some((atime, mtime));
        }
        Ok(vec![ok()])
    }

    fn buffer_mode(&mut self, msg: Message) -> Result<Vec<Message>> {
        let mode = mode_of(msg)?;
        if let Inner::Creating { pending, .. } = &mut self.inner {
            pending.mode = Some(mode);
        }
        Ok(vec![ok()])
    }

    fn buffer_owner(&mut self, msg: Message) -> Result<Vec<Message>> {
        let (uid, gid) = owner_of(msg)?;
        if let Inner::Creating { pending, .. } = &mut self.inner {
            pending.owner = Some((uid, gid));
        }
        Ok(vec![ok()])
    }

    fn write_block(&mut self, msg: Message, fs_block_size: u64) -> Result<Vec<Message>> {
        let bytes = match msg.payload {
            Payload::WriteBlock(bytes) => bytes,
            _ => return Err(violation("write_block without a byte payload")),
        };
        let file = match &mut self.inner {
            Inner::Creating { file, .. } | Inner::Changing { file, .. } => file,
            Inner::Idle => return Err(violation("write_block outside of an open file")),
        };
        let result = if bytes.is_empty() {
            file.seek(SeekFrom::Current(fs_block_size as i64)).map(|_| ())
        } else {
            file.write_all(&bytes)
        };
        match result {
            Ok(()) => Ok(vec![ok()]),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn finish_creating(&mut self) -> Result<Vec<Message>> {
        let Inner::Creating { file, pending, .. } = std::mem::replace(&mut self.inner, Inner::Idle)
        else {
            unreachable!("guarded by handle()'s match arm");
        };

        let mut replies = Vec::with_capacity(3);
        replies.push(apply_timestamps_to(&self.ops, &file, pending.timestamps)?);
        replies.push(apply_mode_to(&self.ops, &file, pending.mode));
        replies.push(apply_owner_to(&self.ops, &file, pending.owner));
        drop(file);
        Ok(replies)
    }

    fn apply_timestamps(&mut self, msg: Message) -> Result<Vec<Message>> {
        let (atime, mtime) = timestamps_of(msg)?;
        let Inner::Changing { file, applied, .. } = &mut self.inner else {
            return Err(violation("set_timestamps outside of change"));
        };
        let reply = apply_timestamps_to(&self.ops, file, Some((atime, mtime)))?;
        *applied = true;
        Ok(vec![reply])
    }

    fn apply_mode(&mut self, msg: Message) -> Result<Vec<Message>> {
        let mode = mode_of(msg)?;
        let Inner::Changing { file, applied, .. } = &mut self.inner else {
            return Err(violation("set_perm_modes outside of change"));
        };
        let reply = apply_mode_to(&self.ops, file, Some(mode));
        *applied = true;
        Ok(vec![reply])
    }

    fn apply_owner(&mut self, msg: Message) -> Result<Vec<Message>> {
        let (uid, gid) = owner_of(msg)?;
        let Inner::Changing { file, applied, .. } = &mut self.inner else {
            return Err(violation("set_owner outside of change"));
        };
        let reply = apply_owner_to(&self.ops, file, Some((uid, gid)));
        *applied = true;
        Ok(vec![reply])
    }

    fn finish_changing(&mut self) -> Result<Vec<Message>> {
        debug!("closing file after change sequence");
        self.inner = Inner::Idle;
        Ok(Vec::new())
    }
}

fn violation(msg: &'static str) -> Error {
    Error::Protocol(ProtocolError::StateViolation(msg))
}

fn path_of(msg: Message) -> Result<String> {
    match msg.payload {
        Payload::Path(p) => Ok(p),
        _ => Err(violation("expected a path payload")),
    }
}

fn timestamps_of(msg: Message) -> Result<(Timespec, Timespec)> {
    match msg.payload {
        Payload::SetTimestamps { atime, mtime } => Ok((atime, mtime)),
        _ => Err(violation("expected a timestamps payload")),
    }
}

fn mode_of(msg: Message) -> Result<u32> {
    match msg.payload {
        Payload::SetPermModes { mode } => Ok(mode),
        _ => Err(violation("expected a perm_modes payload")),
    }
}

fn owner_of(msg: Message) -> Result<(u32, u32)> {
    match msg.payload {
        Payload::SetOwner { uid, gid } => Ok((uid, gid)),
        _ => Err(violation("expected an owner payload")),
    }
}

/// Applies `SET_TIMESTAMPS`, whose legal reply set is `OK`/`ABORT` only: a missing timestamps
/// payload is still a soft `NOK` (nothing was buffered to apply), but a `futimens` failure is
/// fatal, unlike the `NOK`-on-refusal `SET_PERM_MODES`/`SET_OWNER` siblings below.
fn apply_timestamps_to<M: MetadataOps>(
    ops: &M,
    file: &File,
    ts: Option<(Timespec, Timespec)>,
) -> Result<Message> {
    let Some((atime, mtime)) = ts else {
        return Ok(nok());
    };
    let atime = TimeSpec::new(atime.sec, atime.nsec);
    let mtime = TimeSpec::new(mtime.sec, mtime.nsec);
    match ops.futimens(file.as_raw_fd(), atime, mtime) {
        Ok(()) => Ok(ok()),
        Err(e) => Err(Error::Io(std::io::Error::other(e))),
    }
}

fn apply_mode_to<M: MetadataOps>(ops: &M, file: &File, mode: Option<u32>) -> Message {
    let Some(mode) = mode else {
        return nok();
    };
    match Mode::from_bits(mode) {
        Some(mode) => match ops.fchmod(file.as_raw_fd(), mode) {
            Ok(()) => ok(),
            Err(_) => nok(),
        },
        None => nok(),
    }
}

fn apply_owner_to<M: MetadataOps>(ops: &M, file: &File, owner: Option<(u32, u32)>) -> Message {
    let Some((uid, gid)) = owner else {
        return nok();
    };
    match ops.fchown(file.as_raw_fd(), Uid::from_raw(uid), Gid::from_raw(gid)) {
        Ok(()) => ok(),
        Err(_) => nok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::path_message;

    fn timestamps_msg(sec: i64) -> Message {
        Message {
            code: Code::SetTimestamps,
            payload: Payload::SetTimestamps {
                atime: Timespec { sec, nsec: 0 },
                mtime: Timespec { sec, nsec: 0 },
            },
        }
    }

    #[test]
    fn create_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());

        let replies = machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        assert_eq!(replies, vec![ok()]);
        assert!(dir.path().join("f").exists());

        machine
            .handle(Message::empty(Code::Done), 4096)
            .unwrap();

        let replies = machine
            .handle(path_message(Code::DeleteFile, "f"), 4096)
            .unwrap();
        assert_eq!(replies, vec![ok()]);
        assert!(!dir.path().join("f").exists());
    }

    #[test]
    fn double_create_is_a_state_violation() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());
        machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        let err = machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::StateViolation(_))
        ));
    }

    #[test]
    fn create_existing_file_is_soft_nok() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());
        let replies = machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        assert_eq!(replies, vec![nok()]);
    }

    #[test]
    fn create_done_yields_three_deferred_replies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());
        machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        machine.handle(timestamps_msg(42), 4096).unwrap();
        machine
            .handle(
                Message {
                    code: Code::SetPermModes,
                    payload: Payload::SetPermModes { mode: 0o600 },
                },
                4096,
            )
            .unwrap();
        machine
            .handle(
                Message {
                    code: Code::SetOwner,
                    payload: Payload::SetOwner {
                        uid: nix::unistd::getuid().as_raw(),
                        gid: nix::unistd::getgid().as_raw(),
                    },
                },
                4096,
            )
            .unwrap();

        let replies = machine.handle(Message::empty(Code::Done), 4096).unwrap();
        assert_eq!(replies.len(), 3);
    }

    #[test]
    fn sparse_write_block_advances_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());
        machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        machine
            .handle(
                Message {
                    code: Code::WriteBlock,
                    payload: Payload::WriteBlock(Vec::new()),
                },
                4096,
            )
            .unwrap();
        machine.handle(Message::empty(Code::Done), 4096).unwrap();

        let meta = std::fs::metadata(dir.path().join("f")).unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[test]
    fn change_sequence_round_applies_and_sends_no_reply_on_done() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("g"), b"x").unwrap();
        let mut machine = FileMachine::new(dir.path().to_path_buf());

        let replies = machine
            .handle(path_message(Code::ChangeFile, "g"), 4096)
            .unwrap();
        assert_eq!(replies, vec![ok()]);

        let replies = machine.handle(timestamps_msg(420), 4096).unwrap();
        assert_eq!(replies, vec![ok()]);

        let replies = machine.handle(Message::empty(Code::Done), 4096).unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn change_sequence_reports_nok_when_chown_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("g"), b"x").unwrap();

        let mut mock = MockMetadataOps::new();
        mock.expect_fchown()
            .returning(|_, _, _| Err(nix::errno::Errno::EPERM));
        let mut machine = FileMachine::with_ops(dir.path().to_path_buf(), mock);

        machine
            .handle(path_message(Code::ChangeFile, "g"), 4096)
            .unwrap();
        let replies = machine
            .handle(
                Message {
                    code: Code::SetOwner,
                    payload: Payload::SetOwner { uid: 0, gid: 0 },
                },
                4096,
            )
            .unwrap();
        assert_eq!(replies, vec![nok()]);
    }

    #[test]
    fn create_done_reports_nok_per_field_on_refusal_but_still_closes() {
        let dir = tempfile::tempdir().unwrap();

        let mut mock = MockMetadataOps::new();
        mock.expect_futimens().returning(|_, _, _| Ok(()));
        mock.expect_fchmod()
            .returning(|_, _| Err(nix::errno::Errno::EPERM));
        mock.expect_fchown().returning(|_, _, _| Ok(()));
        let mut machine = FileMachine::with_ops(dir.path().to_path_buf(), mock);

        machine
            .handle(path_message(Code::CreateFile, "f"), 4096)
            .unwrap();
        machine.handle(timestamps_msg(1), 4096).unwrap();
        machine
            .handle(
                Message {
                    code: Code::SetPermModes,
                    payload: Payload::SetPermModes { mode: 0o600 },
                },
                4096,
            )
            .unwrap();
        machine
            .handle(
                Message {
                    code: Code::SetOwner,
                    payload: Payload::SetOwner { uid: 0, gid: 0 },
                },
                4096,
            )
            .unwrap();

        let replies = machine.handle(Message::empty(Code::Done), 4096).unwrap();
        assert_eq!(replies, vec![ok(), nok(), ok()]);
        // The file is closed regardless of which deferred settings were refused.
        assert!(
            machine
                .handle(path_message(Code::ChangeFile, "f"), 4096)
                .is_ok()
        );
    }
}

