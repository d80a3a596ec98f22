//! Filesystem-change watch engine.
//!
//! Grounded on `client/event.c` for the event-to-action mapping (CLOSE_WRITE -> delete+recreate,
//! ATTRIB -> change, CREATE/MOVED_TO -> create, DELETE/MOVED_FROM -> delete) and on
//! `conmon-rs/server/src/oom_watcher.rs` for the `notify`-crate usage pattern: a synchronous
//! watcher callback bridges into async code via `futures::executor::block_on` pushing onto a
//! bounded channel, read back out by the event loop with `.recv().await`.
//!
//! The original keeps an ordered watcher list and resolves file-level event names by reverse
//! scanning it for a kernel watch-descriptor id; `notify`'s `Event` already carries the affected
//! path, so that resolution step collapses here into reading `event.paths`. The watcher list is
//! kept anyway to preserve the reverse-order teardown invariant (§3) and to know which paths are
//! currently subscribed.

use crate::error::Result;
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode, ModifyKind, RenameMode},
};
use std::path::{Path, PathBuf};

/// What a filesystem notification means for the protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// A new file appeared (or was renamed in): run the create sequence.
    Create(PathBuf),
    /// An existing file was closed after writing: delete then recreate it.
    DeleteRecreate(PathBuf),
    /// A file's metadata changed: run the change sequence.
    Change(PathBuf),
    /// A file disappeared (removed or renamed out): run the delete sequence.
    Delete(PathBuf),
}

/// Map one `notify` event to the protocol action it implies, if any.
pub fn classify(event: &Event) -> Vec<Action> {
    let Some(path) = event.paths.first().cloned() else {
        return Vec::new();
    };
    match event.kind {
        EventKind::Create(_) => vec![Action::Create(path)],
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            vec![Action::DeleteRecreate(path)]
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => vec![Action::Change(path)],
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![Action::Create(path)],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![Action::Delete(path)],
        EventKind::Remove(_) => vec![Action::Delete(path)],
        _ => Vec::new(),
    }
}

/// Owns the `notify` watcher and the ordered list of currently-subscribed paths.
pub struct WatchEngine {
    source: PathBuf,
    watcher: RecommendedWatcher,
    rx: async_channel::Receiver<notify::Result<Event>>,
    watched: Vec<PathBuf>,
}

impl WatchEngine {
    /// Watch `source` itself (for CREATE/DELETE/MOVED_*) plus each entry in `initial` (for
    /// CLOSE_WRITE/ATTRIB).
    pub fn new(source: &Path, initial: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let (tx, rx) = async_channel::bounded(256);
        let mut watcher = notify::recommended_watcher(move |res| {
            futures::executor::block_on(async {
                let _ = tx.send(res).await;
            });
        })
        .map_err(to_io_error)?;

        watcher
            .watch(source, RecursiveMode::NonRecursive)
            .map_err(to_io_error)?;

        let mut watched = Vec::new();
        for path in initial {
            watcher
                .watch(&path, RecursiveMode::NonRecursive)
                .map_err(to_io_error)?;
            watched.push(path);
        }

        Ok(Self {
            source: source.to_path_buf(),
            watcher,
            rx,
            watched,
        })
    }

    /// Wait for the next raw filesystem event.
    pub async fn next_event(&mut self) -> Option<notify::Result<Event>> {
        self.rx.recv().await.ok()
    }

    /// Add a watch for a newly created file.
    pub fn add(&mut self, path: PathBuf) -> Result<()> {
        self.watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(to_io_error)?;
        self.watched.push(path);
        Ok(())
    }

    /// Remove the watch for a deleted or renamed-away file, if one is active.
    pub fn remove(&mut self, path: &Path) {
        if let Some(pos) = self.watched.iter().rposition(|p| p == path) {
            self.watched.remove(pos);
            let _ = self.watcher.unwatch(path);
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        for path in self.watched.iter().rev() {
            let _ = self.watcher.unwatch(path);
        }
        let _ = self.watcher.unwatch(&self.source);
    }
}

fn to_io_error(e: notify::Error) -> crate::error::Error {
    crate::error::Error::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn create_maps_to_create_action() {
        let ev = event(EventKind::Create(CreateKind::File), "a");
        assert_eq!(classify(&ev), vec![Action::Create(PathBuf::from("a"))]);
    }

    #[test]
    fn close_write_maps_to_delete_recreate() {
        let ev = event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            "a",
        );
        assert_eq!(
            classify(&ev),
            vec![Action::DeleteRecreate(PathBuf::from("a"))]
        );
    }

    #[test]
    fn remove_maps_to_delete() {
        let ev = event(EventKind::Remove(RemoveKind::File), "a");
        assert_eq!(classify(&ev), vec![Action::Delete(PathBuf::from("a"))]);
    }

    #[test]
    fn unrelated_event_maps_to_nothing() {
        let ev = event(EventKind::Access(notify::event::AccessKind::Any), "a");
        assert!(classify(&ev).is_empty());
    }
}
