//! Asynchronous unmap of released memory maps.
//!
//! Unmapping is expensive on most platforms and must not run on the
//! thread that is remapping, so released maps are handed to a dedicated
//! thread over a channel. Duplicate cleans of the same region are
//! harmless: a map can only be sent here once, and dropping it is the
//! whole job.

use crossbeam_channel::{unbounded, Sender};
use memmap::{Mmap, MmapMut};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;

pub(crate) enum ReleasedMap {
    Read(Mmap),
    Write(MmapMut),
}

enum Message {
    Clean(ReleasedMap, PathBuf),
    Shutdown,
}

/// Process-wide cleaner. All file handles publish their released maps
/// here; no other global state exists in this crate.
pub struct BufferCleaner {
    sender: Sender<Message>,
}

static CLEANER: OnceLock<BufferCleaner> = OnceLock::new();

impl BufferCleaner {
    /// Start the cleaner thread if it is not already running.
    pub fn start() -> &'static BufferCleaner {
        CLEANER.get_or_init(|| {
            let (sender, receiver) = unbounded();
            let spawned = thread::Builder::new()
                .name("buffer-cleaner".into())
                .spawn(move || {
                    while let Ok(message) = receiver.recv() {
                        match message {
                            Message::Clean(map, path) => {
                                debug!("unmapping released buffer of {:?}", path);
                                drop(map);
                            }
                            Message::Shutdown => break,
                        }
                    }
                });
            if let Err(err) = spawned {
                // receiver is gone; maps will unmap on the sending thread
                error!("buffer cleaner thread failed to start: {}", err);
            }
            BufferCleaner { sender }
        })
    }

    /// Hand a released map over. Falls back to unmapping inline when the
    /// cleaner has shut down.
    pub(crate) fn clean(map: ReleasedMap, path: PathBuf) {
        let cleaner = BufferCleaner::start();
        if let Err(err) = cleaner.sender.send(Message::Clean(map, path)) {
            drop(err.into_inner());
        }
    }

    /// Stop the cleaner thread. Maps released afterwards unmap inline.
    pub fn shutdown() {
        if let Some(cleaner) = CLEANER.get() {
            let _ = cleaner.sender.send(Message::Shutdown);
        }
    }
}
