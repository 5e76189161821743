// review-bridge/src/tracker.rs

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::scratch::is_scratch_path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFile {
    pub path: PathBuf,
    pub last_touched_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferEventKind {
    Enter,
    Write,
    Delete,
}

impl BufferEventKind {
    pub fn from_autocmd(event: &str) -> Option<Self> {
        match event {
            "BufEnter" | "BufWinEnter" => Some(Self::Enter),
            "BufWritePost" => Some(Self::Write),
            "BufDelete" | "BufWipeout" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Focus facts about the buffer an event fired for.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferFocus {
    pub focused: bool,
    /// False for terminals, help, quickfix and other non-file buffers.
    pub is_file: bool,
}

/// Bounded, recency-ordered list of touched files (most recent first) with at
/// most one active entry. Changes are coalesced over `debounce` and emitted as
/// snapshots.
pub struct OpenFileTracker {
    entries: Mutex<VecDeque<TrackedFile>>,
    bound: usize,
    debounce: Duration,
    pending: AtomicBool,
    tx: mpsc::UnboundedSender<Vec<TrackedFile>>,
}

impl OpenFileTracker {
    pub fn new(bound: usize, debounce: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<TrackedFile>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let me = Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(bound + 1)),
            bound: bound.max(1),
            debounce,
            pending: AtomicBool::new(false),
            tx,
        });
        (me, rx)
    }

    pub fn on_buffer_event(self: &Arc<Self>, kind: BufferEventKind, path: &Path, focus: BufferFocus) {
        if path.as_os_str().is_empty() || is_scratch_path(path) {
            return;
        }
        {
            let mut entries = self.entries.lock();
            let previous = entries.iter().position(|e| e.path == path).and_then(|i| entries.remove(i));
            match kind {
                BufferEventKind::Delete => {}
                BufferEventKind::Enter | BufferEventKind::Write => {
                    let activate = focus.focused && focus.is_file;
                    if activate {
                        entries.iter_mut().for_each(|e| e.is_active = false);
                    }
                    let was_active = previous.is_some_and(|p| p.is_active);
                    entries.push_front(TrackedFile {
                        path: path.to_path_buf(),
                        last_touched_at: Utc::now(),
                        is_active: activate || was_active,
                    });
                    entries.truncate(self.bound);
                }
            }
        }
        debug!(?kind, path = %path.display(), "tracked file list updated");
        self.schedule();
    }

    pub fn snapshot(&self) -> Vec<TrackedFile> { self.entries.lock().iter().cloned().collect() }

    fn schedule(self: &Arc<Self>) {
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(me.debounce).await;
            me.pending.store(false, Ordering::SeqCst);
            let _ = me.tx.send(me.snapshot());
        });
    }
}
