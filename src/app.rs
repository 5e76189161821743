// review-bridge/src/app.rs

use anyhow::{Context, Result};
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    config::Config,
    diff_review::DiffReviewEngine,
    editor::Editor,
    event_bridge::{callback, EventBridge, Scope},
    protocol::{Notification, EVENT_OPEN_FILES_CHANGED},
    router::{ContextProvider, RouterSettings, SessionRouter},
    scratch::ScratchWorkspace,
    tools,
    tracker::{BufferEventKind, BufferFocus, OpenFileTracker, TrackedFile},
};

const TRACKED_EVENTS: [&str; 4] = ["BufEnter", "BufWritePost", "BufDelete", "BufWipeout"];

/// Everything the server needs, built around one editor connection.
pub struct App {
    pub bridge: EventBridge,
    pub engine: DiffReviewEngine,
    pub tracker: Arc<OpenFileTracker>,
    pub router: SessionRouter,
    tracker_handle: String,
    feed: JoinHandle<()>,
}

pub fn scratch_root() -> PathBuf { std::env::temp_dir().join("review-bridge") }

impl App {
    pub async fn build(editor: Editor, cfg: &Config, workspace: &Path) -> Result<Self> {
        let bridge = EventBridge::new(editor.clone());
        let scratch = ScratchWorkspace::new(scratch_root());
        let engine = DiffReviewEngine::new(editor.clone(), bridge.clone(), scratch, cfg.diff_settings());
        let (tracker, changes) = OpenFileTracker::new(cfg.max_files(), cfg.debounce());

        let tools = tools::registry(editor, engine.clone(), tracker.clone(), workspace);
        let snapshot_source = tracker.clone();
        let provider: ContextProvider = Arc::new(move || json!({ "files": snapshot_source.snapshot() }));
        let settings = RouterSettings {
            server_name: cfg.ide_name(),
            keep_alive: cfg.keep_alive(),
            push_queue: cfg.push_queue(),
        };
        let router = SessionRouter::with_initial_context(settings, tools, provider);

        let sink = tracker.clone();
        let tracker_handle = bridge
            .register(
                &TRACKED_EVENTS,
                Scope::Global,
                callback(move |ev| {
                    let Some(kind) = BufferEventKind::from_autocmd(&ev.event) else { return Ok(false) };
                    let path = if ev.matched.is_empty() { ev.file } else { ev.matched };
                    let focus = BufferFocus { focused: ev.focused, is_file: ev.buftype.is_empty() };
                    sink.on_buffer_event(kind, Path::new(&path), focus);
                    Ok(false)
                }),
            )
            .await
            .context("installing buffer tracking autocmds")?;

        let feed = spawn_feed(changes, router.clone());
        info!(workspace = %workspace.display(), "bridge ready");
        Ok(Self { bridge, engine, tracker, router, tracker_handle, feed })
    }

    /// Stops the change feed, drops every session and removes editor hooks.
    pub async fn shutdown(self) {
        self.feed.abort();
        let closed = self.router.close_all();
        self.bridge.unregister(&self.tracker_handle).await;
        info!(sessions = closed, reviews = self.engine.active_count(), "bridge shut down");
    }
}

/// Debounced tracker snapshots become `ide/openFilesChanged` broadcasts.
fn spawn_feed(mut changes: mpsc::UnboundedReceiver<Vec<TrackedFile>>, router: SessionRouter) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(files) = changes.recv().await {
            let delivered = router.broadcast(&Notification::new(EVENT_OPEN_FILES_CHANGED, json!({ "files": files })));
            debug!(delivered, "open files broadcast");
        }
    })
}
