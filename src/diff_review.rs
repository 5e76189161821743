// review-bridge/src/diff_review.rs
//
// One state machine per in-flight review. Three signals race to finish a
// review: the accept key, the reject key and either scratch buffer leaving
// its last window (implicit accept). The first one claims the latch; the
// claimer alone runs teardown and delivers the outcome.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    editor::{Editor, EditorError},
    event_bridge::{callback, Callback, EventBridge, Scope},
    scratch::{ScratchError, ScratchPair, ScratchWorkspace},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted { content: String },
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
    /// The review UI was closed without an explicit choice; counts as accept.
    WindowClosed,
}

impl Decision {
    fn accepts(self) -> bool { !matches!(self, Decision::Reject) }
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("editor connection is not available")]
    Disconnected,
    #[error("a review for {0} is already in progress")]
    InProgress(PathBuf),
    #[error(transparent)]
    Scratch(#[from] ScratchError),
    #[error("opening the diff view: {0}")]
    Editor(#[from] EditorError),
    #[error("review for {0} ended without an outcome")]
    Abandoned(PathBuf),
}

#[derive(Clone, Debug)]
pub struct DiffSettings {
    pub accept_key: String,
    pub reject_key: String,
    pub reload_delay: Duration,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            accept_key: "<leader>da".into(),
            reject_key: "<leader>dq".into(),
            reload_delay: Duration::from_millis(200),
        }
    }
}

/// One-shot resolution guard around a deferred result: the first `claim`
/// gets the sender, every later one gets `None`.
pub struct ResolveLatch<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResolveLatch<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { slot: Mutex::new(Some(tx)) }, rx)
    }

    pub fn claim(&self) -> Option<oneshot::Sender<T>> { self.slot.lock().take() }
}

struct DiffSession {
    pair: ScratchPair,
    /// Returned if the proposed scratch file cannot be read back.
    submitted: String,
    latch: ResolveLatch<Outcome>,
    handles: Mutex<Vec<String>>,
}

struct EngineInner {
    editor: Editor,
    bridge: EventBridge,
    scratch: ScratchWorkspace,
    settings: DiffSettings,
    active: Mutex<HashMap<PathBuf, Arc<DiffSession>>>,
}

#[derive(Clone)]
pub struct DiffReviewEngine {
    inner: Arc<EngineInner>,
}

const OPEN_DIFF: &str = r#"-- review_bridge:open_diff
local original, proposed = ...
vim.cmd('tabnew')
local tab = vim.api.nvim_get_current_tabpage()
vim.cmd('edit ' .. vim.fn.fnameescape(original))
local old_win = vim.api.nvim_get_current_win()
local old_buf = vim.api.nvim_get_current_buf()
vim.bo[old_buf].modifiable = false
vim.cmd('diffthis')
vim.cmd('rightbelow vsplit ' .. vim.fn.fnameescape(proposed))
local new_win = vim.api.nvim_get_current_win()
local new_buf = vim.api.nvim_get_current_buf()
vim.cmd('diffthis')
for _, win in ipairs({ old_win, new_win }) do
  vim.wo[win].scrollbind = true
  vim.wo[win].cursorbind = true
end
return { tab = tab, old_win = old_win, new_win = new_win, old_buf = old_buf, new_buf = new_buf }
"#;

const FLUSH_PROPOSED: &str = r#"-- review_bridge:flush_proposed
local path = ...
for _, buf in ipairs(vim.api.nvim_list_bufs()) do
  if vim.api.nvim_buf_is_loaded(buf) and vim.api.nvim_buf_get_name(buf) == path and vim.bo[buf].modified then
    vim.api.nvim_buf_call(buf, function() vim.cmd('silent! noautocmd write!') end)
  end
end
return true
"#;

const WIPE_SCRATCH: &str = r#"-- review_bridge:wipe_scratch
local wanted = {}
for _, p in ipairs({ ... }) do wanted[p] = true end
for _, buf in ipairs(vim.api.nvim_list_bufs()) do
  if wanted[vim.api.nvim_buf_get_name(buf)] then
    pcall(vim.api.nvim_buf_delete, buf, { force = true })
  end
end
return true
"#;

const CLOSE_PANES: &str = r#"-- review_bridge:close_panes
local wanted = {}
for _, p in ipairs({ ... }) do wanted[p] = true end
local closed = 0
for _, win in ipairs(vim.api.nvim_list_wins()) do
  local buf = vim.api.nvim_win_get_buf(win)
  if wanted[vim.api.nvim_buf_get_name(buf)] and #vim.api.nvim_list_wins() > 1 then
    if pcall(vim.api.nvim_win_close, win, true) then closed = closed + 1 end
  end
end
return closed
"#;

const RELOAD_TARGET: &str = r#"-- review_bridge:reload_target
local path = ...
for _, buf in ipairs(vim.api.nvim_list_bufs()) do
  if vim.api.nvim_buf_is_loaded(buf) and vim.api.nvim_buf_get_name(buf) == path and not vim.bo[buf].modified then
    vim.api.nvim_buf_call(buf, function() vim.cmd('checktime') end)
  end
end
return true
"#;

fn path_arg(p: &Path) -> Value { Value::from(p.to_string_lossy().into_owned()) }

impl DiffReviewEngine {
    pub fn new(editor: Editor, bridge: EventBridge, scratch: ScratchWorkspace, settings: DiffSettings) -> Self {
        Self {
            inner: Arc::new(EngineInner { editor, bridge, scratch, settings, active: Mutex::new(HashMap::new()) }),
        }
    }

    pub fn is_active(&self, target: &Path) -> bool { self.inner.active.lock().contains_key(target) }

    pub fn active_count(&self) -> usize { self.inner.active.lock().len() }

    /// Shows `target` against `new_content` and waits for the human.
    pub async fn show_diff(&self, target: &Path, new_content: &str) -> Result<Outcome, ReviewError> {
        let rx = self.open(target, new_content).await?;
        rx.await.map_err(|_| ReviewError::Abandoned(target.to_path_buf()))
    }

    /// Stages and opens the review, returning the pending outcome. Teardown
    /// does not depend on the receiver being polled.
    pub async fn open(&self, target: &Path, new_content: &str) -> Result<oneshot::Receiver<Outcome>, ReviewError> {
        let inner = &self.inner;
        if !inner.editor.is_connected() {
            return Err(ReviewError::Disconnected);
        }
        if self.is_active(target) {
            return Err(ReviewError::InProgress(target.to_path_buf()));
        }

        let pair = inner.scratch.stage(target, new_content).await?;
        let args = vec![path_arg(&pair.original), path_arg(&pair.proposed)];
        let view = match inner.editor.exec_lua(OPEN_DIFF, args).await {
            Ok(v) => v,
            Err(e) => {
                inner.scratch.remove(&pair).await;
                return Err(e.into());
            }
        };
        let panes: Vec<(i64, i64)> = [("old_win", "old_buf"), ("new_win", "new_buf")]
            .iter()
            .filter_map(|(w, b)| Some((view.get(*w)?.as_i64()?, view.get(*b)?.as_i64()?)))
            .collect();
        let bufs: Vec<i64> = panes.iter().map(|&(_, buf)| buf).collect();

        let (latch, rx) = ResolveLatch::new();
        let session = Arc::new(DiffSession {
            pair,
            submitted: new_content.to_owned(),
            latch,
            handles: Mutex::new(Vec::new()),
        });
        let inserted = {
            let mut active = inner.active.lock();
            if active.contains_key(target) {
                false
            } else {
                active.insert(target.to_path_buf(), session.clone());
                true
            }
        };
        if !inserted {
            self.abort_open(&session).await;
            return Err(ReviewError::InProgress(target.to_path_buf()));
        }

        if let Err(e) = self.arm(target, &session, &bufs).await {
            warn!(target = %target.display(), error = %e, "arming review signals failed");
            self.inner.active.lock().remove(target);
            self.abort_open(&session).await;
            return Err(e.into());
        }
        info!(target = %target.display(), "diff review opened");
        if self.view_closed(&panes).await {
            info!(target = %target.display(), "diff view closed before its signals were armed");
            self.signal(target, Decision::WindowClosed);
        }
        Ok(rx)
    }

    /// A pane closed while the review was being armed fires no event, so the
    /// panes are checked once arming is done. Failed checks count as open.
    async fn view_closed(&self, panes: &[(i64, i64)]) -> bool {
        let editor = &self.inner.editor;
        for &(win, buf) in panes {
            if matches!(editor.win_is_valid(win).await, Ok(false)) {
                return true;
            }
            if let Ok(shown) = editor.win_get_buf(win).await
                && shown != buf
            {
                return true;
            }
        }
        false
    }

    async fn arm(&self, target: &Path, session: &DiffSession, bufs: &[i64]) -> Result<(), EditorError> {
        let settings = &self.inner.settings;
        for &buf in bufs {
            for (key, decision, desc) in [
                (&settings.accept_key, Decision::Accept, "Accept proposed change"),
                (&settings.reject_key, Decision::Reject, "Reject proposed change"),
            ] {
                let cb = self.signal_callback(target, decision);
                let h = self.inner.bridge.register_keymap(buf, "n", key, desc, cb).await?;
                session.handles.lock().push(h);
            }
            let cb = self.signal_callback(target, Decision::WindowClosed);
            let h = self.inner.bridge.register(&["BufWinLeave", "BufWipeout"], Scope::Buffer(buf), cb).await?;
            session.handles.lock().push(h);
        }
        Ok(())
    }

    fn signal_callback(&self, target: &Path, decision: Decision) -> Callback {
        let engine = self.clone();
        let target = target.to_path_buf();
        callback(move |_| {
            engine.signal(&target, decision);
            Ok(true)
        })
    }

    /// Feeds one completion signal. Only the first signal per review has an
    /// effect; it spawns the teardown that produces the outcome.
    pub fn signal(&self, target: &Path, decision: Decision) -> bool {
        let Some(session) = self.inner.active.lock().get(target).cloned() else {
            debug!(target = %target.display(), ?decision, "signal for finished review ignored");
            return false;
        };
        let Some(tx) = session.latch.claim() else {
            debug!(target = %target.display(), ?decision, "duplicate review signal ignored");
            return false;
        };
        let engine = self.clone();
        let target = target.to_path_buf();
        tokio::spawn(async move { engine.finish(target, session, decision, tx).await });
        true
    }

    async fn finish(
        &self,
        target: PathBuf,
        session: Arc<DiffSession>,
        decision: Decision,
        tx: oneshot::Sender<Outcome>,
    ) {
        let inner = &self.inner;
        let outcome = if decision.accepts() {
            if let Err(e) = inner.editor.exec_lua(FLUSH_PROPOSED, vec![path_arg(&session.pair.proposed)]).await {
                debug!(error = %e, "flushing proposed buffer failed");
            }
            let content = match inner.scratch.read_proposed(&session.pair).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "proposed scratch unreadable; returning submitted content");
                    session.submitted.clone()
                }
            };
            Outcome::Accepted { content }
        } else {
            Outcome::Rejected
        };

        self.teardown(&session).await;
        inner.active.lock().remove(&target);
        info!(target = %target.display(), ?decision, "diff review resolved");

        let accepted = matches!(outcome, Outcome::Accepted { .. });
        if tx.send(outcome).is_err() {
            debug!(target = %target.display(), "review outcome had no listener");
        }
        if accepted {
            self.schedule_reload(target);
        }
    }

    async fn teardown(&self, session: &DiffSession) {
        let handles = std::mem::take(&mut *session.handles.lock());
        self.inner.bridge.unregister_all(&handles).await;
        let args = vec![path_arg(&session.pair.original), path_arg(&session.pair.proposed)];
        if let Err(e) = self.inner.editor.exec_lua(WIPE_SCRATCH, args).await {
            debug!(error = %e, "wiping scratch buffers failed");
        }
        self.inner.scratch.remove(&session.pair).await;
    }

    async fn abort_open(&self, session: &DiffSession) {
        if let Some(tx) = session.latch.claim() {
            drop(tx);
        }
        self.teardown(session).await;
    }

    /// Later writers (usually the agent) replace the real file; nudge the
    /// editor to re-read it once they had a moment.
    fn schedule_reload(&self, target: PathBuf) {
        let editor = self.inner.editor.clone();
        let delay = self.inner.settings.reload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = editor.exec_lua(RELOAD_TARGET, vec![path_arg(&target)]).await {
                debug!(target = %target.display(), error = %e, "reload hint failed");
            }
        });
    }

    /// Closes any pane showing this review's scratch files. Closing the view
    /// resolves the review through the window signal. No session, no-op.
    pub async fn close_diff(&self, target: &Path) -> Result<(), EditorError> {
        let Some(session) = self.inner.active.lock().get(target).cloned() else {
            debug!(target = %target.display(), "close_diff without active review");
            return Ok(());
        };
        let closed = self
            .inner
            .editor
            .exec_lua(CLOSE_PANES, vec![path_arg(&session.pair.original), path_arg(&session.pair.proposed)])
            .await?;
        debug!(target = %target.display(), closed = %closed, "review panes closed");
        Ok(())
    }
}

pub fn outcome_params(target: &Path, outcome: &Outcome) -> Value {
    match outcome {
        Outcome::Accepted { content } => json!({ "filePath": target.to_string_lossy(), "content": content }),
        Outcome::Rejected => json!({ "filePath": target.to_string_lossy() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_bridge::EventArgs, testing::FakeEditor};

    struct Rig {
        dir: tempfile::TempDir,
        fake: Arc<FakeEditor>,
        bridge: EventBridge,
        engine: DiffReviewEngine,
        target: PathBuf,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.rs");
        std::fs::write(&target, "fn old() {}\n").unwrap();
        let fake = Arc::new(FakeEditor::new());
        fake.respond(
            "review_bridge:open_diff",
            json!({ "tab": 2, "old_win": 1000, "new_win": 1001, "old_buf": 4, "new_buf": 5 }),
        );
        let bridge = EventBridge::new(fake.clone());
        let settings = DiffSettings { reload_delay: Duration::from_millis(1), ..Default::default() };
        let scratch = ScratchWorkspace::new(dir.path().join("fb"));
        let engine = DiffReviewEngine::new(fake.clone(), bridge.clone(), scratch, settings);
        Rig { dir, fake, bridge, engine, target }
    }

    impl Rig {
        fn pair(&self, target: &Path) -> ScratchPair {
            ScratchWorkspace::new(self.dir.path().join("fb")).paths_for(target).unwrap()
        }
    }

    #[tokio::test]
    async fn explicit_accept_returns_edited_proposal() {
        let r = rig();
        let rx = r.engine.open(&r.target, "fn new() {}\n").await.unwrap();
        let pair = r.pair(&r.target);
        assert!(pair.original.exists() && pair.proposed.exists());

        // Human edits the proposal before accepting.
        std::fs::write(&pair.proposed, "fn new_edited() {}\n").unwrap();
        assert!(r.engine.signal(&r.target, Decision::Accept));

        assert_eq!(rx.await.unwrap(), Outcome::Accepted { content: "fn new_edited() {}\n".into() });
        assert!(!pair.original.exists() && !pair.proposed.exists());
        assert!(!r.engine.is_active(&r.target));
        assert!(r.bridge.is_empty());
        // The real file is untouched by the review.
        assert_eq!(std::fs::read_to_string(&r.target).unwrap(), "fn old() {}\n");
    }

    #[tokio::test]
    async fn first_signal_wins_and_teardown_runs_once() {
        let r = rig();
        let rx = r.engine.open(&r.target, "x\n").await.unwrap();
        let pair = r.pair(&r.target);
        assert!(r.engine.signal(&r.target, Decision::Reject));
        assert!(!r.engine.signal(&r.target, Decision::Accept));
        assert!(!r.engine.signal(&r.target, Decision::WindowClosed));

        assert_eq!(rx.await.unwrap(), Outcome::Rejected);
        assert!(!pair.original.exists() && !pair.proposed.exists());

        // A file recreated at the scratch path outlives later signals, so
        // the scratch pair was deleted exactly once.
        std::fs::write(&pair.proposed, "later\n").unwrap();
        assert!(!r.engine.signal(&r.target, Decision::Accept));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pair.proposed.exists());
        assert_eq!(r.fake.calls_matching("review_bridge:wipe_scratch"), 1);
        assert_eq!(r.fake.calls_matching("review_bridge:reload_target"), 0);
    }

    #[tokio::test]
    async fn failed_scratch_delete_still_resolves_and_frees_the_path() {
        let r = rig();
        let rx = r.engine.open(&r.target, "x\n").await.unwrap();
        let pair = r.pair(&r.target);
        // A non-empty directory where the proposed file was cannot be unlinked.
        std::fs::remove_file(&pair.proposed).unwrap();
        std::fs::create_dir(&pair.proposed).unwrap();
        std::fs::write(pair.proposed.join("keep"), "k").unwrap();

        assert!(r.engine.signal(&r.target, Decision::Reject));
        assert_eq!(rx.await.unwrap(), Outcome::Rejected);
        assert!(!r.engine.is_active(&r.target));
        assert!(!pair.original.exists());
        assert!(pair.proposed.is_dir());
    }

    #[tokio::test]
    async fn reviews_of_same_named_new_files_keep_separate_scratch() {
        let r = rig();
        let a = r.dir.path().join("new_a/lib.rs");
        let b = r.dir.path().join("new_b/lib.rs");
        let rx_a = r.engine.open(&a, "content for A\n").await.unwrap();
        let _rx_b = r.engine.open(&b, "content for B\n").await.unwrap();
        assert_eq!(r.engine.active_count(), 2);

        assert!(r.engine.signal(&a, Decision::Accept));
        assert_eq!(rx_a.await.unwrap(), Outcome::Accepted { content: "content for A\n".into() });
        let pair_b = r.pair(&b);
        assert!(pair_b.original.exists() && pair_b.proposed.exists());
        assert_eq!(std::fs::read_to_string(&pair_b.proposed).unwrap(), "content for B\n");
        assert!(r.engine.is_active(&b));
    }

    #[tokio::test]
    async fn view_closed_while_opening_resolves_as_accept() {
        let r = rig();
        r.fake.respond("nvim_win_is_valid", json!(false));
        let rx = r.engine.open(&r.target, "fn new() {}\n").await.unwrap();
        assert_eq!(rx.await.unwrap(), Outcome::Accepted { content: "fn new() {}\n".into() });
        assert!(!r.engine.is_active(&r.target));

        r.fake.respond("nvim_win_is_valid", json!(true));
        let _rx = r.engine.open(&r.target, "again\n").await.unwrap();
        assert!(r.engine.is_active(&r.target));
    }

    #[tokio::test]
    async fn closing_the_window_is_an_implicit_accept() {
        let r = rig();
        let rx = r.engine.open(&r.target, "fn new() {}\n").await.unwrap();
        assert_eq!(r.bridge.len(), 6);

        // Find the window-lifecycle registration through the editor-side install call.
        let args = r.fake.last_call("review_bridge:install_autocmd").unwrap();
        let handle = args[1][2].as_str().unwrap().to_owned();
        r.bridge.deliver(&handle, EventArgs { event: "BufWinLeave".into(), buf: 5, ..Default::default() }).await;

        assert_eq!(rx.await.unwrap(), Outcome::Accepted { content: "fn new() {}\n".into() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.fake.calls_matching("review_bridge:reload_target"), 1);
    }

    #[tokio::test]
    async fn disconnected_editor_has_no_side_effects() {
        let r = rig();
        r.fake.disconnect();
        let err = r.engine.show_diff(&r.target, "y").await.unwrap_err();
        assert!(matches!(err, ReviewError::Disconnected));
        let pair = r.pair(&r.target);
        assert!(!pair.original.exists() && !pair.proposed.exists());
    }

    #[tokio::test]
    async fn second_review_for_same_path_is_refused() {
        let r = rig();
        let _rx = r.engine.open(&r.target, "a").await.unwrap();
        let err = r.engine.open(&r.target, "b").await.unwrap_err();
        assert!(matches!(err, ReviewError::InProgress(_)));
        assert_eq!(r.engine.active_count(), 1);
    }

    #[tokio::test]
    async fn close_diff_without_session_is_a_noop() {
        let r = rig();
        r.engine.close_diff(&r.target).await.unwrap();
        assert_eq!(r.fake.calls_matching("review_bridge:close_panes"), 0);

        let _rx = r.engine.open(&r.target, "a").await.unwrap();
        r.engine.close_diff(&r.target).await.unwrap();
        assert_eq!(r.fake.calls_matching("review_bridge:close_panes"), 1);
    }

    #[tokio::test]
    async fn dropped_listener_still_cleans_up() {
        let r = rig();
        drop(r.engine.open(&r.target, "a").await.unwrap());
        r.engine.signal(&r.target, Decision::Accept);
        for _ in 0..50 {
            if !r.engine.is_active(&r.target) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!r.engine.is_active(&r.target));
        assert!(r.bridge.is_empty());
    }
}
