// review-bridge/src/event_bridge.rs

use anyhow::Result;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::editor::{Editor, EditorError};

/// Notification method every editor-side hook forwards to.
pub const EVENT_METHOD: &str = "review_bridge_event";

/// Payload forwarded by an editor-side hook.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventArgs {
    pub event: String,
    pub buf: i64,
    pub file: String,
    #[serde(rename = "match")]
    pub matched: String,
    pub buftype: String,
    /// True when `buf` is the buffer of the focused window at fire time.
    pub focused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Global,
    Buffer(i64),
    Pattern(String),
}

/// Resolving to `Ok(true)` removes the registration.
pub type Callback = Arc<dyn Fn(EventArgs) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

pub fn callback<F>(f: F) -> Callback
where
    F: Fn(EventArgs) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(move |args| {
        let out = f(args);
        async move { out }.boxed()
    })
}

pub fn async_callback<F, Fut>(f: F) -> Callback
where
    F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

#[derive(Clone, Debug)]
enum Hook {
    Autocmd,
    Keymap { buf: i64, mode: String, lhs: String },
}

struct Registration {
    events: Vec<String>,
    hook: Hook,
    callback: Callback,
}

const INSTALL_AUTOCMD: &str = r#"-- review_bridge:install_autocmd
local chan, method, handle, events, opts = ...
local group = vim.api.nvim_create_augroup('review_bridge_' .. handle, { clear = true })
local autocmd = { group = group }
if opts.buffer then autocmd.buffer = opts.buffer end
if opts.pattern then autocmd.pattern = opts.pattern end
autocmd.callback = function(ev)
  local payload = {
    event = ev.event, buf = ev.buf, file = ev.file, match = ev.match,
    buftype = vim.api.nvim_buf_is_valid(ev.buf) and vim.bo[ev.buf].buftype or '',
    focused = vim.api.nvim_get_current_buf() == ev.buf,
  }
  local ok = pcall(vim.rpcnotify, chan, method, handle, payload)
  if not ok then
    pcall(vim.api.nvim_del_augroup_by_id, group)
    return true
  end
end
vim.api.nvim_create_autocmd(events, autocmd)
return group
"#;

const INSTALL_KEYMAP: &str = r#"-- review_bridge:install_keymap
local chan, method, handle, buf, mode, lhs, desc = ...
vim.keymap.set(mode, lhs, function()
  local payload = {
    event = 'keymap', buf = buf, file = vim.api.nvim_buf_get_name(buf),
    match = lhs, buftype = '', focused = true,
  }
  local ok = pcall(vim.rpcnotify, chan, method, handle, payload)
  if not ok then pcall(vim.keymap.del, mode, lhs, { buffer = buf }) end
end, { buffer = buf, desc = desc, nowait = true, silent = true })
return true
"#;

const REMOVE_AUTOCMD: &str = r#"-- review_bridge:remove_autocmd
local handle = ...
pcall(vim.api.nvim_del_augroup_by_name, 'review_bridge_' .. handle)
return true
"#;

const REMOVE_KEYMAP: &str = r#"-- review_bridge:remove_keymap
local buf, mode, lhs = ...
if vim.api.nvim_buf_is_valid(buf) then pcall(vim.keymap.del, mode, lhs, { buffer = buf }) end
return true
"#;

struct Inner {
    editor: Editor,
    table: Mutex<HashMap<String, Registration>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Turns editor hooks into callbacks keyed by opaque handles, all delivered
/// over one notification subscription.
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<Inner>,
}

impl EventBridge {
    pub fn new(editor: Editor) -> Self {
        Self { inner: Arc::new(Inner { editor, table: Mutex::new(HashMap::new()), listener: Mutex::new(None) }) }
    }

    pub async fn register(&self, events: &[&str], scope: Scope, callback: Callback) -> Result<String, EditorError> {
        let handle = uuid::Uuid::new_v4().simple().to_string();
        let events: Vec<String> = events.iter().map(|e| (*e).to_owned()).collect();
        let opts = match &scope {
            Scope::Global => json!({}),
            Scope::Buffer(b) => json!({ "buffer": b }),
            Scope::Pattern(p) => json!({ "pattern": p }),
        };
        let args = vec![
            json!(self.inner.editor.channel_id()),
            json!(EVENT_METHOD),
            json!(handle),
            json!(events),
            opts,
        ];
        self.install(handle, Registration { events, hook: Hook::Autocmd, callback }, INSTALL_AUTOCMD, args).await
    }

    /// Buffer-local normal-mode style mapping; fires with `event = "keymap"`.
    pub async fn register_keymap(
        &self,
        buf: i64,
        mode: &str,
        lhs: &str,
        desc: &str,
        callback: Callback,
    ) -> Result<String, EditorError> {
        let handle = uuid::Uuid::new_v4().simple().to_string();
        let args = vec![
            json!(self.inner.editor.channel_id()),
            json!(EVENT_METHOD),
            json!(handle),
            json!(buf),
            json!(mode),
            json!(lhs),
            json!(desc),
        ];
        let hook = Hook::Keymap { buf, mode: mode.to_owned(), lhs: lhs.to_owned() };
        let reg = Registration { events: vec!["keymap".into()], hook, callback };
        self.install(handle, reg, INSTALL_KEYMAP, args).await
    }

    async fn install(
        &self,
        handle: String,
        reg: Registration,
        code: &str,
        args: Vec<Value>,
    ) -> Result<String, EditorError> {
        self.ensure_listening();
        debug!(handle = %handle, events = ?reg.events, "registering editor hook");
        // In the table before the editor side exists, so an immediate fire finds it.
        self.inner.table.lock().insert(handle.clone(), reg);
        if let Err(e) = self.inner.editor.exec_lua(code, args).await {
            self.inner.table.lock().remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub async fn unregister(&self, handle: &str) {
        let Some(reg) = self.inner.table.lock().remove(handle) else { return };
        debug!(handle, "unregistering editor hook");
        let res = match &reg.hook {
            Hook::Autocmd => self.inner.editor.exec_lua(REMOVE_AUTOCMD, vec![json!(handle)]).await,
            Hook::Keymap { buf, mode, lhs } => {
                self.inner.editor.exec_lua(REMOVE_KEYMAP, vec![json!(buf), json!(mode), json!(lhs)]).await
            }
        };
        if let Err(e) = res {
            // The editor-side hook removes itself once forwarding fails.
            debug!(handle, error = %e, "editor-side hook removal failed");
        }
    }

    pub async fn unregister_all(&self, handles: &[String]) {
        for h in handles {
            self.unregister(h).await;
        }
    }

    pub fn is_registered(&self, handle: &str) -> bool { self.inner.table.lock().contains_key(handle) }

    pub fn len(&self) -> usize { self.inner.table.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn ensure_listening(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let mut rx = self.inner.editor.subscribe(EVENT_METHOD);
        let bridge = self.clone();
        *listener = Some(tokio::spawn(async move {
            while let Some(args) = rx.recv().await {
                bridge.dispatch(args).await;
            }
            debug!("event bridge subscription ended");
        }));
    }

    async fn dispatch(&self, args: Vec<Value>) {
        let Some(handle) = args.first().and_then(Value::as_str) else {
            warn!(?args, "event notification without handle");
            return;
        };
        let payload = match args.get(1).cloned().map(serde_json::from_value::<EventArgs>) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                warn!(handle, error = %e, "undecodable event payload");
                return;
            }
            None => EventArgs::default(),
        };
        self.deliver(handle, payload).await;
    }

    /// Runs the callback for `handle`; a truthy result removes the
    /// registration before the next notification is looked at.
    pub(crate) async fn deliver(&self, handle: &str, args: EventArgs) {
        let Some(cb) = self.inner.table.lock().get(handle).map(|r| r.callback.clone()) else {
            debug!(handle, "event for unknown handle dropped");
            return;
        };
        let event = args.event.clone();
        match AssertUnwindSafe(async move { cb(args).await }).catch_unwind().await {
            Ok(Ok(true)) => self.unregister(handle).await,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(handle, event = %event, error = %e, "event callback failed"),
            Err(_) => warn!(handle, event = %event, "event callback panicked"),
        }
    }
}
