// review-bridge/src/editor.rs

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("editor connection is not available")]
    Disconnected,
    #[error("editor request `{method}` timed out")]
    Timeout { method: String },
    #[error("editor rejected `{method}`: {message}")]
    Rpc { method: String, message: String },
    #[error("unexpected reply to `{method}`: {detail}")]
    Decode { method: String, detail: String },
    #[error("editor transport: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handle to the editor connection. Constructed once in `main` and
/// passed down; nothing in the crate reaches for a global client.
pub type Editor = Arc<dyn EditorClient>;

/// Capability set the core needs from the editor process.
///
/// Implementors provide the four transport primitives; everything else is a
/// typed convenience over `request`. Arguments and results travel as JSON
/// values; editor handles (buffers, windows, tabpages) are plain integers.
#[async_trait]
pub trait EditorClient: Send + Sync {
    async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, EditorError>;

    /// Stream of notification payloads for `method`. Each call creates a new
    /// subscriber; callers that need exactly one must hold on to it.
    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Vec<Value>>;

    /// Channel id the editor assigned to this connection (target of `rpcnotify`).
    fn channel_id(&self) -> i64;

    fn is_connected(&self) -> bool;

    async fn exec_lua(&self, code: &str, args: Vec<Value>) -> Result<Value, EditorError> {
        self.request("nvim_exec_lua", vec![Value::from(code), Value::Array(args)]).await
    }

    async fn win_is_valid(&self, win: i64) -> Result<bool, EditorError> {
        let v = self.request("nvim_win_is_valid", vec![json!(win)]).await?;
        v.as_bool().ok_or_else(|| decode("nvim_win_is_valid", &v))
    }

    async fn win_get_buf(&self, win: i64) -> Result<i64, EditorError> {
        let v = self.request("nvim_win_get_buf", vec![json!(win)]).await?;
        v.as_i64().ok_or_else(|| decode("nvim_win_get_buf", &v))
    }
}

fn decode(method: &str, got: &Value) -> EditorError {
    EditorError::Decode { method: method.to_owned(), detail: format!("got {got}") }
}

/// Buffer state as seen by `checkDocumentDirty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DocumentState {
    pub open: bool,
    pub dirty: bool,
}

const DOCUMENT_STATE: &str = r#"-- review_bridge:document_state
local path = ...
for _, buf in ipairs(vim.api.nvim_list_bufs()) do
  if vim.api.nvim_buf_is_loaded(buf) and vim.api.nvim_buf_get_name(buf) == path then
    return { open = true, dirty = vim.bo[buf].modified }
  end
end
return { open = false, dirty = false }
"#;

pub async fn document_state(editor: &dyn EditorClient, path: &str) -> Result<DocumentState, EditorError> {
    let v = editor.exec_lua(DOCUMENT_STATE, vec![Value::from(path)]).await?;
    Ok(DocumentState {
        open: v.get("open").and_then(Value::as_bool).unwrap_or(false),
        dirty: v.get("dirty").and_then(Value::as_bool).unwrap_or(false),
    })
}

const OPEN_FILE: &str = r#"-- review_bridge:open_file
local path, frontmost, start_text, end_text = ...
if not frontmost then
  vim.cmd('badd ' .. vim.fn.fnameescape(path))
  return { opened = true, selected = false }
end
vim.cmd('edit ' .. vim.fn.fnameescape(path))
if start_text == nil or start_text == vim.NIL or start_text == '' then
  return { opened = true, selected = false }
end
local lines = vim.api.nvim_buf_get_lines(0, 0, -1, false)
local function find(needle, from)
  for i = from, #lines do
    local col = lines[i]:find(needle, 1, true)
    if col then return i, col end
  end
end
local srow, scol = find(start_text, 1)
if not srow then return { opened = true, selected = false } end
local erow, ecol = srow, scol + #start_text - 1
if end_text ~= nil and end_text ~= vim.NIL and end_text ~= '' then
  local r, c = find(end_text, srow)
  if r then erow, ecol = r, c + #end_text - 1 end
end
vim.api.nvim_win_set_cursor(0, { srow, scol - 1 })
vim.cmd('normal! v')
vim.api.nvim_win_set_cursor(0, { erow, math.max(ecol - 1, 0) })
return { opened = true, selected = true }
"#;

/// Opens `path` in the editor, optionally selecting the span between the
/// first occurrence of `start_text` and the following `end_text`.
pub async fn open_file(
    editor: &dyn EditorClient,
    path: &str,
    make_frontmost: bool,
    start_text: Option<&str>,
    end_text: Option<&str>,
) -> Result<bool, EditorError> {
    let args = vec![Value::from(path), Value::from(make_frontmost), json!(start_text), json!(end_text)];
    let v = editor.exec_lua(OPEN_FILE, args).await?;
    Ok(v.get("selected").and_then(Value::as_bool).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEditor;

    #[tokio::test]
    async fn typed_helpers_decode_replies() {
        let fake = FakeEditor::new();
        fake.respond("nvim_win_is_valid", json!(true));
        fake.respond("nvim_win_get_buf", json!(5));
        assert!(fake.win_is_valid(1000).await.unwrap());
        assert_eq!(fake.win_get_buf(1000).await.unwrap(), 5);
        assert_eq!(fake.last_call("nvim_win_get_buf").unwrap(), vec![json!(1000)]);
    }

    #[tokio::test]
    async fn malformed_reply_is_a_decode_error() {
        let fake = FakeEditor::new();
        fake.respond("nvim_win_get_buf", json!("nope"));
        let err = fake.win_get_buf(1).await.unwrap_err();
        assert!(matches!(err, EditorError::Decode { .. }));
    }

    #[tokio::test]
    async fn document_state_reads_lua_table() {
        let fake = FakeEditor::new();
        fake.respond("review_bridge:document_state", json!({ "open": true, "dirty": true }));
        let st = document_state(&fake, "/w/a.rs").await.unwrap();
        assert_eq!(st, DocumentState { open: true, dirty: true });
    }

    #[tokio::test]
    async fn disconnected_editor_fails_fast() {
        let fake = FakeEditor::new();
        fake.disconnect();
        assert!(matches!(fake.exec_lua("return 1", vec![]).await, Err(EditorError::Disconnected)));
    }
}
