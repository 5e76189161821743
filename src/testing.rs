//! In-memory editor used by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;

use crate::editor::{EditorClient, EditorError};

/// Records every request, answers from a table of scripted replies and lets
/// tests push notifications as if the editor had sent them.
///
/// A scripted reply matches when its needle equals the method name or, for
/// `nvim_exec_lua`, when the Lua chunk contains the needle.
pub struct FakeEditor {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    replies: Mutex<Vec<(String, Value)>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<Value>>>>>,
    connected: AtomicBool,
}

impl FakeEditor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn respond(&self, needle: &str, reply: Value) {
        self.replies.lock().push((needle.to_owned(), reply));
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Delivers a notification to every live subscriber of `method`.
    pub fn emit(&self, method: &str, args: Vec<Value>) {
        if let Some(subs) = self.subscribers.lock().get_mut(method) {
            subs.retain(|tx| tx.send(args.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self, method: &str) -> usize {
        self.subscribers.lock().get(method).map_or(0, Vec::len)
    }

    /// Number of requests whose method or Lua chunk contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls.lock().iter().filter(|(m, args)| matches(needle, m, args)).count()
    }

    /// Arguments of the last matching request.
    pub fn last_call(&self, needle: &str) -> Option<Vec<Value>> {
        self.calls.lock().iter().rev().find(|(m, args)| matches(needle, m, args)).map(|(_, a)| a.clone())
    }
}

fn matches(needle: &str, method: &str, args: &[Value]) -> bool {
    if method == needle {
        return true;
    }
    method == "nvim_exec_lua" && args.first().and_then(Value::as_str).is_some_and(|code| code.contains(needle))
}

#[async_trait]
impl EditorClient for FakeEditor {
    async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, EditorError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EditorError::Disconnected);
        }
        let reply = self
            .replies
            .lock()
            .iter()
            .rev()
            .find(|(needle, _)| matches(needle, method, &args))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null);
        self.calls.lock().push((method.to_owned(), args));
        Ok(reply)
    }

    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(method.to_owned()).or_default().push(tx);
        rx
    }

    fn channel_id(&self) -> i64 { 7 }

    fn is_connected(&self) -> bool { self.connected.load(Ordering::SeqCst) }
}
