// review-bridge/src/router.rs
//
// Agent sessions: `uninitialized -> active -> closed`. A session is minted by
// an `initialize` request that carries no session id, owns a bounded push
// queue and a keep-alive timer, and is forgotten as soon as a push to its
// attached stream fails or that stream goes away.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::protocol::{
    self, Incoming, Notification, RpcError, EVENT_OPEN_FILES_CHANGED, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Request/response over POST with a server-push GET stream.
    Streamable,
    /// Event stream opened first; requests arrive on a side channel and
    /// replies travel back over the stream.
    LegacySse,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// What a tool handler may touch besides its own dependencies: the calling
/// session and a way to push to it later.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub notifier: Notifier,
}

impl ToolContext {
    pub fn notify(&self, notification: Notification) -> bool {
        self.notifier.notify(&self.session_id, notification)
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        self.tools.insert(handler.descriptor().name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> { self.tools.get(name).cloned() }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> { self.tools.values().map(|t| t.descriptor()).collect() }

    pub fn len(&self) -> usize { self.tools.len() }

    pub fn is_empty(&self) -> bool { self.tools.is_empty() }
}

/// Supplies the params of the `ide/openFilesChanged` push sent when a
/// session's stream first attaches.
pub type ContextProvider = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub server_name: String,
    pub keep_alive: Duration,
    pub push_queue: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { server_name: "review-bridge".into(), keep_alive: Duration::from_secs(30), push_queue: 256 }
    }
}

#[derive(Debug)]
pub enum RouterReply {
    /// A new session was minted by this request.
    Initialized { session_id: String, body: Value },
    Response(Value),
    /// Notification or client response; nothing to send back.
    Accepted,
    Rejected { body: Value, error: RpcError },
}

struct Session {
    kind: TransportKind,
    tx: mpsc::Sender<Value>,
    rx: Mutex<Option<mpsc::Receiver<Value>>>,
    created_notification_sent: AtomicBool,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

struct RouterInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    tools: ToolRegistry,
    settings: RouterSettings,
    initial_context: Option<ContextProvider>,
}

#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<RouterInner>,
}

/// Push handle given to tool handlers; does not keep the router alive.
#[derive(Clone)]
pub struct Notifier {
    inner: Weak<RouterInner>,
}

impl Notifier {
    pub fn notify(&self, session_id: &str, notification: Notification) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.deliver(session_id, notification.to_value()),
            None => false,
        }
    }
}

impl Session {
    fn is_attached(&self) -> bool { self.rx.lock().is_none() }
}

impl RouterInner {
    fn session(&self, id: &str) -> Option<Arc<Session>> { self.sessions.lock().get(id).cloned() }

    /// Pushes onto one session's queue. Once the stream is attached, a full
    /// or closed queue means the peer is gone: the session is closed and
    /// `false` returned. Before that, overflow is dropped and the session kept.
    fn deliver(&self, id: &str, message: Value) -> bool {
        let Some(session) = self.session(id) else { return false };
        match session.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) if !session.is_attached() => {
                debug!(session = %id, "no push stream attached, dropping push");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(session = %id, "push queue full, closing session");
                self.close(id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %id, "push stream gone, closing session");
                self.close(id);
                false
            }
        }
    }

    fn close(&self, id: &str) -> bool {
        let Some(session) = self.sessions.lock().remove(id) else { return false };
        if let Some(timer) = session.keep_alive.lock().take() {
            timer.abort();
        }
        info!(session = %id, kind = ?session.kind, "session closed");
        true
    }
}

fn spawn_keep_alive(inner: Weak<RouterInner>, id: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tick.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            let Some(session) = inner.session(&id) else { break };
            // Nobody reads the queue until a stream attaches.
            if !session.is_attached() {
                continue;
            }
            if !inner.deliver(&id, Notification::keep_alive().to_value()) {
                break;
            }
        }
    })
}

impl SessionRouter {
    pub fn new(settings: RouterSettings, tools: ToolRegistry) -> Self {
        Self::build(settings, tools, None)
    }

    pub fn with_initial_context(settings: RouterSettings, tools: ToolRegistry, provider: ContextProvider) -> Self {
        Self::build(settings, tools, Some(provider))
    }

    fn build(settings: RouterSettings, tools: ToolRegistry, initial_context: Option<ContextProvider>) -> Self {
        Self {
            inner: Arc::new(RouterInner { sessions: Mutex::new(HashMap::new()), tools, settings, initial_context }),
        }
    }

    pub fn notifier(&self) -> Notifier { Notifier { inner: Arc::downgrade(&self.inner) } }

    pub fn session_count(&self) -> usize { self.inner.sessions.lock().len() }

    pub fn contains(&self, session_id: &str) -> bool { self.inner.sessions.lock().contains_key(session_id) }

    /// Mints a session id, registers its push queue and arms keep-alive.
    pub fn open_session(&self, kind: TransportKind) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(self.inner.settings.push_queue.max(1));
        let session = Arc::new(Session {
            kind,
            tx,
            rx: Mutex::new(Some(rx)),
            created_notification_sent: AtomicBool::new(false),
            keep_alive: Mutex::new(None),
        });
        self.inner.sessions.lock().insert(id.clone(), Arc::clone(&session));
        let timer = spawn_keep_alive(Arc::downgrade(&self.inner), id.clone(), self.inner.settings.keep_alive);
        *session.keep_alive.lock() = Some(timer);
        info!(session = %id, ?kind, "session opened");
        id
    }

    pub fn close_session(&self, session_id: &str) -> bool { self.inner.close(session_id) }

    /// Drops every session, which ends every open push stream.
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.inner.close(id)).count()
    }

    /// Hands out the session's push stream. Only the first caller gets it; the
    /// first attach also queues the initial open-files snapshot.
    pub fn attach_stream(&self, session_id: &str) -> Option<mpsc::Receiver<Value>> {
        let session = self.inner.session(session_id)?;
        let rx = session.rx.lock().take()?;
        if !session.created_notification_sent.swap(true, Ordering::SeqCst)
            && let Some(provider) = &self.inner.initial_context
        {
            let note = Notification::new(EVENT_OPEN_FILES_CHANGED, provider());
            let _ = session.tx.try_send(note.to_value());
        }
        Some(rx)
    }

    /// Pushes a raw message (used for replies that travel over the stream).
    pub fn push(&self, session_id: &str, message: Value) -> bool { self.inner.deliver(session_id, message) }

    pub fn notify(&self, session_id: &str, notification: Notification) -> bool {
        self.inner.deliver(session_id, notification.to_value())
    }

    /// Best-effort fan-out; returns how many sessions accepted the push.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        let message = notification.to_value();
        let delivered = ids.iter().filter(|id| self.inner.deliver(id, message.clone())).count();
        debug!(method = notification.method, delivered, total = ids.len(), "broadcast");
        delivered
    }

    pub async fn handle(&self, session_id: Option<&str>, body: &[u8]) -> RouterReply {
        let incoming = match Incoming::parse(body) {
            Ok(m) => m,
            Err((id, error)) => return rejected(&id, error),
        };
        debug!(session = ?session_id, method = incoming.method().unwrap_or("<response>"), "incoming message");
        let session_id = match session_id {
            Some(id) if self.contains(id) => id.to_string(),
            Some(id) => {
                debug!(session = %id, "request for unknown session");
                return rejected(&request_id(&incoming), RpcError::invalid_session());
            }
            None => {
                return match incoming {
                    Incoming::Request { id, method, params } if method == METHOD_INITIALIZE => {
                        let session_id = self.open_session(TransportKind::Streamable);
                        let body = protocol::success(&id, self.initialize_result(&params));
                        RouterReply::Initialized { body, session_id }
                    }
                    other => rejected(&request_id(&other), RpcError::invalid_session()),
                };
            }
        };
        match incoming {
            Incoming::Request { id, method, params } => match self.dispatch(&session_id, &method, params).await {
                Ok(result) => RouterReply::Response(protocol::success(&id, result)),
                Err(error) => rejected(&id, error),
            },
            Incoming::Notification { method, .. } => {
                if method != METHOD_INITIALIZED {
                    debug!(session = %session_id, method = %method, "ignoring notification");
                }
                RouterReply::Accepted
            }
            Incoming::Response { .. } => RouterReply::Accepted,
        }
    }

    async fn dispatch(&self, session_id: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            METHOD_INITIALIZE => Ok(self.initialize_result(&params)),
            METHOD_PING => Ok(json!({})),
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.inner.tools.descriptors() })),
            METHOD_TOOLS_CALL => self.call_tool(session_id, params).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }

    async fn call_tool(&self, session_id: &str, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires a tool name"))?;
        let handler =
            self.inner.tools.get(name).ok_or_else(|| RpcError::invalid_params(format!("unknown tool: {name}")))?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let ctx = ToolContext { session_id: session_id.to_string(), notifier: self.notifier() };
        let Ok(result) = AssertUnwindSafe(handler.call(args, ctx)).catch_unwind().await else {
            warn!(tool = %name, "tool handler panicked");
            return Err(RpcError::internal(format!("tool {name} failed unexpectedly")));
        };
        match result {
            Ok(value) => Ok(tool_result(&value, false)),
            Err(ToolError::InvalidParams(msg)) => Err(RpcError::invalid_params(msg)),
            Err(ToolError::Failed(msg)) => {
                warn!(tool = %name, error = %msg, "tool call failed");
                Ok(tool_result(&Value::String(msg), true))
            }
        }
    }

    fn initialize_result(&self, params: &Value) -> Value {
        let version = params.get("protocolVersion").and_then(Value::as_str).unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.inner.settings.server_name, "version": env!("CARGO_PKG_VERSION") },
        })
    }
}

fn request_id(incoming: &Incoming) -> Value {
    match incoming {
        Incoming::Request { id, .. } | Incoming::Response { id } => id.clone(),
        Incoming::Notification { .. } => Value::Null,
    }
}

fn rejected(id: &Value, error: RpcError) -> RouterReply {
    RouterReply::Rejected { body: protocol::failure(id, &error), error }
}

fn tool_result(value: &Value, is_error: bool) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "content": [{ "type": "text", "text": text }], "isError": is_error })
}
