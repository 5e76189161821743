// review-bridge/src/nvim_rpc.rs
//
// msgpack-RPC client for a Neovim socket. Frames are `[0, id, method, args]`
// (request), `[1, id, error, result]` (response) and `[2, method, args]`
// (notification).

use async_trait::async_trait;
use parking_lot::Mutex;
use rmpv::Value as Mp;
use serde_json::{Map, Number, Value};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

use crate::editor::{EditorClient, EditorError};

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

type Reply = Result<Mp, EditorError>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<Value>>>>>,
    next_id: AtomicU64,
    channel_id: AtomicI64,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct NvimConnection {
    shared: Arc<Shared>,
}

impl NvimConnection {
    /// Connects to `address`: `host:port` means TCP, anything else is a unix socket path.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, EditorError> {
        if is_tcp_address(address) {
            let stream = tokio::net::TcpStream::connect(address).await?;
            let (r, w) = tokio::io::split(stream);
            return Self::from_io(r, w, timeout).await;
        }
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(address).await?;
            let (r, w) = tokio::io::split(stream);
            Self::from_io(r, w, timeout).await
        }
        #[cfg(not(unix))]
        {
            Err(EditorError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unix sockets unavailable for {address}"),
            )))
        }
    }

    pub async fn from_io<R, W>(reader: R, writer: W, timeout: Duration) -> Result<Self, EditorError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channel_id: AtomicI64::new(0),
            connected: AtomicBool::new(true),
            closed: watch::channel(false).0,
            timeout,
        });
        tokio::spawn(read_loop(shared.clone(), reader));

        let conn = Self { shared };
        let info = conn.request("nvim_get_api_info", vec![]).await?;
        let chan = info.get(0).and_then(Value::as_i64).ok_or_else(|| EditorError::Decode {
            method: "nvim_get_api_info".into(),
            detail: "missing channel id".into(),
        })?;
        conn.shared.channel_id.store(chan, Ordering::SeqCst);
        info!(channel = chan, "connected to editor");
        Ok(conn)
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn is_tcp_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains('/') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[async_trait]
impl EditorClient for NvimConnection {
    async fn request(&self, method: &str, args: Vec<Value>) -> Result<Value, EditorError> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(EditorError::Disconnected);
        }
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(id, tx);

        let frame = Mp::Array(vec![
            Mp::from(REQUEST),
            Mp::from(id),
            Mp::from(method),
            Mp::Array(args.iter().map(to_msgpack).collect()),
        ]);
        if let Err(e) = shared.write_frame(&frame).await {
            shared.pending.lock().remove(&id);
            return Err(e);
        }
        debug!(id, method, "editor request sent");

        match tokio::time::timeout(shared.timeout, rx).await {
            Ok(Ok(reply)) => reply.map(from_msgpack).map_err(|e| match e {
                EditorError::Rpc { message, .. } => EditorError::Rpc { method: method.to_owned(), message },
                other => other,
            }),
            Ok(Err(_)) => Err(EditorError::Disconnected),
            Err(_) => {
                shared.pending.lock().remove(&id);
                Err(EditorError::Timeout { method: method.to_owned() })
            }
        }
    }

    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.connected.load(Ordering::SeqCst) {
            self.shared.subscribers.lock().entry(method.to_owned()).or_default().push(tx);
        }
        rx
    }

    fn channel_id(&self) -> i64 { self.shared.channel_id.load(Ordering::SeqCst) }

    fn is_connected(&self) -> bool { self.shared.connected.load(Ordering::SeqCst) }
}

impl Shared {
    async fn write_frame(&self, frame: &Mp) -> Result<(), EditorError> {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, frame)
            .map_err(|e| EditorError::Io(std::io::Error::other(e.to_string())))?;
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }

    async fn handle_frame(&self, frame: Mp) {
        let Mp::Array(parts) = frame else {
            warn!("ignoring non-array frame from editor");
            return;
        };
        match parts.first().and_then(Mp::as_u64) {
            Some(RESPONSE) if parts.len() == 4 => {
                let Some(id) = parts[1].as_u64() else { return };
                let Some(tx) = self.pending.lock().remove(&id) else {
                    debug!(id, "response for unknown request");
                    return;
                };
                let reply = if parts[2].is_nil() {
                    Ok(parts[3].clone())
                } else {
                    Err(EditorError::Rpc { method: String::new(), message: error_message(&parts[2]) })
                };
                let _ = tx.send(reply);
            }
            Some(NOTIFICATION) if parts.len() == 3 => {
                let Some(method) = parts[1].as_str() else { return };
                let args: Vec<Value> = match &parts[2] {
                    Mp::Array(a) => a.iter().cloned().map(from_msgpack).collect(),
                    other => vec![from_msgpack(other.clone())],
                };
                let mut subs = self.subscribers.lock();
                if let Some(list) = subs.get_mut(method) {
                    list.retain(|tx| tx.send(args.clone()).is_ok());
                }
            }
            Some(REQUEST) if parts.len() == 4 => {
                let Some(id) = parts[1].as_u64() else { return };
                let method = parts[2].as_str().unwrap_or_default().to_owned();
                warn!(method = %method, "editor sent a request; not served");
                let reply = Mp::Array(vec![
                    Mp::from(RESPONSE),
                    Mp::from(id),
                    Mp::from(format!("review-bridge does not serve `{method}`")),
                    Mp::Nil,
                ]);
                if let Err(e) = self.write_frame(&reply).await {
                    warn!(error = %e, "failed to answer editor request");
                }
            }
            _ => warn!("ignoring malformed frame from editor"),
        }
    }

    fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(EditorError::Disconnected));
        }
        self.subscribers.lock().clear();
        let _ = self.closed.send(true);
        info!("editor connection closed");
    }
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut reader: R) {
    let mut buf = Vec::with_capacity(16 * 1024);
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "editor read failed");
                break;
            }
        }
        match decode_frames(&mut buf) {
            Ok(frames) => {
                for f in frames {
                    shared.handle_frame(f).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable data from editor");
                break;
            }
        }
    }
    shared.shutdown();
}

/// Pops every complete msgpack value off the front of `buf`, leaving a
/// trailing partial value in place for the next read.
pub(crate) fn decode_frames(buf: &mut Vec<u8>) -> Result<Vec<Mp>, rmpv::decode::Error> {
    let mut frames = Vec::new();
    let mut consumed = 0usize;
    loop {
        if consumed == buf.len() {
            break;
        }
        let mut cur = Cursor::new(&buf[consumed..]);
        match rmpv::decode::read_value(&mut cur) {
            Ok(v) => {
                consumed += cur.position() as usize;
                frames.push(v);
            }
            Err(e) if is_incomplete(&e) => break,
            Err(e) => return Err(e),
        }
    }
    buf.drain(..consumed);
    Ok(frames)
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn error_message(err: &Mp) -> String {
    match err {
        Mp::Array(parts) => parts.get(1).and_then(Mp::as_str).map(str::to_owned).unwrap_or_else(|| err.to_string()),
        Mp::String(s) => s.as_str().unwrap_or_default().to_owned(),
        other => other.to_string(),
    }
}

pub(crate) fn to_msgpack(v: &Value) -> Mp {
    match v {
        Value::Null => Mp::Nil,
        Value::Bool(b) => Mp::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Mp::from(i)
            } else if let Some(u) = n.as_u64() {
                Mp::from(u)
            } else {
                Mp::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Mp::from(s.as_str()),
        Value::Array(items) => Mp::Array(items.iter().map(to_msgpack).collect()),
        Value::Object(map) => Mp::Map(map.iter().map(|(k, v)| (Mp::from(k.as_str()), to_msgpack(v))).collect()),
    }
}

/// Editor handles arrive as msgpack ext values wrapping an integer; they are
/// flattened to that integer.
pub(crate) fn from_msgpack(v: Mp) -> Value {
    match v {
        Mp::Nil => Value::Null,
        Mp::Boolean(b) => Value::Bool(b),
        Mp::Integer(i) => i
            .as_i64()
            .map(Value::from)
            .or_else(|| i.as_u64().map(Value::from))
            .unwrap_or(Value::Null),
        Mp::F32(f) => Number::from_f64(f64::from(f)).map(Value::Number).unwrap_or(Value::Null),
        Mp::F64(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Mp::String(s) => s.into_str().map(Value::String).unwrap_or(Value::Null),
        Mp::Binary(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
        Mp::Array(items) => Value::Array(items.into_iter().map(from_msgpack).collect()),
        Mp::Map(pairs) => {
            let mut out = Map::new();
            for (k, v) in pairs {
                let key = k.as_str().map(str::to_owned).unwrap_or_else(|| k.to_string());
                out.insert(key, from_msgpack(v));
            }
            Value::Object(out)
        }
        Mp::Ext(_, data) => rmpv::decode::read_value(&mut data.as_slice()).map(from_msgpack).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(v: &Mp) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, v).unwrap();
        out
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let a = encode(&Mp::Array(vec![Mp::from(2u64), Mp::from("ev"), Mp::Array(vec![Mp::from(1)])]));
        let b = encode(&Mp::Array(vec![Mp::from(1u64), Mp::from(3u64), Mp::Nil, Mp::from("ok")]));
        let mut buf = a.clone();
        buf.extend_from_slice(&b[..b.len() - 2]);

        let frames = decode_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(buf.len(), b.len() - 2);

        buf.extend_from_slice(&b[b.len() - 2..]);
        let frames = decode_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn ext_handles_flatten_to_integers() {
        let mut handle = Vec::new();
        rmpv::encode::write_value(&mut handle, &Mp::from(42)).unwrap();
        let v = from_msgpack(Mp::Map(vec![(Mp::from("win"), Mp::Ext(1, handle))]));
        assert_eq!(v, json!({ "win": 42 }));
    }

    #[test]
    fn json_values_cross_the_codec() {
        let v = json!({ "buf": 3, "name": "a.rs", "ok": true, "lines": ["x", "y"], "none": null });
        assert_eq!(from_msgpack(to_msgpack(&v)), v);
    }

    #[test]
    fn tcp_addresses_are_recognised() {
        assert!(is_tcp_address("127.0.0.1:6666"));
        assert!(is_tcp_address("localhost:7777"));
        assert!(!is_tcp_address("/tmp/nvim.sock"));
        assert!(!is_tcp_address("/run/user/1000/nvim.123.0"));
    }

    #[tokio::test]
    async fn requests_resolve_and_notifications_fan_out() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        // Minimal editor: answers every request with [chan, {}] and pushes one notification.
        let editor = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = vec![0u8; 4096];
            let mut answered = 0;
            while answered < 2 {
                let n = sr.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                for frame in decode_frames(&mut buf).unwrap() {
                    let Mp::Array(parts) = frame else { continue };
                    let id = parts[1].as_u64().unwrap();
                    let info = Mp::Array(vec![Mp::from(5), Mp::Map(vec![])]);
                    let reply = Mp::Array(vec![Mp::from(1u64), Mp::from(id), Mp::Nil, info]);
                    sw.write_all(&encode(&reply)).await.unwrap();
                    answered += 1;
                }
                let note = Mp::Array(vec![Mp::from(2u64), Mp::from("ping"), Mp::Array(vec![Mp::from("h")])]);
                sw.write_all(&encode(&note)).await.unwrap();
            }
        });

        let conn = NvimConnection::from_io(cr, cw, Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.channel_id(), 5);
        let mut rx = conn.subscribe("ping");
        let reply = conn.request("nvim_get_mode", vec![]).await.unwrap();
        assert_eq!(reply[0], json!(5));
        assert_eq!(rx.recv().await.unwrap(), vec![json!("h")]);
        editor.await.unwrap();
    }
}
