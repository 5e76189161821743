use async_trait::async_trait;
use review_bridge::{
    http::{self, AUTH_HEADER, SESSION_HEADER},
    router::{RouterSettings, SessionRouter, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolRegistry},
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;

const TOKEN: &str = "test-token";

struct Upper;

#[async_trait]
impl ToolHandler for Upper {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "upper",
            description: "Uppercase a string",
            input_schema: json!({ "type": "object", "properties": { "text": { "type": "string" } } }),
        }
    }

    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, ToolError> {
        let text = args.get("text").and_then(Value::as_str).ok_or_else(|| ToolError::InvalidParams("text".into()))?;
        Ok(json!(text.to_uppercase()))
    }
}

struct Server {
    base: String,
    router: SessionRouter,
    client: reqwest::Client,
}

async fn start() -> Server {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Upper));
    let router = SessionRouter::new(RouterSettings::default(), tools);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::routes(router.clone(), TOKEN);
    tokio::spawn(http::serve(listener, app, std::future::pending()));
    Server { base: format!("http://{addr}"), router, client: reqwest::Client::new() }
}

impl Server {
    fn post(&self, session: Option<&str>, body: Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}/mcp", self.base)).header(AUTH_HEADER, TOKEN).json(&body);
        if let Some(id) = session {
            req = req.header(SESSION_HEADER, id);
        }
        req
    }

    async fn initialize(&self) -> String {
        let resp = self
            .post(None, json!({ "jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {} }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.headers()[SESSION_HEADER].to_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let s = start().await;
    let resp = s
        .client
        .post(format!("{}/mcp", s.base))
        .json(&json!({ "jsonrpc": "2.0", "id": 0, "method": "initialize" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(s.router.session_count(), 0);
}

#[tokio::test]
async fn each_initialize_mints_a_distinct_session() {
    let s = start().await;
    let a = s.initialize().await;
    let b = s.initialize().await;
    assert_ne!(a, b);
    assert_eq!(s.router.session_count(), 2);
}

#[tokio::test]
async fn unknown_session_is_rejected_with_invalid_session() {
    let s = start().await;
    let resp = s.post(Some("missing"), json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);
    assert_eq!(s.router.session_count(), 0);
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let s = start().await;
    let resp = s
        .client
        .post(format!("{}/mcp", s.base))
        .header(AUTH_HEADER, TOKEN)
        .header("content-type", "application/json")
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn tools_are_listed_and_callable() {
    let s = start().await;
    let id = s.initialize().await;

    let resp = s.post(Some(&id), json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })).send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["tools"][0]["name"], "upper");
    assert!(body["result"]["tools"][0]["inputSchema"].is_object());

    let params = json!({ "name": "upper", "arguments": { "text": "ok" } });
    let call = json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": params });
    let body: Value = s.post(Some(&id), call).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "OK");

    let note = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
    assert_eq!(s.post(Some(&id), note).send().await.unwrap().status(), 202);
}

#[tokio::test]
async fn delete_closes_the_session() {
    let s = start().await;
    let id = s.initialize().await;
    let resp = s
        .client
        .delete(format!("{}/mcp", s.base))
        .header(AUTH_HEADER, TOKEN)
        .header(SESSION_HEADER, &id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(!s.router.contains(&id));

    let resp = s.post(Some(&id), json!({ "jsonrpc": "2.0", "id": 4, "method": "ping" })).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

async fn read_until(resp: &mut reqwest::Response, needle: &str) -> String {
    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.contains(needle) {
            let chunk = resp.chunk().await.unwrap().expect("stream ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("timed out waiting for stream data");
    seen
}

#[tokio::test]
async fn legacy_stream_announces_endpoint_and_carries_replies() {
    let s = start().await;
    let mut stream = s.client.get(format!("{}/sse", s.base)).header(AUTH_HEADER, TOKEN).send().await.unwrap();
    assert_eq!(stream.status(), 200);

    let head = read_until(&mut stream, "sessionId=").await;
    assert!(head.contains("endpoint"));
    let endpoint = head
        .lines()
        .find_map(|l| l.strip_prefix("data:"))
        .expect("endpoint data line")
        .trim()
        .to_string();
    assert_eq!(s.router.session_count(), 1);

    let resp = s
        .client
        .post(format!("{}{endpoint}", s.base))
        .header(AUTH_HEADER, TOKEN)
        .json(&json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let rest = read_until(&mut stream, "\"id\":7").await;
    assert!(rest.contains("message"));
}
