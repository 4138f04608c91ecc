//! Scripted HTTP server for tests.
//!
//! Each path holds a queue of responses. Requests pop from the front; the
//! last response repeats forever. Unscripted paths answer 404. Query
//! strings are ignored when matching.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), content_type.into())],
            body: body.into(),
            delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new(), delay: None }
    }

    pub fn pdf(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(200, "application/pdf", bytes)
    }

    pub fn html(html: &str) -> Self {
        Self::new(200, "text/html; charset=utf-8", html)
    }

    pub fn xml(xml: &str) -> Self {
        Self::new(200, "application/xml", xml)
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(200, "application/json", value.to_string())
    }

    /// 302 to `location`.
    pub fn redirect(location: &str) -> Self {
        Self::status(302).with_header("location", location)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl Shared {
    fn next_response(&self, path: &str) -> Option<MockResponse> {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let queue = routes.get_mut(path)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

pub struct MockServer {
    base_url: String,
    shared: Arc<Shared>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    pub async fn start() -> anyhow::Result<Self> {
        let shared = Arc::new(Shared::default());
        let app = Router::new().fallback(serve_scripted).with_state(shared.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { base_url: format!("http://{addr}"), shared, handle })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Replace the script for `path`.
    pub fn script(&self, path: &str, responses: Vec<MockResponse>) {
        let mut routes = self.shared.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.insert(path.to_string(), responses.into());
    }

    /// Answer every request to `path` with `response`.
    pub fn respond(&self, path: &str, response: MockResponse) {
        self.script(path, vec![response]);
    }

    /// Requests received for `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.shared.hits.lock().unwrap_or_else(|p| p.into_inner());
        hits.get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        let hits = self.shared.hits.lock().unwrap_or_else(|p| p.into_inner());
        hits.values().sum()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_scripted(State(shared): State<Arc<Shared>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    {
        let mut hits = shared.hits.lock().unwrap_or_else(|p| p.into_inner());
        *hits.entry(path.clone()).or_default() += 1;
    }

    let Some(scripted) = shared.next_response(&path) else {
        return (StatusCode::NOT_FOUND, format!("no script for {path}")).into_response();
    };
    if let Some(delay) = scripted.delay {
        tokio::time::sleep(delay).await;
    }

    let mut builder = Response::builder().status(scripted.status);
    for (name, value) in &scripted.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(scripted.body))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}
