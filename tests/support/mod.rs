//! Minimal hand-rolled HTTP/1.1 mock responder used by the end-to-end
//! scenario tests. `Gateway` posts plain-text OpenAI-compatible JSON over
//! `reqwest`'s default client, which speaks HTTP/1.1 without prior-knowledge
//! h2 negotiation for `http://` URLs — a raw `TcpListener` loop is enough to
//! stand in for `openrouter`/`dashscope` without pulling in a mocking crate.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One request the server received, for assertions on call count/ordering.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub body: Value,
}

type Responder = dyn Fn(&str, &Value) -> (u16, Value) + Send + Sync;

pub struct MockServer {
    pub addr: SocketAddr,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockServer {
    /// Spawns a background accept loop; dropping the returned `MockServer`
    /// does not stop it, which is fine for the lifetime of a single test.
    pub async fn start(handler: impl Fn(&str, &Value) -> (u16, Value) + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock server local addr");
        let calls: Arc<Mutex<Vec<RecordedCall>>> = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Responder> = Arc::new(handler);

        let calls_bg = calls.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let handler = handler.clone();
                let calls = calls_bg.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, handler, calls).await;
                });
            }
        });

        Self { addr, calls }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

async fn serve_one(mut stream: TcpStream, handler: Arc<Responder>, calls: Arc<Mutex<Vec<RecordedCall>>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 1_000_000 {
            return Ok(());
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = v.trim().parse().unwrap_or(0);
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    calls.lock().unwrap().push(RecordedCall { path: path.clone(), body: body_json.clone() });

    let (status, resp_json) = handler(&path, &body_json);
    let resp_body = serde_json::to_vec(&resp_json).unwrap_or_default();
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let header = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp_body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&resp_body).await?;
    stream.shutdown().await?;
    Ok(())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Shapes a `{"choices":[{"message":{"content": ...}}]}` body, the
/// OpenAI-compatible shape `Gateway::query_openai_compatible` parses.
pub fn chat_body(content: &str) -> Value {
    serde_json::json!({"choices": [{"message": {"content": content}}]})
}

/// Shapes a `{"data":[{"index":0,"embedding":[...]}, ...]}` body, the shape
/// `Gateway::query_openai_compatible_embeddings` parses.
pub fn embeddings_body(vectors: &[Vec<f32>]) -> Value {
    let data: Vec<Value> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| serde_json::json!({"index": i, "embedding": v}))
        .collect();
    serde_json::json!({"data": data})
}
