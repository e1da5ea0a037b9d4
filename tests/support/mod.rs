//! Minimal in-process HTTP/1.1 stub: answers each accepted connection with the
//! next canned reply and records what the client sent.

#![allow(dead_code)]

use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct Captured {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Captured {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

pub struct Reply {
    status: u16,
    content_type: &'static str,
    chunks: Vec<String>,
    content_length: Option<usize>,
    hold_open: bool,
}

impl Reply {
    /// Event-stream body written chunk by chunk, delimited by connection close.
    pub fn sse(chunks: &[&str]) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            content_length: None,
            hold_open: false,
        }
    }

    /// Event-stream body that is never finished: after the chunks the stub
    /// waits for the client to hang up.
    pub fn sse_held_open(chunks: &[&str]) -> Self {
        Self { hold_open: true, ..Self::sse(chunks) }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            chunks: vec![body.to_string()],
            content_length: Some(body.len()),
            hold_open: false,
        }
    }

    /// Declares a longer body than it sends, then closes the connection.
    pub fn truncated(status: u16, body: &str, declared_len: usize) -> Self {
        Self { content_length: Some(declared_len), ..Self::json(status, body) }
    }
}

pub struct Stub {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<Captured>>>,
    /// Signalled when the client closes a held-open connection.
    pub client_closed: Arc<Notify>,
}

impl Stub {
    pub fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub listener");
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{}", addr))
}

pub fn serve(listener: TcpListener, base_url: String, replies: Vec<Reply>) -> Stub {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let client_closed = Arc::new(Notify::new());
    let closed = client_closed.clone();
    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            if let Some(captured) = read_request(&mut socket).await {
                recorded.lock().unwrap().push(captured);
            }
            let hold_open = reply.hold_open;
            write_reply(&mut socket, reply).await;
            if hold_open {
                let closed = closed.clone();
                tokio::spawn(async move {
                    wait_for_hangup(&mut socket).await;
                    closed.notify_one();
                });
            }
        }
    });
    Stub { base_url, requests, client_closed }
}

pub async fn start(replies: Vec<Reply>) -> Stub {
    let (listener, base_url) = bind().await;
    serve(listener, base_url, replies)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

async fn read_request(socket: &mut TcpStream) -> Option<Captured> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let body = String::from_utf8_lossy(&buf[body_start..]).into_owned();

    Some(Captured { method, path, headers, body })
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) {
    let reason = match reply.status {
        200 => "OK",
        201 => "Created",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n",
        reply.status,
        reason,
        reply.content_type
    );
    if let Some(len) = reply.content_length {
        head.push_str(&format!("Content-Length: {}\r\n", len));
    }
    head.push_str("\r\n");

    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for chunk in reply.chunks {
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if !reply.hold_open {
        let _ = socket.shutdown().await;
    }
}

/// Reads until the peer closes its side (EOF) or resets the connection.
async fn wait_for_hangup(socket: &mut TcpStream) {
    let mut tmp = [0u8; 1024];
    loop {
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
