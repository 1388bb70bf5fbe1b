//! Test helpers: a minimal HTTP responder on a loopback port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
pub const UNAVAILABLE: &str =
    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
pub const REDIRECT: &str =
    "HTTP/1.1 302 Found\r\nlocation: /login\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Build a 200 response with a body and extra header lines
pub fn ok_with(headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n{}content-length: {}\r\nconnection: close\r\n\r\n{}",
        headers,
        body.len(),
        body
    )
}

/// Running stub server
pub struct StubServer {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
    /// Request lines seen, e.g. `POST /quietDown HTTP/1.1`
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Answer request `n` with `responses[n]`; the last response repeats
pub async fn serve(responses: Vec<String>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::clone(&hits);
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let response = responses[n.min(responses.len() - 1)].clone();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let text = String::from_utf8_lossy(&buf);
            if let Some(line) = text.lines().next() {
                seen.lock().unwrap().push(line.to_string());
            }

            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    StubServer {
        base_url: format!("http://{}", addr),
        hits,
        requests,
    }
}
