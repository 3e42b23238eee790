//! A minimal HTTP/1.1 server for exercising the real fetcher.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A canned response.
#[derive(Debug, Clone)]
pub struct StubResponse {
    status: u16,
    body: String,
    delay: Option<Duration>,
}

impl StubResponse {
    /// `200 OK` with a JSON body.
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: None,
        }
    }

    /// An empty response with `status`.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            delay: None,
        }
    }

    /// Waits before writing the response.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn to_http(&self) -> String {
        let reason = if (200..300).contains(&self.status) {
            "OK"
        } else {
            "Error"
        };
        format!(
            "HTTP/1.1 {} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.body.len(),
            self.body
        )
    }
}

type Route = dyn Fn(&str) -> StubResponse + Send + Sync;

/// Serves [`StubResponse`]s chosen by request path, and counts hits per path.
///
/// Stops accepting when dropped.
pub struct StubServer {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for StubServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl StubServer {
    /// Binds an ephemeral local port and starts serving.
    pub async fn start<F>(route: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let route: Arc<Route> = Arc::new(route);
        let hits = Arc::new(Mutex::new(HashMap::new()));

        let accept_hits = Arc::clone(&hits);
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let route = Arc::clone(&route);
                let hits = Arc::clone(&accept_hits);
                tokio::spawn(serve(socket, route, hits));
            }
        });

        Ok(Self { addr, hits, handle })
    }

    /// Absolute URL for `path` on this server.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received for `path`.
    #[must_use]
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    route: Arc<Route>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
) {
    let Some(path) = read_request_path(&mut socket).await else {
        return;
    };
    *hits.lock().entry(path.clone()).or_insert(0) += 1;

    let response = route(&path);
    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }
    let _ = socket.write_all(response.to_http().as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request_path(socket: &mut TcpStream) -> Option<String> {
    let mut request = Vec::new();
    let mut buf = [0_u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 || request.len() > 64 * 1024 {
            return None;
        }
        request.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&request);
    let line = head.lines().next()?;
    line.split_whitespace().nth(1).map(str::to_string)
}
