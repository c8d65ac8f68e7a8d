//! Shared helpers: a proxy on an ephemeral port and raw-socket backends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use splitgate::{Config, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// A running proxy. Dropping `shutdown` (or sending on it) stops it.
pub struct Proxy {
    pub addr: SocketAddr,
    pub shutdown: oneshot::Sender<()>,
    pub task: JoinHandle<Result<(), splitgate::Error>>,
}

pub async fn spawn_proxy(primary_port: u16, secondary_port: u16) -> Proxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Config {
        listen_port: addr.port(),
        primary_port,
        secondary_port,
        shutdown_grace: Duration::from_millis(200),
        ..Config::default()
    };
    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(Server::new(config).serve_on(listener, async {
        let _ = rx.await;
    }));
    Proxy { addr, shutdown, task }
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Backend that answers every request on every connection with `200` and
/// `name` as the body. Request bodies are not expected.
pub async fn spawn_named_backend(name: &'static str) -> u16 {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                while read_head(&mut socket).await.is_some() {
                    let resp = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{name}", name.len());
                    if socket.write_all(resp.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Reads up to and including the blank line. Returns the head as text and
/// whatever was read past it, or `None` on EOF first.
pub async fn read_head<R: AsyncRead + Unpin>(io: &mut R) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Some((String::from_utf8_lossy(&buf).into_owned(), rest));
        }
        let n = io.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads one `Content-Length` framed response.
pub async fn read_response<R: AsyncRead + Unpin>(io: &mut R) -> (String, Vec<u8>) {
    let (head, mut body) = tokio::time::timeout(WAIT, read_head(io))
        .await
        .expect("timed out waiting for response head")
        .expect("connection closed before response head");
    let len = content_length(&head).unwrap_or(0);
    while body.len() < len {
        let mut chunk = vec![0u8; len - body.len()];
        let n = io.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

/// Reads until EOF or a reset, whichever comes first.
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(WAIT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return out,
            Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            Err(_) => panic!("connection still open after {WAIT:?}"),
        }
    }
}

pub fn content_length(head: &str) -> Option<usize> {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
