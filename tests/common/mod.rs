//! Shared helpers for driving a live server over raw TCP.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graceful_serve::{Conn, ConnState, ConnectionId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub head: String,
    pub body: String,
}

impl RawResponse {
    pub fn status(&self) -> u16 {
        self.head
            .split_whitespace()
            .nth(1)
            .and_then(|status| status.parse().ok())
            .unwrap_or(0)
    }
}

pub async fn send_request<S>(stream: &mut S, path: &str, extra_headers: &str)
where
    S: AsyncWrite + Unpin,
{
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

/// Reads one response, `None` when the server closed the connection before sending anything.
pub async fn read_response<S>(stream: &mut S) -> std::io::Result<Option<RawResponse>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(head_end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
            let body_start = head_end + 4;
            let body_end = body_start + content_length(&head);

            if buf.len() >= body_end {
                let body = String::from_utf8_lossy(&buf[body_start..body_end]).into_owned();
                return Ok(Some(RawResponse { head, body }));
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(std::io::ErrorKind::UnexpectedEof.into())
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Records every connection state transition in order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(ConnectionId, ConnState)>>>,
}

impl Recorder {
    pub fn hook(&self) -> impl Fn(&Conn, ConnState) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |conn: &Conn, state: ConnState| seen.lock().unwrap().push((conn.id(), state))
    }

    /// States of the first connection seen.
    pub fn first_connection(&self) -> Vec<ConnState> {
        let seen = self.seen.lock().unwrap();
        let Some((first, _)) = seen.first().copied() else {
            return Vec::new();
        };
        seen.iter()
            .filter(|(id, _)| *id == first)
            .map(|(_, state)| *state)
            .collect()
    }
}

/// Polls `condition` until it holds, panics after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    within(wait).await;
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}
