//! Hand-written HTTP/1.1 front-end.
//!
//! The live streaming paths need the raw socket: an unbounded response body
//! written by the merged-write loop, and a parallel receive coroutine whose
//! only job is to notice a half-closed TCP promptly. A framework would hide
//! both, so requests are parsed here the way the RTSP example servers do.

pub mod api;
pub mod stream;

use crate::server::ServerContext;
use crate::webrtc::server::RtcServer;
use bytes::{Bytes, BytesMut};
use log::debug;
use runtime::CoroutineContext;
use shared::error::{Error, Result};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// One parsed request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Query string without the `?`, empty when absent.
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|h| h.split(':').next().unwrap_or(h))
    }
}

/// Reads and parses one request from the socket.
pub async fn read_request<S: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    timeout: Duration,
) -> Result<HttpRequest> {
    let mut buf = BytesMut::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::HttpParse("headers too large".into()));
        }
        crate::io::read_some(ctx, stream, &mut buf, timeout).await?;
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Error::HttpParse("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::HttpParse("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| Error::HttpParse("missing target".into()))?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| Error::HttpParse(format!("bad header line: {line}")))?;
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    let mut req = HttpRequest {
        method,
        path,
        query,
        headers,
        body: Bytes::new(),
    };

    let content_length: usize = req
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(Error::HttpParse("body too large".into()));
    }
    let mut body = BytesMut::from(&buf[header_end + 4..]);
    while body.len() < content_length {
        crate::io::read_some(ctx, stream, &mut body, timeout).await?;
    }
    body.truncate(content_length);
    req.body = body.freeze();
    Ok(req)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Writes a complete (non-streaming) response.
pub async fn write_response<S: AsyncWrite + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        403 => "Forbidden",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nServer: rill\r\nContent-Type: {content_type}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    ctx.timeout(Duration::from_secs(10), stream.write_all(&out))
        .await?;
    Ok(())
}

/// Serves one accepted HTTP connection: live mounts, API, RTC signaling.
pub async fn serve<S>(
    ctx: CoroutineContext,
    mut io: S,
    peer: SocketAddr,
    sc: Rc<ServerContext>,
    rtc: Option<Rc<RtcServer>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let req = read_request(&ctx, &mut io, Duration::from_secs(30)).await?;
    debug!("[{}] http {} {}", ctx.cid(), req.method, req.path);

    if stream::is_live_path(&req.path) {
        return stream::serve_live(ctx, io, peer, req, sc).await;
    }
    if req.path.starts_with("/api/") || req.path.starts_with("/rtc/") || req.path.starts_with("/gb/")
    {
        return api::handle(&ctx, &mut io, peer, req, sc, rtc).await;
    }
    write_response(&ctx, &mut io, 404, "application/json", b"{\"code\":404}").await
}
