//! Per-connection request pipeline
//!
//! Drives one accepted connection through head parsing, the policy gate
//! (ACL, then auth), and dispatch into tunnel, cache, or forward mode.
//! Every connection handles exactly one request and then closes.

use crate::acl::{Acl, Decision};
use crate::auth::{AuthGate, AuthOutcome};
use crate::cache::{FillHandle, Lookup, ResponseCache};
use crate::common::{net, ConnectionContext, Stage};
use crate::http::{self, ParseError, Request, RequestParser};
use crate::relay::{relay, RelayCause};
use crate::stats::{AccessEvent, AccessLog, Outcome, Stats};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// The client must deliver a complete request head within this window.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// A forwarded response must show read progress within this window.
pub const RESPONSE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const STREAM_BUF_SIZE: usize = 4096;
const MAX_CHUNK_LINE: usize = 8192;

/// Connection handler holding the cross-connection shared state.
pub struct Handler {
    acl: Arc<Acl>,
    auth: Option<Arc<AuthGate>>,
    cache: Option<Arc<ResponseCache>>,
    stats: Arc<Stats>,
    access: Arc<AccessLog>,
}

impl Handler {
    pub fn new(
        acl: Arc<Acl>,
        auth: Option<Arc<AuthGate>>,
        cache: Option<Arc<ResponseCache>>,
        stats: Arc<Stats>,
        access: Arc<AccessLog>,
    ) -> Self {
        Handler {
            acl,
            auth,
            cache,
            stats,
            access,
        }
    }

    /// Run the pipeline for one accepted connection. Never returns an
    /// error; every failure is translated into a response and an event.
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let ctx = ConnectionContext::new(peer);
        let mut parser = RequestParser::new();

        let req = match timeout(HEAD_TIMEOUT, parser.parse_head(&mut stream)).await {
            Ok(Ok(req)) => req,
            Ok(Err(ParseError::Io(_))) => return,
            Ok(Err(ParseError::UnexpectedEof)) if parser.buffered_len() == 0 => {
                // Connection opened and closed without sending anything.
                return;
            }
            Ok(Err(err)) => {
                let status = match err {
                    ParseError::VersionUnsupported(_) => 505,
                    _ => 400,
                };
                let _ = stream.write_all(&http::error_response(status, None)).await;
                let reason = err.to_string();
                self.emit(&ctx, "REQUEST", "-", "-", Outcome::Error, Some(&reason));
                return;
            }
            Err(_) => {
                let _ = stream.write_all(&http::error_response(408, None)).await;
                self.emit(
                    &ctx,
                    "REQUEST",
                    "-",
                    "-",
                    Outcome::Error,
                    Some("head read timeout"),
                );
                return;
            }
        };

        ctx.set_stage(Stage::Gating);
        let request_line = req.request_line();
        debug!("[{}] {} from {}", ctx.id, request_line, peer);

        let (host, port) = match req.authority() {
            Ok((h, p)) => (h.to_string(), p),
            Err(_) => {
                let detail = "The request did not name a target host.";
                let _ = stream.write_all(&http::error_response(400, Some(detail))).await;
                self.emit(
                    &ctx,
                    "REQUEST",
                    "-",
                    &request_line,
                    Outcome::Error,
                    Some("missing authority"),
                );
                return;
            }
        };
        let target = format!("{}:{}", host, port);

        if let Decision::Deny(class) = self.acl.check(&host) {
            let detail = format!("Blocked by proxy policy ({} rule).", class);
            let _ = stream.write_all(&http::error_response(403, Some(&detail))).await;
            self.stats.record_blocked();
            let reason = class.to_string();
            self.emit(
                &ctx,
                "REQUEST",
                &target,
                &request_line,
                Outcome::Blocked,
                Some(&reason),
            );
            return;
        }

        if let Some(gate) = &self.auth {
            match gate.check(req.headers.get("proxy-authorization")) {
                AuthOutcome::Granted => {}
                outcome => {
                    let _ = stream.write_all(&http::auth_challenge()).await;
                    let reason = match outcome {
                        AuthOutcome::Challenge => "credentials required",
                        _ => "invalid credentials",
                    };
                    self.emit(
                        &ctx,
                        "REQUEST",
                        &target,
                        &request_line,
                        Outcome::Auth,
                        Some(reason),
                    );
                    return;
                }
            }
        }

        if req.is_connect() {
            self.tunnel(stream, parser, &req, &host, port, &ctx).await;
            return;
        }

        let mut fill = None;
        if req.method == "GET" {
            if let Some(cache) = &self.cache {
                let key = req.cache_key();
                loop {
                    match cache.lookup(&key) {
                        Lookup::Hit(bytes) => {
                            self.serve_cached(stream, &ctx, &request_line, &target, bytes)
                                .await;
                            return;
                        }
                        Lookup::Pending(waiter) => waiter.wait().await,
                        Lookup::Miss(handle) => {
                            fill = Some(handle);
                            break;
                        }
                    }
                }
            }
        }

        self.forward(stream, parser, &req, &host, port, fill, &ctx)
            .await;
    }

    async fn serve_cached(
        &self,
        mut stream: TcpStream,
        ctx: &ConnectionContext,
        request_line: &str,
        target: &str,
        bytes: Bytes,
    ) {
        let body_len = match bytes.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(idx) => bytes.len() - idx - 4,
            None => bytes.len(),
        };

        if stream.write_all(&bytes).await.is_err() {
            return;
        }
        ctx.add_sent(body_len as u64);

        self.stats
            .record_allowed(ctx.bytes_sent(), ctx.bytes_received());
        self.emit(ctx, "CACHE", target, request_line, Outcome::Allowed, None);
    }

    async fn tunnel(
        &self,
        mut client: TcpStream,
        mut parser: RequestParser,
        req: &Request,
        host: &str,
        port: u16,
        ctx: &ConnectionContext,
    ) {
        ctx.set_stage(Stage::Tunneling);
        let request_line = req.request_line();
        let target = format!("{}:{}", host, port);

        let mut upstream = match net::dial(host, port).await {
            Ok(s) => s,
            Err(e) => {
                let _ = client.write_all(&http::error_response(502, None)).await;
                let reason = e.to_string();
                self.emit(
                    ctx,
                    "TUNNEL",
                    &target,
                    &request_line,
                    Outcome::Error,
                    Some(&reason),
                );
                return;
            }
        };

        if client.write_all(http::CONNECT_ESTABLISHED).await.is_err() {
            return;
        }

        // Bytes the client pipelined behind the CONNECT head (typically a
        // TLS hello) go upstream before the relay takes over.
        let early = parser.take_remaining();
        if !early.is_empty() {
            if upstream.write_all(&early).await.is_err() {
                self.emit(
                    ctx,
                    "TUNNEL",
                    &target,
                    &request_line,
                    Outcome::Error,
                    Some("upstream write failed"),
                );
                return;
            }
            ctx.add_received(early.len() as u64);
        }

        let (_, _, cause) = relay(client, upstream, ctx).await;

        self.stats
            .record_allowed(ctx.bytes_sent(), ctx.bytes_received());
        match cause {
            RelayCause::Eof => {
                self.emit(ctx, "TUNNEL", &target, &request_line, Outcome::Allowed, None)
            }
            other => {
                let reason = other.to_string();
                self.emit(
                    ctx,
                    "TUNNEL",
                    &target,
                    &request_line,
                    Outcome::Error,
                    Some(&reason),
                );
            }
        }
    }

    async fn forward(
        &self,
        mut client: TcpStream,
        mut parser: RequestParser,
        req: &Request,
        host: &str,
        port: u16,
        fill: Option<FillHandle>,
        ctx: &ConnectionContext,
    ) {
        ctx.set_stage(Stage::Forwarding);
        let request_line = req.request_line();
        let target = format!("{}:{}", host, port);
        let mut fill = fill;

        let mut upstream = match net::dial(host, port).await {
            Ok(s) => s,
            Err(e) => {
                abandon(&mut fill);
                let _ = client.write_all(&http::error_response(502, None)).await;
                let reason = e.to_string();
                self.emit(
                    ctx,
                    "FORWARD",
                    &target,
                    &request_line,
                    Outcome::Error,
                    Some(&reason),
                );
                return;
            }
        };

        if upstream.write_all(&req.serialize_forward()).await.is_err() {
            abandon(&mut fill);
            self.emit(
                ctx,
                "FORWARD",
                &target,
                &request_line,
                Outcome::Error,
                Some("upstream write failed"),
            );
            return;
        }

        let leftover = parser.take_remaining();
        let body_sent = if req.chunked {
            copy_chunked_body(&mut client, &mut upstream, leftover, ctx).await
        } else if req.body_len > 0 {
            copy_sized_body(&mut client, &mut upstream, leftover, req.body_len, ctx).await
        } else {
            Ok(())
        };
        if let Err(e) = body_sent {
            abandon(&mut fill);
            let reason = format!("request body relay failed: {}", e);
            self.emit(
                ctx,
                "FORWARD",
                &target,
                &request_line,
                Outcome::Error,
                Some(&reason),
            );
            return;
        }

        // Stream the response back, optionally capturing it for the cache.
        let max_entry = self
            .cache
            .as_ref()
            .map(|c| c.max_entry_bytes())
            .unwrap_or(0);
        let mut capture: Option<BytesMut> = fill.as_ref().map(|_| BytesMut::new());
        let mut splitter = HeadSplitter::new();
        let mut buf = [0u8; STREAM_BUF_SIZE];

        loop {
            let n = match timeout(RESPONSE_IDLE_TIMEOUT, upstream.read(&mut buf)).await {
                Err(_) => {
                    abandon(&mut fill);
                    self.emit(
                        ctx,
                        "FORWARD",
                        &target,
                        &request_line,
                        Outcome::Error,
                        Some("response inactivity timeout"),
                    );
                    return;
                }
                Ok(Err(e)) => {
                    abandon(&mut fill);
                    let reason = format!("upstream read failed: {}", e);
                    self.emit(
                        ctx,
                        "FORWARD",
                        &target,
                        &request_line,
                        Outcome::Error,
                        Some(&reason),
                    );
                    return;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };

            if client.write_all(&buf[..n]).await.is_err() {
                abandon(&mut fill);
                self.emit(
                    ctx,
                    "FORWARD",
                    &target,
                    &request_line,
                    Outcome::Error,
                    Some("client closed during response"),
                );
                return;
            }
            ctx.add_sent(splitter.body_bytes(&buf[..n]));

            if let Some(buffer) = capture.as_mut() {
                if buffer.len() + n > max_entry {
                    // The response outgrew the cache budget; keep
                    // streaming, give up the fill.
                    abandon(&mut fill);
                    capture = None;
                } else {
                    buffer.extend_from_slice(&buf[..n]);
                }
            }
        }

        if let Some(handle) = fill.take() {
            let blob = capture.take().unwrap_or_default().freeze();
            if http::response_cacheable(&blob, max_entry) {
                debug!("[{}] cached {} ({} bytes)", ctx.id, handle.key(), blob.len());
                handle.complete(blob);
            } else {
                handle.abandon();
            }
        }

        self.stats
            .record_allowed(ctx.bytes_sent(), ctx.bytes_received());
        self.emit(ctx, "FORWARD", &target, &request_line, Outcome::Allowed, None);
    }

    fn emit(
        &self,
        ctx: &ConnectionContext,
        event: &str,
        target: &str,
        request_line: &str,
        outcome: Outcome,
        reason: Option<&str>,
    ) {
        ctx.set_stage(Stage::Closed);
        self.access.event(&AccessEvent {
            event,
            client: ctx.peer,
            target,
            request_line,
            outcome,
            sent: ctx.bytes_sent(),
            received: ctx.bytes_received(),
            reason,
        });
    }
}

fn abandon(fill: &mut Option<FillHandle>) {
    if let Some(handle) = fill.take() {
        handle.abandon();
    }
}

/// Tracks where the response head ends so byte accounting covers only
/// the body.
struct HeadSplitter {
    matched: usize,
    done: bool,
}

impl HeadSplitter {
    fn new() -> Self {
        HeadSplitter {
            matched: 0,
            done: false,
        }
    }

    /// Body bytes contained in this chunk.
    fn body_bytes(&mut self, chunk: &[u8]) -> u64 {
        if self.done {
            return chunk.len() as u64;
        }
        for (idx, &byte) in chunk.iter().enumerate() {
            let expected = if self.matched % 2 == 0 { b'\r' } else { b'\n' };
            if byte == expected {
                self.matched += 1;
                if self.matched == 4 {
                    self.done = true;
                    return (chunk.len() - idx - 1) as u64;
                }
            } else if byte == b'\r' {
                self.matched = 1;
            } else {
                self.matched = 0;
            }
        }
        0
    }
}

/// Copy exactly `body_len` request-body bytes to the upstream, starting
/// with bytes already buffered past the head.
async fn copy_sized_body<R, W>(
    client: &mut R,
    upstream: &mut W,
    leftover: Bytes,
    body_len: u64,
    ctx: &ConnectionContext,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = body_len;

    if !leftover.is_empty() {
        let take = remaining.min(leftover.len() as u64) as usize;
        upstream.write_all(&leftover[..take]).await?;
        ctx.add_received(take as u64);
        remaining -= take as u64;
    }

    let mut buf = [0u8; STREAM_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = client.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed during request body",
            ));
        }
        upstream.write_all(&buf[..n]).await?;
        ctx.add_received(n as u64);
        remaining -= n as u64;
    }
    Ok(())
}

/// Pass a chunked request body through without decoding it: bytes are
/// forwarded verbatim while the chunk framing is scanned to find the end
/// of the body.
async fn copy_chunked_body<R, W>(
    client: &mut R,
    upstream: &mut W,
    leftover: Bytes,
    ctx: &ConnectionContext,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::from(&leftover[..]);

    loop {
        let line = read_line(client, &mut buf).await?;
        upstream.write_all(&line).await?;
        ctx.add_received(line.len() as u64);

        let size = parse_chunk_size(&line)?;

        if size == 0 {
            // Trailer section, ending with a blank line.
            loop {
                let line = read_line(client, &mut buf).await?;
                upstream.write_all(&line).await?;
                ctx.add_received(line.len() as u64);
                if line.as_ref() == b"\r\n" {
                    return Ok(());
                }
            }
        }

        // Chunk payload plus its trailing CRLF.
        let mut to_copy = size + 2;
        while to_copy > 0 {
            if buf.is_empty() {
                let n = client.read_buf(&mut buf).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "client closed inside chunked body",
                    ));
                }
            }
            let take = to_copy.min(buf.len() as u64) as usize;
            let piece = buf.split_to(take);
            upstream.write_all(&piece).await?;
            ctx.add_received(take as u64);
            to_copy -= take as u64;
        }
    }
}

fn parse_chunk_size(line: &Bytes) -> io::Result<u64> {
    let text = std::str::from_utf8(&line[..line.len().saturating_sub(2)])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    let size_field = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_field, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

async fn read_line<R>(client: &mut R, buf: &mut BytesMut) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(idx) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(buf.split_to(idx + 2).freeze());
        }
        if buf.len() > MAX_CHUNK_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk size line too long",
            ));
        }
        let n = client.read_buf(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed inside chunked body",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::io::duplex;

    fn ctx() -> ConnectionContext {
        ConnectionContext::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)))
    }

    #[test]
    fn test_head_splitter() {
        let mut splitter = HeadSplitter::new();
        assert_eq!(splitter.body_bytes(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"), 2);
        assert_eq!(splitter.body_bytes(b"more"), 4);
    }

    #[test]
    fn test_head_splitter_across_chunks() {
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        for split in 1..full.len() {
            let mut splitter = HeadSplitter::new();
            let total =
                splitter.body_bytes(&full[..split]) + splitter.body_bytes(&full[split..]);
            assert_eq!(total, 4, "split at {}", split);
        }
    }

    #[tokio::test]
    async fn test_copy_sized_body_with_leftover() {
        let (mut client_near, mut client_far) = duplex(1024);
        let (mut upstream_near, upstream_far) = duplex(1024);

        client_near.write_all(b"rld").await.unwrap();
        client_near.shutdown().await.unwrap();

        let ctx = ctx();
        copy_sized_body(
            &mut client_far,
            &mut upstream_near,
            Bytes::from_static(b"hello wo"),
            11,
            &ctx,
        )
        .await
        .unwrap();
        drop(upstream_near);

        let mut got = Vec::new();
        let mut reader = upstream_far;
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello world");
        assert_eq!(ctx.bytes_received(), 11);
    }

    #[tokio::test]
    async fn test_copy_chunked_body_passes_framing_through() {
        let (mut client_near, mut client_far) = duplex(1024);
        let (mut upstream_near, upstream_far) = duplex(1024);

        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        client_near.write_all(body).await.unwrap();

        let ctx = ctx();
        copy_chunked_body(&mut client_far, &mut upstream_near, Bytes::new(), &ctx)
            .await
            .unwrap();
        drop(upstream_near);

        let mut got = Vec::new();
        let mut reader = upstream_far;
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, body);
        assert_eq!(ctx.bytes_received(), body.len() as u64);
    }

    #[tokio::test]
    async fn test_copy_chunked_body_with_extension_and_trailer() {
        let (mut client_near, mut client_far) = duplex(1024);
        let (mut upstream_near, upstream_far) = duplex(1024);

        let body = b"3;ext=1\r\nabc\r\n0\r\nX-Check: 1\r\n\r\n";
        client_near.write_all(body).await.unwrap();

        let ctx = ctx();
        copy_chunked_body(&mut client_far, &mut upstream_near, Bytes::new(), &ctx)
            .await
            .unwrap();
        drop(upstream_near);

        let mut got = Vec::new();
        let mut reader = upstream_far;
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn test_copy_chunked_body_rejects_bad_size() {
        let (mut client_near, mut client_far) = duplex(1024);
        let (mut upstream_near, _upstream_far) = duplex(1024);

        client_near.write_all(b"zz\r\n").await.unwrap();

        let ctx = ctx();
        let err = copy_chunked_body(&mut client_far, &mut upstream_near, Bytes::new(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
