// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connection`]: socket setup (plain or TLS) and the codec which
//! splits the byte stream into RTSP messages and interleaved data frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use rtsp_types::{Data, Message};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsConnector, TlsStream};
use tokio_util::codec::Framed;
use url::{Host, Url};

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// Consecutive implausible frame starts tolerated before giving up.
pub(crate) const MAX_RESYNC_ATTEMPTS: u32 = 10;

/// Channel ids at or above this are rejected while resynchronizing.
const MAX_RESYNC_CHANNEL: u8 = 20;

/// Payload lengths above this are rejected while resynchronizing.
const MAX_RESYNC_LEN: usize = 1500;

/// Prefixes of the requests a server may send us.
const REQUEST_PREFIXES: [&[u8; 4]; 10] = [
    b"OPTI", b"TEAR", b"DESC", b"SETU", b"PLAY", b"PAUS", b"RECO", b"ANNO", b"GET_", b"SET_",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TlsMode {
    None,

    /// Verify the certificate against the hostname.
    Verify,

    /// Accept any certificate.
    Insecure,
}

/// Where and how to connect, as derived from an RTSP URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: TlsMode,
}

impl Target {
    /// Picks the port and TLS mode for `url`, rewriting an `x` scheme
    /// (`rtspx`, `rtmpx`) to its `s` equivalent.
    pub(crate) fn resolve(url: &mut Url) -> Result<Self, ErrorInt> {
        let (default_port, secure) = match url.scheme() {
            "rtsp" => (554, false),
            "rtsps" | "rtspx" => (554, true),
            "rtmp" => (1935, false),
            "rtmps" | "rtmpx" => (443, true),
            s => return Err(ErrorInt::UnsupportedScheme(s.to_owned())),
        };
        let host = match url.host() {
            None => {
                return Err(ErrorInt::InvalidArgument(format!(
                    "URL {url} must specify a host"
                )))
            }
            Some(Host::Domain(d)) => d.to_owned(),
            Some(Host::Ipv4(a)) => a.to_string(),
            Some(Host::Ipv6(a)) => a.to_string(),
        };
        let is_ip = std::net::IpAddr::from_str(&host).is_ok();
        let tls = if !secure {
            TlsMode::None
        } else if url.scheme().ends_with('x') || is_ip {
            TlsMode::Insecure
        } else {
            TlsMode::Verify
        };
        if url.scheme().ends_with('x') {
            let scheme = format!("{}s", &url.scheme()[..4]);
            url.set_scheme(&scheme).map_err(|()| {
                ErrorInt::InvalidArgument(format!("can't rewrite scheme of {url}"))
            })?;
        }
        Ok(Target {
            port: url.port().unwrap_or(default_port),
            host,
            tls,
        })
    }
}

/// The underlying byte stream: plain TCP or TLS over TCP.
pub(crate) enum RtspStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for RtspStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            RtspStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RtspStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RtspStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            RtspStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RtspStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            RtspStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RtspStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            RtspStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RtspStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// A RTSP connection which implements `Stream`, `Sink`, and `Unpin`.
pub(crate) struct Connection(Framed<RtspStream, Codec>);

impl Connection {
    /// Connects to `target`, doing the TLS handshake if needed, within `timeout`.
    pub(crate) async fn connect(target: &Target, timeout: Duration) -> Result<Self, ErrorInt> {
        let tcp = tokio::time::timeout(
            timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| ErrorInt::Timeout)?
        .map_err(ErrorInt::ConnectError)?;
        let established_wall = WallTime::now();
        let local_addr = tcp.local_addr().map_err(ErrorInt::ConnectError)?;
        let peer_addr = tcp.peer_addr().map_err(ErrorInt::ConnectError)?;
        let stream = match target.tls {
            TlsMode::None => RtspStream::Plain(tcp),
            mode => {
                let tls_err = |source| ErrorInt::TlsError {
                    host: target.host.clone(),
                    source,
                };
                let mut builder = native_tls::TlsConnector::builder();
                if mode == TlsMode::Insecure {
                    builder.danger_accept_invalid_certs(true);
                    builder.danger_accept_invalid_hostnames(true);
                }
                let connector = TlsConnector::from(builder.build().map_err(tls_err)?);
                let tls = tokio::time::timeout(timeout, connector.connect(&target.host, tcp))
                    .await
                    .map_err(|_| ErrorInt::Timeout)?
                    .map_err(tls_err)?;
                debug!("TLS established with {}:{}", &target.host, target.port);
                RtspStream::Tls(Box::new(tls))
            }
        };
        Ok(Self::from_stream(
            stream,
            ConnectionContext {
                local_addr,
                peer_addr,
                established_wall,
            },
        ))
    }

    pub(crate) fn from_stream(stream: RtspStream, ctx: ConnectionContext) -> Self {
        Self(Framed::new(stream, Codec::new(ctx)))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.0.codec().read_pos + crate::to_u64(self.0.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }

    /// Sets whether a leading blank line is an error (while awaiting a response)
    /// or skipped (in the steady-state loop).
    pub(crate) fn set_expect_response(&mut self, expect_response: bool) {
        self.0.codec_mut().expect_response = expect_response;
    }

    /// Writes `msg` and flushes within `timeout`.
    pub(crate) async fn send_within(
        &mut self,
        msg: Message<Bytes>,
        timeout: Duration,
    ) -> Result<(), Error> {
        match tokio::time::timeout(timeout, self.send(msg)).await {
            Err(_) => bail!(ErrorInt::Timeout),
            Ok(r) => r.map_err(|e| wrap!(e)),
        }
    }

    /// Reads the next message within `timeout`. End of stream is an error.
    pub(crate) async fn next_within(
        &mut self,
        timeout: Duration,
    ) -> Result<ReceivedMessage, Error> {
        self.next_before(tokio::time::Instant::now() + timeout).await
    }

    /// Reads the next message before `deadline`. End of stream is an error.
    ///
    /// Cancel-safe: dropping the future loses no buffered message.
    pub(crate) async fn next_before(
        &mut self,
        deadline: tokio::time::Instant,
    ) -> Result<ReceivedMessage, Error> {
        match tokio::time::timeout_at(deadline, self.next()).await {
            Err(_) => bail!(ErrorInt::Timeout),
            Ok(Some(r)) => r,
            Ok(None) => bail!(ErrorInt::RtspReadError {
                conn_ctx: *self.ctx(),
                msg_ctx: self.eof_ctx(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ),
            }),
        }
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            _ => unreachable!("encoder only fails with I/O errors"),
        }
    }
}

impl Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            let conn_ctx = *self.ctx();
            let msg_ctx_at = |pos| RtspMessageContext {
                pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            };
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx,
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx,
                    msg_ctx: msg_ctx_at(pos),
                    description,
                },
                CodecError::EmptyResponse { pos } => ErrorInt::EmptyResponse {
                    conn_ctx,
                    msg_ctx: msg_ctx_at(pos),
                },
                CodecError::ResyncExhausted { pos, attempts } => ErrorInt::ResyncExhausted {
                    conn_ctx,
                    msg_ctx: msg_ctx_at(pos),
                    attempts,
                },
            })
        })
    }
}

impl Sink<Message<Bytes>> for Connection {
    type Error = ErrorInt;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_ready_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        self.0
            .start_send_unpin(item)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|e| self.wrap_write_err(e))
    }
}

/// What the first four buffered bytes look like.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Start {
    Data,
    Response,
    Request,
    Unknown,
}

fn classify(prefix: &[u8]) -> Start {
    if prefix[0] == b'$' {
        Start::Data
    } else if prefix == b"RTSP" {
        Start::Response
    } else if REQUEST_PREFIXES.iter().any(|p| &p[..] == prefix) {
        Start::Request
    } else {
        Start::Unknown
    }
}

/// Encodes and decodes RTSP messages and interleaved data frames.
pub(crate) struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,

    /// True while awaiting a response to our own request.
    expect_response: bool,

    /// True after input which was neither a message nor a frame, until the
    /// next plausible one.
    resyncing: bool,
    resync_attempts: u32,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
pub(crate) enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
    EmptyResponse { pos: u64 },
    ResyncExhausted { pos: u64, attempts: u32 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    pub(crate) fn new(ctx: ConnectionContext) -> Self {
        Codec {
            ctx,
            read_pos: 0,
            expect_response: false,
            resyncing: false,
            resync_attempts: 0,
        }
    }

    /// Drops `n` leading bytes which aren't part of any message.
    fn skip(&mut self, src: &mut BytesMut, n: usize) {
        src.advance(n);
        self.read_pos += crate::to_u64(n);
    }

    /// Returns the length of the prefix of `src` before the next `$` after
    /// its first byte, or all of `src` if there is none.
    fn until_next_marker(src: &[u8]) -> usize {
        match src[1..].iter().position(|&b| b == b'$') {
            Some(p) => p + 1,
            None => src.len(),
        }
    }

    /// Notes one rejected `$` candidate, failing once the limit is reached.
    fn resync_attempt(&mut self) -> Result<(), CodecError> {
        self.resyncing = true;
        self.resync_attempts += 1;
        if self.resync_attempts >= MAX_RESYNC_ATTEMPTS {
            return Err(CodecError::ResyncExhausted {
                pos: self.read_pos,
                attempts: self.resync_attempts,
            });
        }
        Ok(())
    }

    fn parse_msg(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        loop {
            while src.starts_with(b"\r\n") {
                if self.expect_response {
                    return Err(CodecError::EmptyResponse { pos: self.read_pos });
                }
                self.skip(src, 2);
            }
            if src.len() < 4 {
                return Ok(None);
            }
            match classify(&src[..4]) {
                Start::Data => {
                    let channel_id = src[1];
                    let payload_len = usize::from(u16::from_be_bytes([src[2], src[3]]));
                    if self.resyncing
                        && (channel_id >= MAX_RESYNC_CHANNEL || payload_len > MAX_RESYNC_LEN)
                    {
                        debug!(
                            "[{}] rejecting implausible frame start at {}: channel={} len={}",
                            &self.ctx, self.read_pos, channel_id, payload_len
                        );
                        self.resync_attempt()?;
                        let skip = Self::until_next_marker(src);
                        self.skip(src, skip);
                        continue;
                    }
                    let len = 4 + payload_len;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let mut msg = src.split_to(len);
                    msg.advance(4);
                    self.end_resync();
                    return Ok(Some((
                        len,
                        Message::Data(Data::new(channel_id, msg.freeze())),
                    )));
                }
                Start::Response | Start::Request => {
                    let r = self.parse_rtsp(src)?;
                    if r.is_some() {
                        self.end_resync();
                    }
                    return Ok(r);
                }
                Start::Unknown => {
                    // Scan forward to the next frame marker. Only rejected `$`
                    // candidates count as attempts.
                    let skip = Self::until_next_marker(src);
                    debug!(
                        "[{}] skipping {} bytes of unrecognized input at {}:\n{:#?}",
                        &self.ctx,
                        skip,
                        self.read_pos,
                        crate::hex::LimitedHex::new(&src[..skip], 64),
                    );
                    self.skip(src, skip);
                    self.resyncing = true;
                }
            }
        }
    }

    fn end_resync(&mut self) {
        if self.resyncing {
            debug!(
                "[{}] resynchronized at {} after {} attempts",
                &self.ctx, self.read_pos, self.resync_attempts
            );
        }
        self.resyncing = false;
        self.resync_attempts = 0;
    }

    /// Parses a response or request at the start of `src`.
    fn parse_rtsp(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // The request or status line must have method, URI, and version (or
        // version, status, and reason) before headers are worth looking at.
        let line_end = match src.iter().position(|&b| b == b'\n') {
            Some(e) => e,
            None => return Ok(None),
        };
        let line = src[..line_end].strip_suffix(b"\r").unwrap_or(&src[..line_end]);
        if line.splitn(3, |&b| b == b' ').count() < 3 {
            return Err(CodecError::ParseError {
                description: format!(
                    "Malformed RTSP start line {:?}",
                    String::from_utf8_lossy(line)
                ),
                pos: self.read_pos,
            });
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Map msg's body to a Bytes representation and advance `src`. Awkward:
        // 1.  lifetime concerns require mapping twice: first so the message
        //     doesn't depend on the BytesMut, which needs to be split/advanced;
        //     then to get the proper Bytes body in place post-split.
        // 2.  rtsp_types messages must be AsRef<[u8]>, so we can't use the
        //     range as an intermediate body.
        // 3.  within a match because the rtsp_types::Message enum itself
        //     doesn't have body/replace_body/map_body methods.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Request(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Request(msg.replace_body(Bytes::new()))
                }
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Response(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Response(msg.replace_body(Bytes::new()))
                }
            }
            Message::Data(_) => {
                return Err(CodecError::ParseError {
                    description: "unexpected interleaved data in RTSP message".to_owned(),
                    pos: self.read_pos,
                })
            }
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src) {
            Err(e) => return Err(e),
            Ok(None) => return Ok(None),
            Ok(Some((len, msg))) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: rtsp_types::Message<Bytes>,
        mut dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}
