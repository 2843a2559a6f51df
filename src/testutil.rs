// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub(crate) fn init_logging() {
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    let _ = h.install();
}

pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

/// Returns `head` (which must end with the headers' trailing `\r\n`) with a
/// `Content-Length` header, blank line, and `body` appended.
pub(crate) fn with_body(head: &str, body: &str) -> Vec<u8> {
    format!("{head}Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
}

/// A scripted RTSP peer on `127.0.0.1`.
///
/// For each script entry, reads one message or interleaved frame from the
/// client and writes the entry verbatim. An empty entry writes nothing. When
/// the client disconnects before the script is done, the next connection picks
/// up where it left off.
/// Once the script is exhausted, the server keeps recording until EOF.
pub(crate) struct MockServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<Vec<String>>,
}

impl MockServer {
    pub(crate) async fn start(script: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut script = script.into_iter().peekable();
            while script.peek().is_some() {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let (r, mut w) = stream.into_split();
                let mut r = BufReader::new(r);
                while let Some(msg) = read_message(&mut r).await {
                    received.push(msg);
                    if let Some(reply) = script.next() {
                        // The client may already be gone (after a TEARDOWN, say).
                        let _ = w.write_all(&reply).await;
                    }
                }
            }
            received
        });
        MockServer { addr, handle }
    }

    /// Returns `rtsp://<userinfo>127.0.0.1:<port><path>`.
    pub(crate) fn url(&self, userinfo: &str, path: &str) -> url::Url {
        url::Url::parse(&format!("rtsp://{userinfo}{}{path}", self.addr)).unwrap()
    }

    /// Waits for the client to disconnect and returns the messages it sent.
    pub(crate) async fn finish(self) -> Vec<String> {
        self.handle.await.unwrap()
    }
}

/// Reads one RTSP message (start line, headers, and `Content-Length` body) or
/// one `$` interleaved frame (header and payload) as text.
async fn read_message<R: AsyncBufRead + Unpin>(r: &mut R) -> Option<String> {
    if r.fill_buf().await.ok()?.first() == Some(&b'$') {
        let mut header = [0u8; 4];
        r.read_exact(&mut header).await.ok()?;
        let mut frame = vec![0; 4 + usize::from(u16::from_be_bytes([header[2], header[3]]))];
        frame[..4].copy_from_slice(&header);
        r.read_exact(&mut frame[4..]).await.ok()?;
        return Some(String::from_utf8_lossy(&frame).into_owned());
    }
    let mut msg = String::new();
    let mut content_length = 0;
    loop {
        let mut line = String::new();
        match r.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap();
            }
        }
        let end = line == "\r\n";
        msg.push_str(&line);
        if end {
            break;
        }
    }
    let mut body = vec![0; content_length];
    r.read_exact(&mut body).await.ok()?;
    msg.push_str(&String::from_utf8_lossy(&body));
    Some(msg)
}
