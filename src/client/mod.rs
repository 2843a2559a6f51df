// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: connection lifecycle, the handshake state machine, and the
//! steady-state loop which demultiplexes interleaved RTP/RTCP.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode, Version};
use tokio::time::Instant;
use url::Url;

use crate::error::ErrorInt;
use crate::media::{Direction, Media};
use crate::tokio::{Connection, Target};
use crate::{rtcp, rtp, Error, RtspMessageContext};

mod auth;
mod channel_mapping;
mod parse;

use self::auth::Auth;
pub use self::auth::AuthMethod;
use self::channel_mapping::ChannelMappings;
pub use self::channel_mapping::ChannelType;

/// Default bound on dialing and on each handshake read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Steady-state read timeout while pulling from a remote source.
const ACTIVE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Steady-state read timeout while a remote client (such as ffmpeg) pushes to us.
const PASSIVE_PRODUCER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Steady-state read timeout while a remote client (such as VLC) pulls from us.
const PASSIVE_CONSUMER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive interval when the server doesn't state a usable session timeout.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

/// How long before the session timeout to send a keepalive.
const KEEPALIVE_MARGIN_SECS: u32 = 5;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Options which must be decided before dialing.
#[derive(Default)]
pub struct ClientOptions {
    creds: Option<Credentials>,
    user_agent: Option<String>,
    backchannel: bool,
    media_filter: Option<String>,
    timeout: Option<Duration>,
    session_name: String,
}

impl ClientOptions {
    /// Uses the given credentials when/if the server requests digest authentication.
    ///
    /// These take precedence over any embedded in the URL.
    pub fn creds(self, creds: Option<Credentials>) -> Self {
        Self { creds, ..self }
    }

    /// Sends the given user agent string with each request.
    ///
    /// Some cameras answer `DESCRIBE` with `401 Unauthorized` when it's missing.
    pub fn user_agent(self, user_agent: String) -> Self {
        Self {
            user_agent: Some(user_agent),
            ..self
        }
    }

    /// Requests the ONVIF audio backchannel in `DESCRIBE`.
    ///
    /// If a later `SETUP` fails (as with Dahua/Amcrest cameras which allow only
    /// one backchannel connection), the client reconnects without it.
    pub fn backchannel(self, backchannel: bool) -> Self {
        Self {
            backchannel,
            ..self
        }
    }

    /// Keeps only media whose kind is a substring of `kinds`, such as `video,audio`.
    pub fn media_filter(self, kinds: String) -> Self {
        Self {
            media_filter: Some(kinds),
            ..self
        }
    }

    /// Overrides [`DEFAULT_TIMEOUT`] for handshakes and the steady-state read timeout.
    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the session name sent in `ANNOUNCE`.
    pub fn session_name(self, session_name: String) -> Self {
        Self {
            session_name,
            ..self
        }
    }
}

/// Lifecycle state of a [`Client`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Not connected. Initial and terminal.
    None,
    Conn,
    Setup,
    Play,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            State::None => "NONE",
            State::Conn => "CONN",
            State::Setup => "SETUP",
            State::Play => "PLAY",
        })
    }
}

/// Which side initiated the session and which way media flows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// We pulled from a remote source (such as a camera) via `DESCRIBE`.
    ActiveProducer,

    /// A remote client pulls from us.
    PassiveConsumer,

    /// A remote client pushes to us.
    PassiveProducer,

    /// We push to a remote server via `ANNOUNCE`/`RECORD`.
    ActiveConsumer,
}

/// A packet received on an interleaved channel.
#[derive(Debug)]
pub enum PacketItem {
    Rtp(rtp::ReceivedPacket),
    Rtcp(rtcp::RtcpEnvelope),
}

/// Returns the keepalive interval for a session with the given timeout.
fn keepalive_interval(session_timeout_sec: Option<u32>) -> Duration {
    match session_timeout_sec {
        Some(t) if t > KEEPALIVE_MARGIN_SECS => {
            Duration::from_secs(u64::from(t - KEEPALIVE_MARGIN_SECS))
        }
        _ => DEFAULT_KEEPALIVE,
    }
}

/// Read timeout and keepalive cadence of [`Client::handle`].
#[derive(Debug, PartialEq, Eq)]
struct SteadyStatePolicy {
    read_timeout: Duration,
    keepalive: Option<Duration>,
}

impl SteadyStatePolicy {
    fn new(
        mode: Option<Mode>,
        session_timeout_sec: Option<u32>,
        configured_timeout: Option<Duration>,
        only_sends: bool,
    ) -> Result<Self, String> {
        let (read_timeout, keepalive) = match mode {
            None => return Err("no RTSP mode; DESCRIBE or ANNOUNCE first".to_owned()),
            Some(Mode::ActiveProducer) | Some(Mode::ActiveConsumer) => {
                let interval = keepalive_interval(session_timeout_sec);
                let mut read_timeout = ACTIVE_READ_TIMEOUT;
                if only_sends || mode == Some(Mode::ActiveConsumer) {
                    // Nothing is expected from the peer other than keepalive responses.
                    read_timeout += interval;
                }
                (read_timeout, Some(interval))
            }
            Some(Mode::PassiveProducer) => (PASSIVE_PRODUCER_READ_TIMEOUT, None),
            Some(Mode::PassiveConsumer) => (PASSIVE_CONSUMER_READ_TIMEOUT, None),
        };
        Ok(SteadyStatePolicy {
            read_timeout: configured_timeout.unwrap_or(read_timeout),
            keepalive,
        })
    }
}

/// When the next keepalive is due.
#[derive(Debug)]
struct KeepaliveSchedule {
    interval: Duration,
    next: Instant,
}

impl KeepaliveSchedule {
    fn new(interval: Duration, now: Instant) -> Self {
        KeepaliveSchedule {
            interval,
            next: now + interval,
        }
    }

    /// Returns true if a keepalive is due at `now`, rescheduling the next one.
    fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.interval;
        true
    }
}

/// An RTSP client driving a single connection.
///
/// Every operation takes `&mut self`; one client is driven by one task.
pub struct Client {
    /// The target, with credentials removed and the scheme normalized.
    url: Url,

    /// The URL for aggregate requests and relative controls; rebound by `Content-Base`.
    base_url: Url,

    opts: ClientOptions,
    creds: Option<Credentials>,
    backchannel: bool,

    conn: Option<Connection>,
    auth: Auth,
    session_id: Option<Box<str>>,
    session_timeout_sec: Option<u32>,

    /// The `CSeq` of the last request sent.
    cseq: u32,
    state: State,
    mode: Option<Mode>,

    medias: Vec<Media>,
    sdp: Bytes,

    /// Media successfully set up, replayed by [`Client::reconnect`].
    setups: Vec<Media>,
    channels: ChannelMappings,

    /// True once the peer has answered `PLAY`; gates [`Client::write_packet`].
    play_ok: bool,
}

impl Client {
    /// Creates a client for `url`, which may embed credentials as userinfo.
    ///
    /// No I/O happens until [`Client::dial`].
    pub fn new(mut url: Url, opts: ClientOptions) -> Self {
        let url_creds = parse::take_credentials(&mut url);
        let creds = opts.creds.clone().or(url_creds);
        Client {
            base_url: url.clone(),
            url,
            backchannel: opts.backchannel,
            auth: Auth::new(creds.clone()),
            creds,
            opts,
            conn: None,
            session_id: None,
            session_timeout_sec: None,
            cseq: 0,
            state: State::None,
            mode: None,
            medias: Vec::new(),
            sdp: Bytes::new(),
            setups: Vec::new(),
            channels: ChannelMappings::default(),
            play_ok: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Returns the session id assigned by the first successful `SETUP`.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Returns the interval at which [`Client::handle`] sends keepalives in active modes.
    pub fn keepalive_interval(&self) -> Duration {
        keepalive_interval(self.session_timeout_sec)
    }

    /// Returns the negotiated media.
    pub fn medias(&self) -> &[Media] {
        &self.medias
    }

    /// Replaces the media list, as offered by a following [`Client::announce`].
    pub fn set_medias(&mut self, medias: Vec<Media>) {
        self.medias = medias;
    }

    /// Returns the raw session description from the last `DESCRIBE`.
    pub fn sdp(&self) -> &[u8] {
        &self.sdp[..]
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth.method()
    }

    fn io_timeout(&self) -> Duration {
        self.opts.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, Error> {
        match self.conn.as_mut() {
            Some(c) => Ok(c),
            None => bail!(ErrorInt::FailedPrecondition(format!(
                "not connected (state {})",
                self.state
            ))),
        }
    }

    /// Connects to the server, discarding any previous connection and session.
    pub async fn dial(&mut self) -> Result<(), Error> {
        self.conn = None;
        self.state = State::None;
        let mut url = self.url.clone();
        let target = Target::resolve(&mut url).map_err(|e| wrap!(e))?;
        let conn = Connection::connect(&target, self.io_timeout())
            .await
            .map_err(|e| wrap!(e))?;
        debug!("[{}] connected to {}", conn.ctx(), &url);
        self.base_url = url.clone();
        self.url = url;
        self.conn = Some(conn);
        self.auth = Auth::new(self.creds.clone());
        self.session_id = None;
        self.session_timeout_sec = None;
        self.cseq = 0;
        self.mode = None;
        self.channels.clear();
        self.play_ok = false;
        self.state = State::Conn;
        Ok(())
    }

    /// Drops the connection, first sending a best-effort `TEARDOWN` if we were
    /// pulling from the server. Idempotent.
    pub async fn close(&mut self) {
        if self.mode == Some(Mode::ActiveProducer) && self.conn.is_some() {
            if let Err(e) = self.teardown().await {
                debug!("ignoring TEARDOWN failure on close: {e}");
            }
        }
        if let Some(conn) = self.conn.take() {
            debug!("[{}] closed", conn.ctx());
        }
        self.state = State::None;
    }

    /// Closes, dials, describes, and replays every prior successful `SETUP`.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.close().await;
        self.dial().await?;
        self.describe().await?;
        for media in self.setups.clone() {
            self.setup_once(&media).await?;
        }
        Ok(())
    }

    /// Rebinds the base URL from a `Content-Base` header, if any.
    fn rebind_base(
        &mut self,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<(), Error> {
        let content_base = match resp.header(&headers::CONTENT_BASE) {
            None => return Ok(()),
            Some(v) => v.as_str().trim(),
        };
        match parse::parse_url(content_base) {
            Ok(u) => {
                trace!("base URL is now {u}");
                self.base_url = u;
                Ok(())
            }
            Err(e) => {
                let conn_ctx = *self.conn_mut()?.ctx();
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx,
                    msg_ctx,
                    description: format!("bad Content-Base {content_base:?}: {e}"),
                })
            }
        }
    }

    pub async fn options(&mut self) -> Result<(), Error> {
        let req = Request::builder(Method::Options, Version::V1_0)
            .request_uri(self.base_url.clone())
            .build(Bytes::new());
        let (msg_ctx, resp) = self.send(req).await?;
        self.rebind_base(msg_ctx, &resp)
    }

    /// Sends `DESCRIBE` and negotiates media from the returned session description.
    pub async fn describe(&mut self) -> Result<(), Error> {
        let mut req = Request::builder(Method::Describe, Version::V1_0)
            .request_uri(self.base_url.clone())
            .header(headers::ACCEPT, "application/sdp")
            .build(Bytes::new());
        if self.backchannel {
            // https://www.onvif.org/specs/stream/ONVIF-Streaming-Spec.pdf section 5.3
            req.insert_header(crate::REQUIRE.clone(), crate::ONVIF_BACKCHANNEL);
        }
        let (msg_ctx, resp) = self.send(req).await?;
        self.rebind_base(msg_ctx, &resp)?;

        let mut medias = match crate::sdp::unmarshal_sdp(resp.body()) {
            Ok(m) => m,
            Err(description) => {
                let conn_ctx = *self.conn_mut()?.ctx();
                bail!(ErrorInt::SdpError {
                    conn_ctx,
                    description,
                })
            }
        };
        if let Some(kinds) = self.opts.media_filter.as_deref() {
            medias.retain(|m| kinds.contains(m.kind.as_str()));
        }
        if self.medias.is_empty() {
            self.medias = medias;
        } else if self.medias.len() > medias.len() {
            // Keep what was previously negotiated (and possibly set up) in place.
            self.medias.truncate(medias.len());
        }
        for m in &self.medias {
            debug!("offered media: {m} (control {:?})", m.id);
        }
        self.sdp = resp.body().clone();
        self.mode = Some(Mode::ActiveProducer);
        Ok(())
    }

    /// Offers the current media list (see [`Client::set_medias`]) via `ANNOUNCE`.
    pub async fn announce(&mut self) -> Result<(), Error> {
        let body = crate::sdp::marshal_sdp(&self.opts.session_name, &self.medias);
        let req = Request::builder(Method::Announce, Version::V1_0)
            .request_uri(self.base_url.clone())
            .header(headers::CONTENT_TYPE, "application/sdp")
            .build(Bytes::from(body));
        self.send(req).await?;
        self.mode = Some(Mode::ActiveConsumer);
        Ok(())
    }

    /// Sends `SETUP` for each negotiated media, returning their data channels.
    pub async fn setup(&mut self) -> Result<Vec<u8>, Error> {
        let mut channels = Vec::with_capacity(self.medias.len());
        for media in self.medias.clone() {
            channels.push(self.setup_media(&media).await?);
        }
        Ok(channels)
    }

    /// Sends `SETUP` for `media`, which must match one of [`Client::medias`].
    ///
    /// Requests the interleaved channel pair `2i`-`2i+1` where `i` is the
    /// media's position, but returns whatever data channel the server grants.
    pub async fn setup_media(&mut self, media: &Media) -> Result<u8, Error> {
        match self.setup_once(media).await {
            Err(e) if self.backchannel => {
                // Some Dahua/Amcrest cameras refuse a second simultaneous
                // backchannel connection.
                info!("SETUP of {media} failed with backchannel requested; retrying without: {e}");
                self.backchannel = false;
                self.reconnect().await?;
                self.setup_once(media).await
            }
            r => r,
        }
    }

    async fn setup_once(&mut self, media: &Media) -> Result<u8, Error> {
        let media_i = match self.medias.iter().position(|m| m.matches(media)) {
            Some(i) => i,
            None => bail!(ErrorInt::MediaError(format!("no such media: {media}"))),
        };
        let url = parse::join_control(&self.base_url, media.id.as_deref().unwrap_or(""))
            .map_err(|e| wrap!(ErrorInt::MediaError(e)))?;
        let req = Request::builder(Method::Setup, Version::V1_0)
            .request_uri(url)
            .header(
                headers::TRANSPORT,
                format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    2 * media_i,
                    2 * media_i + 1
                ),
            )
            .build(Bytes::new());
        let (msg_ctx, resp) = self.send(req).await?;
        let conn_ctx = *self.conn_mut()?.ctx();

        if self.session_id.is_none() {
            if let Some(v) = resp.header(&headers::SESSION) {
                let session = parse::parse_session(v.as_str()).map_err(|description| {
                    wrap!(ErrorInt::RtspFramingError {
                        conn_ctx,
                        msg_ctx,
                        description,
                    })
                })?;
                debug!(
                    "[{conn_ctx}] session {} with timeout {:?}",
                    &session.id, session.timeout_sec
                );
                self.session_id = Some(session.id);
                self.session_timeout_sec = session.timeout_sec;
            }
        }

        let transport = resp
            .header(&headers::TRANSPORT)
            .map(|v| v.as_str())
            .unwrap_or("");
        let channel_id = match parse::parse_interleaved(transport) {
            Ok(Some(c)) => c,
            Ok(None) => bail!(ErrorInt::WrongTransport {
                conn_ctx,
                msg_ctx,
                transport: transport.to_owned(),
            }),
            Err(description) => bail!(ErrorInt::RtspFramingError {
                conn_ctx,
                msg_ctx,
                description,
            }),
        };
        if let Err(e) = self.channels.assign(channel_id, media_i) {
            warn!("[{conn_ctx}, {msg_ctx}] {e}");
        }
        if !self.setups.iter().any(|m| m.matches(media)) {
            self.setups.push(media.clone());
        }
        self.state = State::Setup;
        Ok(channel_id)
    }

    /// Sends `PLAY` without waiting; [`Client::handle`] consumes the response.
    pub async fn play(&mut self) -> Result<(), Error> {
        let req = Request::builder(Method::Play, Version::V1_0)
            .request_uri(self.base_url.clone())
            .header(headers::RANGE, "npt=0.000-")
            .build(Bytes::new());
        self.write_request(req).await?;
        Ok(())
    }

    /// Sends `RECORD` and waits for it to succeed.
    pub async fn record(&mut self) -> Result<(), Error> {
        let req = Request::builder(Method::Record, Version::V1_0)
            .request_uri(self.base_url.clone())
            .header(headers::RANGE, "npt=0.000-")
            .build(Bytes::new());
        self.send(req).await?;
        self.state = State::Play;
        Ok(())
    }

    /// Sends `TEARDOWN` without waiting. Allowed in any connected state.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        let req = Request::builder(Method::Teardown, Version::V1_0)
            .request_uri(self.base_url.clone())
            .build(Bytes::new());
        self.write_request(req).await?;
        Ok(())
    }

    /// Fills out `req` with `CSeq`, authorization, session, and length headers,
    /// and writes it. Returns the `CSeq`.
    pub async fn write_request(&mut self, mut req: Request<Bytes>) -> Result<u32, Error> {
        let timeout = self.io_timeout();
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => bail!(ErrorInt::FailedPrecondition(format!(
                "can't send {:?} while not connected",
                req.method()
            ))),
        };
        self.cseq += 1;
        let cseq = self.cseq;
        req.insert_header(headers::CSEQ, cseq.to_string());
        if let Some(user_agent) = self.opts.user_agent.as_deref() {
            req.insert_header(headers::USER_AGENT, user_agent);
        }
        self.auth.write(&mut req).map_err(|description| {
            wrap!(ErrorInt::AuthChallengeError {
                conn_ctx: *conn.ctx(),
                msg_ctx: conn.eof_ctx(),
                description,
            })
        })?;
        if let Some(id) = self.session_id.as_deref() {
            req.insert_header(headers::SESSION, id);
        }
        if !req.body().is_empty() {
            req.insert_header(headers::CONTENT_LENGTH, req.body().len().to_string());
        }
        trace!("[{}] sending {:?} CSeq={}", conn.ctx(), req.method(), cseq);
        conn.send_within(Message::Request(req), timeout).await?;
        Ok(cseq)
    }

    /// Reads until the next response, skipping interleaved data and answering
    /// server requests along the way.
    pub async fn read_response(&mut self) -> Result<(RtspMessageContext, Response<Bytes>), Error> {
        let timeout = self.io_timeout();
        loop {
            let conn = self.conn_mut()?;
            conn.set_expect_response(true);
            let msg = conn.next_within(timeout).await;
            conn.set_expect_response(false);
            let msg = msg?;
            match msg.msg {
                Message::Response(resp) => return Ok((msg.ctx, resp)),
                Message::Request(req) => self.answer_request(&req).await?,
                Message::Data(data) => debug!(
                    "[{}] skipping {}-byte frame on channel {} while awaiting response",
                    msg.ctx,
                    data.len(),
                    data.channel_id()
                ),
            }
        }
    }

    /// Reads until the next server request, skipping anything else.
    pub async fn read_request(&mut self) -> Result<Request<Bytes>, Error> {
        let timeout = self.io_timeout();
        loop {
            let msg = self.conn_mut()?.next_within(timeout).await?;
            match msg.msg {
                Message::Request(req) => return Ok(req),
                Message::Response(resp) => debug!(
                    "[{}] skipping {} response while awaiting request",
                    msg.ctx,
                    resp.status()
                ),
                Message::Data(data) => debug!(
                    "[{}] skipping {}-byte frame on channel {} while awaiting request",
                    msg.ctx,
                    data.len(),
                    data.channel_id()
                ),
            }
        }
    }

    /// Answers `req`, with `resp` or else `200 OK`, mirroring its `CSeq` and
    /// adding our session.
    pub async fn write_response(
        &mut self,
        req: &Request<Bytes>,
        resp: Option<Response<Bytes>>,
    ) -> Result<(), Error> {
        let timeout = self.io_timeout();
        let mut resp = resp
            .unwrap_or_else(|| Response::builder(Version::V1_0, StatusCode::Ok).build(Bytes::new()));
        if let Some(cseq) = req.header(&headers::CSEQ) {
            resp.insert_header(headers::CSEQ, cseq.as_str());
        }
        if let Some(id) = self.session_id.as_deref() {
            if *req.method() == Method::Setup {
                resp.insert_header(headers::SESSION, format!("{id};timeout=60"));
            } else {
                resp.insert_header(headers::SESSION, id);
            }
        }
        if !resp.body().is_empty() {
            resp.insert_header(headers::CONTENT_LENGTH, resp.body().len().to_string());
        }
        self.conn_mut()?
            .send_within(Message::Response(resp), timeout)
            .await
    }

    /// Answers a server-initiated request.
    ///
    /// `OPTIONS`, `GET_PARAMETER`, and `SET_PARAMETER` are pings. `TEARDOWN`
    /// ends the session. Anything else is refused.
    async fn answer_request(&mut self, req: &Request<Bytes>) -> Result<(), Error> {
        let resp = match req.method() {
            Method::Options | Method::GetParameter | Method::SetParameter => None,
            Method::Teardown => {
                info!("server sent TEARDOWN; ending session");
                self.state = State::None;
                None
            }
            m => {
                warn!("refusing server-initiated {m:?}");
                Some(
                    Response::builder(Version::V1_0, StatusCode::NotImplemented)
                        .build(Bytes::new()),
                )
            }
        };
        self.write_response(req, resp).await
    }

    /// Sends `req` and reads its response, answering one authentication
    /// challenge. Fails unless the final status is `200 OK`.
    pub async fn send(
        &mut self,
        req: Request<Bytes>,
    ) -> Result<(RtspMessageContext, Response<Bytes>), Error> {
        let mut challenged = false;
        loop {
            let cseq = self.write_request(req.clone()).await?;
            let (msg_ctx, resp) = self.read_response().await?;
            let conn_ctx = *self.conn_mut()?.ctx();
            match parse::get_cseq(&resp) {
                Some(c) if c == cseq => {}
                got => warn!(
                    "[{conn_ctx}, {msg_ctx}] expected CSeq {cseq} in response to {:?}; got {got:?}",
                    req.method()
                ),
            }
            if resp.status() == StatusCode::Unauthorized {
                if challenged {
                    self.auth.fail();
                    bail!(ErrorInt::WrongCredentials {
                        conn_ctx,
                        msg_ctx,
                        method: req.method().clone(),
                    });
                }
                match self.auth.read_challenge(&resp) {
                    Ok(true) => {
                        debug!(
                            "[{conn_ctx}, {msg_ctx}] retrying {:?} with {:?} auth",
                            req.method(),
                            self.auth.method()
                        );
                        challenged = true;
                        continue;
                    }
                    Ok(false) => bail!(ErrorInt::CredentialsNotProvided { conn_ctx, msg_ctx }),
                    Err(description) => bail!(ErrorInt::AuthChallengeError {
                        conn_ctx,
                        msg_ctx,
                        description,
                    }),
                }
            }
            if resp.status() != StatusCode::Ok {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx,
                    msg_ctx,
                    method: req.method().clone(),
                    cseq,
                    status: resp.status(),
                    description: resp.reason_phrase().to_owned(),
                });
            }
            return Ok((msg_ctx, resp));
        }
    }

    /// True if every set-up media flows from us to the server.
    fn only_sends(&self) -> bool {
        !self.setups.is_empty()
            && self
                .setups
                .iter()
                .all(|m| m.direction == Direction::Sendonly)
    }

    /// Runs the steady-state loop until the session ends ([`State::None`]),
    /// passing each RTP or RTCP packet to `on_packet`.
    ///
    /// Sends keepalive `OPTIONS` on schedule in the active modes, whether or
    /// not anything arrives. Undecodable packets are logged and skipped.
    /// Returns an error on
    /// transport failure, unparseable RTSP messages, or unrecoverable framing.
    pub async fn handle<F: FnMut(PacketItem)>(&mut self, mut on_packet: F) -> Result<(), Error> {
        let policy = SteadyStatePolicy::new(
            self.mode,
            self.session_timeout_sec,
            self.opts.timeout,
            self.only_sends(),
        )
        .map_err(|e| wrap!(ErrorInt::FailedPrecondition(e)))?;
        debug!("steady state with {policy:?}");
        let mut keepalive = policy
            .keepalive
            .map(|interval| KeepaliveSchedule::new(interval, Instant::now()));
        let mut read_deadline = Instant::now() + policy.read_timeout;
        while self.state != State::None {
            let conn = self.conn_mut()?;
            let msg = match keepalive.as_ref().map(|k| k.next) {
                Some(keepalive_at) => tokio::select! {
                    r = conn.next_before(read_deadline) => Some(r?),
                    _ = tokio::time::sleep_until(keepalive_at) => None,
                },
                None => Some(conn.next_before(read_deadline).await?),
            };
            if let Some(msg) = msg {
                read_deadline = Instant::now() + policy.read_timeout;
                match msg.msg {
                    Message::Response(resp) => {
                        trace!("[{}] {} response in steady state", msg.ctx, resp.status());
                        self.play_ok = true;
                        if self.state == State::Setup {
                            self.state = State::Play;
                        }
                    }
                    Message::Request(req) => self.answer_request(&req).await?,
                    Message::Data(data) => {
                        let channel_id = data.channel_id();
                        self.handle_data(msg.ctx, channel_id, data.into_body(), &mut on_packet);
                    }
                }
                if self.state == State::None {
                    break;
                }
            }
            if let Some(k) = keepalive.as_mut() {
                if k.poll(Instant::now()) {
                    self.send_keepalive().await?;
                }
            }
        }
        Ok(())
    }

    /// Writes a keepalive `OPTIONS` without waiting; the loop consumes its response.
    async fn send_keepalive(&mut self) -> Result<(), Error> {
        let req = Request::builder(Method::Options, Version::V1_0)
            .request_uri(self.base_url.clone())
            .build(Bytes::new());
        self.write_request(req).await?;
        Ok(())
    }

    fn handle_data<F: FnMut(PacketItem)>(
        &self,
        ctx: RtspMessageContext,
        channel_id: u8,
        body: Bytes,
        on_packet: &mut F,
    ) {
        let media_i = self.channels.lookup(channel_id).map(|m| m.media_i);
        match ChannelType::of(channel_id) {
            ChannelType::Rtp => match rtp::ReceivedPacket::new(ctx, channel_id, media_i, body) {
                Ok(pkt) => on_packet(PacketItem::Rtp(pkt)),
                Err(e) => debug!(
                    "[{ctx}] skipping bad RTP packet on channel {channel_id}: {}\n{:#?}",
                    e.reason,
                    crate::hex::LimitedHex::new(&e.data[..], 64),
                ),
            },
            ChannelType::Rtcp => {
                match rtcp::RtcpEnvelope::parse(ctx, channel_id, media_i, body) {
                    Ok(env) => on_packet(PacketItem::Rtcp(env)),
                    Err(e) => {
                        debug!("[{ctx}] skipping bad RTCP packet on channel {channel_id}: {e}")
                    }
                }
            }
        }
    }

    /// Writes an interleaved frame, such as backchannel audio built with
    /// [`rtp::PacketBuilder`] or media for `RECORD`.
    ///
    /// When pulling from a server, refused until the server has answered `PLAY`.
    pub async fn write_packet(&mut self, channel_id: u8, packet: Bytes) -> Result<(), Error> {
        if self.mode == Some(Mode::ActiveProducer) && !self.play_ok {
            bail!(ErrorInt::FailedPrecondition(
                "can't write interleaved data before the PLAY response".to_owned()
            ));
        }
        if packet.len() > usize::from(u16::MAX) {
            bail!(ErrorInt::InvalidArgument(format!(
                "{}-byte packet exceeds interleaved frame limit",
                packet.len()
            )));
        }
        let timeout = self.io_timeout();
        self.conn_mut()?
            .send_within(
                Message::Data(rtsp_types::Data::new(channel_id, packet)),
                timeout,
            )
            .await
    }
}
