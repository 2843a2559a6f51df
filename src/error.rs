// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages; in most cases they
/// have enough information to find the offending message in Wireshark. Use
/// [`Error::kind`] to branch on the broad class of failure.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Broad classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Connect, TLS, read, write, or deadline failure. Fatal to the connection.
    Transport,

    /// Malformed RTSP message or session description.
    ProtocolParse,

    /// Credentials missing, rejected, or an unsupported challenge.
    Auth,

    /// The peer refused a request, or offered nothing usable.
    Negotiation,

    /// No plausible interleaved frame could be found in the input.
    ResyncExhausted,

    /// The operation isn't valid in the client's current state.
    InvalidState,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Empty response on RTSP request")]
    EmptyResponse {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
    },

    #[error(
        "[{conn_ctx}, {msg_ctx}] Gave up after {attempts} attempts to find an interleaved frame"
    )]
    ResyncExhausted {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        attempts: u32,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("[{conn_ctx}] Bad session description: {description}")]
    SdpError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] No interleaved transport in SETUP response: {transport:?}")]
    WrongTransport {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        transport: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Server requires authentication; user/pass not provided")]
    CredentialsNotProvided {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Wrong user/pass for {}", Into::<&str>::into(.method))]
    WrongCredentials {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Can't authenticate: {description}")]
    AuthChallengeError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("TLS handshake with {host} failed: {source}")]
    TlsError {
        host: String,
        source: tokio_native_tls::native_tls::Error,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Media negotiation failed: {0}")]
    MediaError(String),

    #[error("Timeout")]
    Timeout,
}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::ConnectError(_)
            | ErrorInt::TlsError { .. }
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::WriteError { .. }
            | ErrorInt::Timeout => ErrorKind::Transport,
            ErrorInt::RtspFramingError { .. }
            | ErrorInt::EmptyResponse { .. }
            | ErrorInt::SdpError { .. } => ErrorKind::ProtocolParse,
            ErrorInt::CredentialsNotProvided { .. }
            | ErrorInt::WrongCredentials { .. }
            | ErrorInt::AuthChallengeError { .. } => ErrorKind::Auth,
            ErrorInt::UnsupportedScheme(_)
            | ErrorInt::RtspResponseError { .. }
            | ErrorInt::WrongTransport { .. }
            | ErrorInt::MediaError(_) => ErrorKind::Negotiation,
            ErrorInt::ResyncExhausted { .. } => ErrorKind::ResyncExhausted,
            ErrorInt::InvalidArgument(_) | ErrorInt::FailedPrecondition(_) => {
                ErrorKind::InvalidState
            }
        }
    }
}
