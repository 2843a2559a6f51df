// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Basic and Digest authentication of requests.

use std::borrow::Cow;

use base64::Engine as _;
use bytes::Bytes;

use super::Credentials;

/// The authentication method in use on a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// No credentials were supplied.
    None,

    /// Credentials were supplied but the server hasn't challenged yet.
    Unknown,
    Basic,
    Digest,

    /// The server rejected the credentials.
    Failed,
}

/// Per-connection authentication state.
pub(crate) struct Auth {
    creds: Option<Credentials>,
    method: AuthMethod,
    realm: Option<String>,
    digest: Option<digest_auth::WwwAuthenticateHeader>,
}

impl Auth {
    pub(crate) fn new(creds: Option<Credentials>) -> Self {
        Auth {
            method: if creds.is_some() {
                AuthMethod::Unknown
            } else {
                AuthMethod::None
            },
            creds,
            realm: None,
            digest: None,
        }
    }

    pub(crate) fn method(&self) -> AuthMethod {
        self.method
    }

    #[cfg(test)]
    pub(crate) fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// Adds an `Authorization` header to `req` according to the current method.
    pub(crate) fn write(&mut self, req: &mut rtsp_types::Request<Bytes>) -> Result<(), String> {
        let creds = match self.creds.as_ref() {
            None => return Ok(()),
            Some(c) => c,
        };
        let authorization = match self.method {
            AuthMethod::None | AuthMethod::Unknown | AuthMethod::Failed => return Ok(()),
            AuthMethod::Basic => {
                let raw = format!("{}:{}", creds.username, creds.password);
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                )
            }
            AuthMethod::Digest => {
                let digest = match self.digest.as_mut() {
                    None => return Err("digest method without a challenge".to_owned()),
                    Some(d) => d,
                };
                let uri = req.request_uri().map(|u| u.as_str()).unwrap_or("*");
                let method = digest_auth::HttpMethod(Cow::Borrowed(req.method().into()));
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username,
                    &creds.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    method,
                );
                digest
                    .respond(&ctx)
                    .map_err(|e| format!("can't answer digest challenge: {e}"))?
                    .to_string()
            }
        };
        req.insert_header(rtsp_types::headers::AUTHORIZATION, authorization);
        Ok(())
    }

    /// Reads the `WWW-Authenticate` challenge of a `401 Unauthorized` response.
    ///
    /// Returns whether there are credentials with which to retry.
    pub(crate) fn read_challenge(
        &mut self,
        resp: &rtsp_types::Response<Bytes>,
    ) -> Result<bool, String> {
        if self.creds.is_none() {
            return Ok(false);
        }
        let challenge = resp
            .header(&rtsp_types::headers::WWW_AUTHENTICATE)
            .ok_or_else(|| "401 response without WWW-Authenticate header".to_owned())?
            .as_str()
            .trim();
        if challenge.starts_with("Digest") {
            let digest = digest_auth::WwwAuthenticateHeader::parse(challenge)
                .map_err(|e| format!("bad digest challenge {challenge:?}: {e}"))?;
            self.realm = Some(digest.realm.clone());
            self.digest = Some(digest);
            self.method = AuthMethod::Digest;
        } else if let Some(params) = challenge.strip_prefix("Basic") {
            self.realm = params
                .split(',')
                .find_map(|p| p.trim().strip_prefix("realm="))
                .map(|r| r.trim_matches('"').to_owned());
            self.digest = None;
            self.method = AuthMethod::Basic;
        } else {
            return Err(format!("unsupported challenge {challenge:?}"));
        }
        Ok(true)
    }

    /// Notes that the server rejected our credentials.
    pub(crate) fn fail(&mut self) {
        self.method = AuthMethod::Failed;
    }
}
