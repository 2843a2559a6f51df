// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pulls a stream over interleaved RTSP and reports packet counts; use Ctrl+C to stop.

mod lock;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use clap::Parser;
use log::{error, info};
use rtsp_interleave::client::{Client, ClientOptions, Credentials, PacketItem};

/// How often to log the running packet counts.
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
struct Opts {
    /// `rtsp://` (or `rtsps://`, `rtspx://`) URL to connect to.
    #[arg(long)]
    url: url::Url,

    /// Username to send if the server requires authentication.
    #[arg(long)]
    username: Option<String>,

    /// Password; requires username.
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// `User-Agent` to send with each request.
    #[arg(long, default_value = "rtsp-interleave client example")]
    user_agent: String,

    /// Requests the ONVIF audio backchannel.
    #[arg(long)]
    backchannel: bool,

    /// Keeps only media of these kinds, such as `video,audio`.
    #[arg(long)]
    media: Option<String>,

    /// Dial, request, and read timeout, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Refuses to run if this file exists; creates it while running.
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

fn init_logging() -> mylog::Handle {
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    h.clone().install().unwrap();
    h
}

#[tokio::main]
async fn main() {
    let mut h = init_logging();
    if let Err(e) = {
        let _a = h.async_scope();
        main_inner().await
    } {
        error!("Fatal: {}", itertools::join(e.chain(), "\ncaused by: "));
        std::process::exit(1);
    }
    info!("Done");
}

/// Interprets the `username` and `password` options.
fn creds(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(username), password) => Some(Credentials {
            username,
            password: password.unwrap_or_default(),
        }),
        (None, None) => None,
        _ => unreachable!(), // clap enforces that password requires username.
    }
}

/// Running per-channel packet counts.
#[derive(Default)]
struct Counts {
    rtp: BTreeMap<u8, u64>,
    rtcp: BTreeMap<u8, u64>,
}

impl Counts {
    fn add(&mut self, item: &PacketItem) {
        match item {
            PacketItem::Rtp(p) => *self.rtp.entry(p.channel_id()).or_default() += 1,
            PacketItem::Rtcp(p) => *self.rtcp.entry(p.channel_id()).or_default() += 1,
        }
    }

    fn log(&self) {
        info!(
            "rtp packets: [{}]; rtcp packets: [{}]",
            itertools::join(self.rtp.iter().map(|(c, n)| format!("ch{c}={n}")), ", "),
            itertools::join(self.rtcp.iter().map(|(c, n)| format!("ch{c}={n}")), ", "),
        );
    }
}

async fn main_inner() -> Result<(), Error> {
    let opts = Opts::parse();
    let _lock = match opts.lock_file.as_deref() {
        Some(p) => Some(lock::Lock::acquire(p)?),
        None => None,
    };

    let mut client_opts = ClientOptions::default()
        .creds(creds(opts.username, opts.password))
        .user_agent(opts.user_agent)
        .backchannel(opts.backchannel);
    if let Some(kinds) = opts.media {
        client_opts = client_opts.media_filter(kinds);
    }
    if let Some(t) = opts.timeout {
        client_opts = client_opts.timeout(Duration::from_secs(t));
    }
    let mut client = Client::new(opts.url, client_opts);
    client.dial().await?;
    client.describe().await?;
    if client.medias().is_empty() {
        bail!("server offered no usable media");
    }
    for (i, m) in client.medias().iter().enumerate() {
        info!("media {i}: {m}");
    }
    let channels = client.setup().await?;
    info!(
        "session {:?} on channels {:?}; keepalive every {:?}",
        client.session_id(),
        channels,
        client.keepalive_interval()
    );
    client.play().await?;

    let mut counts = Counts::default();
    let mut last_report = Instant::now();
    let result = tokio::select! {
        r = client.handle(|item| {
            counts.add(&item);
            if last_report.elapsed() >= REPORT_INTERVAL {
                counts.log();
                last_report = Instant::now();
            }
        }) => r.context("session failed"),
        r = tokio::signal::ctrl_c() => {
            info!("Stopping due to signal");
            r.context("waiting for Ctrl+C")
        },
    };
    counts.log();
    client.close().await;
    result
}
