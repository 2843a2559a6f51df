// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Negotiated media and codecs, as described by SDP media blocks.

use std::fmt::Display;
use std::str::FromStr;

/// Canonical codec names.
pub mod names {
    pub const H264: &str = "H264";
    pub const H265: &str = "H265";
    pub const VP8: &str = "VP8";
    pub const VP9: &str = "VP9";
    pub const AV1: &str = "AV1";
    pub const JPEG: &str = "JPEG";
    pub const RAW: &str = "RAW";

    pub const PCMU: &str = "PCMU";
    pub const PCMA: &str = "PCMA";
    pub const AAC: &str = "MPEG4-GENERIC";
    pub const OPUS: &str = "OPUS";
    pub const G722: &str = "G722";

    /// MPEG-1 Layer III.
    pub const MP3: &str = "MPA";

    /// Linear PCM, big-endian.
    pub const PCM: &str = "L16";

    /// Linear PCM, little-endian. Not a registered RTP encoding name.
    pub const PCML: &str = "PCML";

    /// AAC-ELD. Sent on the wire as [`AAC`].
    pub const ELD: &str = "ELD";
    pub const FLAC: &str = "FLAC";
}

pub const KIND_VIDEO: &str = "video";
pub const KIND_AUDIO: &str = "audio";

/// The `sendonly`/`recvonly`/`sendrecv` attribute of a media.
///
/// Read as this client's role: cameras describe an ONVIF audio backchannel
/// as `sendonly`, and ordinary tracks as `recvonly` or not at all.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Recvonly,
    Sendonly,
    Sendrecv,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Recvonly => "recvonly",
            Direction::Sendonly => "sendonly",
            Direction::Sendrecv => "sendrecv",
        }
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recvonly" => Ok(Direction::Recvonly),
            "sendonly" => Ok(Direction::Sendonly),
            "sendrecv" => Ok(Direction::Sendrecv),
            _ => Err(()),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A codec offered within a [`Media`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Codec {
    /// Upper-case encoding name (see [`names`]), or the payload type's digits if unknown.
    pub name: String,
    pub clock_rate: u32,

    /// 0 when unspecified, else 1 or 2.
    pub channels: u16,

    /// The format-specific parameters of the `fmtp` attribute, without the payload type.
    pub fmtp_line: Option<String>,
    pub payload_type: u8,
}

impl Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if self.clock_rate != 0 && self.clock_rate != 90_000 {
            write!(f, "/{}", self.clock_rate)?;
        }
        if self.channels > 0 {
            write!(f, "/{}", self.channels)?;
        }
        Ok(())
    }
}

/// A negotiated track.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Media {
    /// `video`, `audio`, or `application`.
    pub kind: String,
    pub direction: Direction,
    pub codecs: Vec<Codec>,

    /// The SDP `control` (or `mid`) attribute.
    pub id: Option<String>,
}

impl Media {
    /// Returns true if `self` is the media `other` refers to.
    ///
    /// When `other` has an id, only ids are compared. Otherwise the
    /// [`Display`] forms (kind, direction, and codecs) must match.
    pub fn matches(&self, other: &Media) -> bool {
        match other.id.as_deref() {
            Some(id) if !id.is_empty() => self.id.as_deref() == Some(id),
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl Display for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = format!("{}, {}", self.kind, self.direction);
        for codec in &self.codecs {
            let name = codec.to_string();
            if !s.contains(&name) {
                s.push_str(", ");
                s.push_str(&name);
            }
        }
        f.write_str(&s)
    }
}

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1)
/// which cameras are known to send without an `rtpmap`.
#[derive(Debug)]
struct StaticPayloadType {
    encoding: &'static str,
    clock_rate: u32,
    channels: u16,
}

fn static_payload_type(payload_type: &str) -> Option<StaticPayloadType> {
    let (encoding, clock_rate, channels) = match payload_type {
        "0" => (names::PCMU, 8_000, 0),
        "8" => (names::PCMA, 8_000, 0),
        "10" => (names::PCM, 44_100, 2),
        "11" => (names::PCM, 44_100, 0),
        "14" => (names::MP3, 90_000, 0), // nominal; not the sample rate.
        "26" => (names::JPEG, 90_000, 0),
        _ => return None,
    };
    Some(StaticPayloadType {
        encoding,
        clock_rate,
        channels,
    })
}

/// Infers little-endian PCM parameters from a media's declared bandwidth (kbps).
///
/// FFmpeg sends `pcm_s16le` with a dynamic payload type and no `rtpmap`.
fn pcml_from_bandwidth(kbps: u64) -> Option<(u32, u16)> {
    Some(match kbps {
        128 => (8_000, 0),
        256 => (16_000, 0),
        384 => (24_000, 0),
        512 => (32_000, 0),
        705 => (44_100, 0),
        768 => (48_000, 0),
        1411 => (44_100, 2), // Windows DirectShow default.
        1536 => (48_000, 2), // Linux ALSA default.
        _ => return None,
    })
}

/// Returns `(payload type, rest)` for an attribute value such as `96 H264/90000`.
fn split_payload_type(value: &str) -> Option<(&str, &str)> {
    let value = value.trim_start();
    match value.split_once(|c: char| c.is_ascii_whitespace()) {
        Some((pt, rest)) => Some((pt, rest.trim())),
        None => Some((value, "")),
    }
}

/// Interprets the `rtpmap` and `fmtp` attributes of `md` for `payload_type`.
pub fn unmarshal_codec(md: &sdp_types::Media, payload_type: &str) -> Codec {
    let mut name = None;
    let mut clock_rate = 0;
    let mut channels = 0;
    let mut fmtp_line = None;
    for a in &md.attributes {
        let (pt, rest) = match a.value.as_deref().and_then(split_payload_type) {
            Some((pt, rest)) if pt == payload_type => (pt, rest),
            _ => continue,
        };
        if a.attribute == "rtpmap" && name.is_none() {
            let mut parts = rest.split('/');
            name = Some(parts.next().unwrap_or(pt).to_ascii_uppercase());
            clock_rate = parts
                .next()
                .and_then(|c| u32::from_str_radix(c.trim_end(), 10).ok())
                .unwrap_or(0);
            if parts.next().map(str::trim_end) == Some("2") {
                channels = 2;
            }
        } else if a.attribute == "fmtp" && fmtp_line.is_none() && !rest.is_empty() {
            fmtp_line = Some(rest.to_owned());
        }
    }

    let name = match name.as_deref() {
        Some("PCM") => names::PCML.to_owned(), // Hikvision
        Some(n) => n.to_owned(),
        None => match static_payload_type(payload_type) {
            Some(s) => {
                clock_rate = s.clock_rate;
                channels = s.channels;
                s.encoding.to_owned()
            }
            None if matches!(payload_type, "96" | "97" | "98") => {
                match md
                    .bandwidths
                    .first()
                    .and_then(|b| pcml_from_bandwidth(b.bandwidth))
                {
                    Some((rate, ch)) => {
                        clock_rate = rate;
                        channels = ch;
                        names::PCML.to_owned()
                    }
                    None => payload_type.to_owned(),
                }
            }
            None => payload_type.to_owned(),
        },
    };
    Codec {
        name,
        clock_rate: if clock_rate == 0 { 90_000 } else { clock_rate },
        channels,
        fmtp_line,
        payload_type: u8::from_str_radix(payload_type, 10).unwrap_or(0),
    }
}

/// Interprets a whole SDP media block.
pub fn unmarshal_media(md: &sdp_types::Media) -> Media {
    let mut direction = None;
    let mut id = None;
    for a in &md.attributes {
        match a.attribute.as_str() {
            "sendonly" | "recvonly" | "sendrecv" => direction = a.attribute.parse().ok(),
            "control" | "mid" => id = a.value.clone(),
            _ => {}
        }
    }
    Media {
        kind: md.media.clone(),
        direction: direction.unwrap_or_default(),
        codecs: md
            .fmt
            .split_ascii_whitespace()
            .map(|pt| unmarshal_codec(md, pt))
            .collect(),
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(sdp: &str) -> sdp_types::Media {
        let s = sdp_types::Session::parse(sdp.as_bytes()).unwrap();
        s.medias.into_iter().next().unwrap()
    }

    const HEADER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn static_types() {
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 0 8 26 14 10\r\n"));
        let c = unmarshal_codec(&md, "0");
        assert_eq!((c.name.as_str(), c.clock_rate), ("PCMU", 8000));
        let c = unmarshal_codec(&md, "8");
        assert_eq!((c.name.as_str(), c.clock_rate), ("PCMA", 8000));
        let c = unmarshal_codec(&md, "26");
        assert_eq!((c.name.as_str(), c.clock_rate), ("JPEG", 90000));
        let c = unmarshal_codec(&md, "14");
        assert_eq!((c.name.as_str(), c.clock_rate), ("MPA", 90000));
        let c = unmarshal_codec(&md, "10");
        assert_eq!(
            (c.name.as_str(), c.clock_rate, c.channels),
            ("L16", 44100, 2)
        );
        assert_eq!(c.payload_type, 10);
    }

    #[test]
    fn bandwidth_inference() {
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 96\r\nb=AS:1411\r\n"));
        let c = unmarshal_codec(&md, "96");
        assert_eq!(
            (c.name.as_str(), c.clock_rate, c.channels),
            ("PCML", 44100, 2)
        );
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 96\r\nb=AS:128\r\n"));
        let c = unmarshal_codec(&md, "96");
        assert_eq!(
            (c.name.as_str(), c.clock_rate, c.channels),
            ("PCML", 8000, 0)
        );
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 96\r\nb=AS:9999\r\n"));
        assert_eq!(unmarshal_codec(&md, "96").name, "96");
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 97\r\n"));
        assert_eq!(unmarshal_codec(&md, "97").name, "97");
        let md = media(&format!("{HEADER}m=audio 0 RTP/AVP 3\r\n"));
        assert_eq!(unmarshal_codec(&md, "3").name, "3");
    }

    #[test]
    fn rtpmap() {
        let md = media(&format!(
            "{HEADER}m=video 0 RTP/AVP 96 9\r\n\
             a=rtpmap:9 G722/8000\r\n\
             a=rtpmap:96 h264/90000 \r\n\
             a=fmtp:96 packetization-mode=1;profile-level-id=4D0029\r\n"
        ));
        let c = unmarshal_codec(&md, "96");
        assert_eq!(c.name, "H264");
        assert_eq!(c.clock_rate, 90000);
        assert_eq!(c.channels, 0);
        assert_eq!(
            c.fmtp_line.as_deref(),
            Some("packetization-mode=1;profile-level-id=4D0029")
        );
        let c = unmarshal_codec(&md, "9");
        assert_eq!((c.name.as_str(), c.clock_rate), ("G722", 8000));
        assert_eq!(c.fmtp_line, None);
    }

    #[test]
    fn hikvision_pcm() {
        let md = media(&format!(
            "{HEADER}m=audio 0 RTP/AVP 11\r\na=rtpmap:11 PCM/44100/2\r\n"
        ));
        let c = unmarshal_codec(&md, "11");
        assert_eq!(
            (c.name.as_str(), c.clock_rate, c.channels),
            ("PCML", 44100, 2)
        );
    }

    #[test]
    fn display_and_matching() {
        let m = Media {
            kind: KIND_AUDIO.to_owned(),
            direction: Direction::Sendonly,
            codecs: vec![
                Codec {
                    name: names::PCMA.to_owned(),
                    clock_rate: 8000,
                    channels: 0,
                    fmtp_line: None,
                    payload_type: 8,
                },
                Codec {
                    name: names::PCMA.to_owned(),
                    clock_rate: 8000,
                    channels: 0,
                    fmtp_line: None,
                    payload_type: 8,
                },
                Codec {
                    name: names::H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    fmtp_line: None,
                    payload_type: 96,
                },
            ],
            id: Some("trackID=2".to_owned()),
        };
        assert_eq!(m.to_string(), "audio, sendonly, PCMA/8000, H264");
        let mut bare = m.clone();
        bare.codecs.clear();
        assert!(m.matches(&bare)); // same id
        bare.id = None;
        assert!(!m.matches(&bare));
        bare.codecs = m.codecs.clone();
        assert!(m.matches(&bare));
        bare.id = Some("trackID=3".to_owned());
        assert!(!m.matches(&bare));
    }

    #[test]
    fn media_attributes() {
        let md = media(&format!(
            "{HEADER}m=audio 0 RTP/AVP 0\r\na=control:trackID=5\r\na=sendonly\r\n"
        ));
        let m = unmarshal_media(&md);
        assert_eq!(m.kind, "audio");
        assert_eq!(m.direction, Direction::Sendonly);
        assert_eq!(m.id.as_deref(), Some("trackID=5"));
        assert_eq!(m.codecs.len(), 1);
    }
}
