// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session description parsing (with repairs for broken cameras) and writing.

use log::debug;

use crate::media::{self, names, Direction, Media};

/// Session-level lines substituted for whatever precedes the first media block
/// when the original header is unusable.
const REPLACEMENT_HEADER: &str = "v=0\no=- 0 0 IN IP4 0.0.0.0\ns=-\nt=0 0";

/// Origin username of cameras which mark their media `sendonly` but never
/// accept a backchannel.
const FORCE_RECVONLY_ORIGIN: &str = "CV-RTSPHandler";

/// Applies the textual repairs tried after a failed parse.
///
/// *   drops `s=` lines other than the first line (some servers send several).
/// *   replaces everything before the first `m=` line with a minimal valid
///     session header.
/// *   renames media kinds other than `audio`, `video`, and `application` to
///     `application` (TP-Link).
/// *   terminates the last line.
fn repair(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(raw.len() + REPLACEMENT_HEADER.len());
    for (i, line) in raw.split_inclusive('\n').enumerate() {
        if i > 0 && line.starts_with("s=") {
            continue;
        }
        out.push_str(line);
    }

    if let Some(i) = out.find("\nm=") {
        if i > 0 {
            out.replace_range(..i, REPLACEMENT_HEADER);
        }
    }

    let mut repaired = String::with_capacity(out.len() + 1);
    for line in out.split_inclusive('\n') {
        match line
            .strip_prefix("m=")
            .and_then(|rest| rest.split_once(' '))
        {
            Some((kind, rest)) if !matches!(kind, "audio" | "video" | "application") => {
                repaired.push_str("m=application ");
                repaired.push_str(rest);
            }
            _ => repaired.push_str(line),
        }
    }
    if !repaired.ends_with('\n') {
        repaired.push('\n');
    }
    repaired
}

/// Returns the first `fmtp` line for `payload_type` in any media block.
fn find_fmtp_line(payload_type: u8, medias: &[sdp_types::Media]) -> Option<String> {
    let pt = payload_type.to_string();
    medias
        .iter()
        .find_map(|md| media::unmarshal_codec(md, &pt).fmtp_line)
}

/// Parses a session description (typically a `DESCRIBE` response body) into media.
pub fn unmarshal_sdp(raw: &[u8]) -> Result<Vec<Media>, String> {
    let session = match sdp_types::Session::parse(raw) {
        Ok(s) => s,
        Err(first) => {
            let repaired = repair(raw);
            debug!("retrying SDP parse after {first}; repaired:\n{repaired}");
            sdp_types::Session::parse(repaired.as_bytes())
                .map_err(|e| format!("unparseable SDP ({first}; after repair: {e})"))?
        }
    };

    let force_recvonly = session.origin.username.as_deref() == Some(FORCE_RECVONLY_ORIGIN);
    let mut medias = Vec::with_capacity(session.medias.len());
    for md in &session.medias {
        let mut m = media::unmarshal_media(md);
        for codec in &mut m.codecs {
            if codec.name == names::H264 && codec.fmtp_line.is_none() {
                codec.fmtp_line = find_fmtp_line(codec.payload_type, &session.medias);
            }
        }
        if force_recvonly {
            m.direction = Direction::Recvonly;
        }
        medias.push(m);
    }
    Ok(medias)
}

/// Writes a session description offering the first codec of each media, as
/// sent with `ANNOUNCE`.
pub fn marshal_sdp(name: &str, medias: &[Media]) -> String {
    let name = if name.is_empty() { "-" } else { name };
    let mut out =
        format!("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns={name}\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n");
    for m in medias {
        let codec = match m.codecs.first() {
            Some(c) => c,
            None => continue,
        };
        let encoding = match codec.name.as_str() {
            names::ELD => names::AAC,
            names::PCML => names::PCM,
            n => n,
        };
        let pt = codec.payload_type;
        out.push_str(&format!("m={} 0 RTP/AVP {pt}\r\n", m.kind));
        out.push_str(&match codec.channels {
            0 => format!("a=rtpmap:{pt} {encoding}/{}\r\n", codec.clock_rate),
            c => format!("a=rtpmap:{pt} {encoding}/{}/{c}\r\n", codec.clock_rate),
        });
        if let Some(fmtp) = codec.fmtp_line.as_deref() {
            out.push_str(&format!("a=fmtp:{pt} {fmtp}\r\n"));
        }
        if let Some(id) = m.id.as_deref() {
            out.push_str(&format!("a=control:{id}\r\n"));
        }
        out.push_str(&format!("a={}\r\n", m.direction));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Codec;

    #[test]
    fn hikvision() {
        let raw = b"v=0\r\n\
                    o=- 1109162014219182 1109162014219192 IN IP4 x.y.z.w\r\n\
                    s=Media Presentation\r\n\
                    e=NONE\r\n\
                    b=AS:5050\r\n\
                    t=0 0\r\n\
                    a=control:rtsp://192.168.5.106:554/Streaming/Channels/101/?transportmode=unicast\r\n\
                    m=video 0 RTP/AVP 96\r\n\
                    b=AS:5000\r\n\
                    a=control:rtsp://192.168.5.106:554/Streaming/Channels/101/trackID=1?transportmode=unicast\r\n\
                    a=rtpmap:96 H264/90000\r\n\
                    a=fmtp:96 profile-level-id=420029; packetization-mode=1; sprop-parameter-sets=Z00AKZpkA8ARPyzUBAQFAAADA+gAAOpgBA==,aO48gA==\r\n\
                    m=audio 0 RTP/AVP 8\r\n\
                    a=rtpmap:8 PCMA/8000\r\n\
                    a=control:trackID=2\r\n\
                    a=sendonly\r\n";
        let medias = unmarshal_sdp(raw).unwrap();
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].kind, "video");
        assert_eq!(medias[0].direction, Direction::Recvonly);
        assert_eq!(medias[0].codecs[0].name, "H264");
        assert!(medias[0].codecs[0]
            .fmtp_line
            .as_deref()
            .unwrap()
            .starts_with("profile-level-id=420029"));
        assert_eq!(medias[1].to_string(), "audio, sendonly, PCMA/8000");
        assert_eq!(medias[1].id.as_deref(), Some("trackID=2"));
    }

    #[test]
    fn repairs() {
        let raw = "s=first\n\
                   garbage header\n\
                   s=second\n\
                   m=metadata 0 RTP/AVP 107\n\
                   a=rtpmap:107 vnd.onvif.metadata/90000\n\
                   m=video 0 RTP/AVP 96\n\
                   a=rtpmap:96 H264/90000";
        let repaired = repair(raw.as_bytes());
        assert_eq!(
            repaired,
            "v=0\no=- 0 0 IN IP4 0.0.0.0\ns=-\nt=0 0\n\
             m=application 0 RTP/AVP 107\n\
             a=rtpmap:107 vnd.onvif.metadata/90000\n\
             m=video 0 RTP/AVP 96\n\
             a=rtpmap:96 H264/90000\n"
        );
        let medias = unmarshal_sdp(raw.as_bytes()).unwrap();
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].kind, "application");
        assert_eq!(medias[0].codecs[0].name, "VND.ONVIF.METADATA");
        assert_eq!(medias[1].kind, "video");
    }

    #[test]
    fn unrepairable() {
        unmarshal_sdp(b"this is not a session description").unwrap_err();
    }

    #[test]
    fn force_recvonly() {
        let raw = b"v=0\r\n\
                    o=CV-RTSPHandler 1123412 0 IN IP4 10.0.0.1\r\n\
                    s=Sony RTSP Server\r\n\
                    t=0 0\r\n\
                    m=video 0 RTP/AVP 105\r\n\
                    a=rtpmap:105 H264/90000\r\n\
                    a=sendonly\r\n\
                    a=control:trackID=1\r\n";
        let medias = unmarshal_sdp(raw).unwrap();
        assert_eq!(medias[0].direction, Direction::Recvonly);
    }

    #[test]
    fn borrowed_fmtp() {
        // The H264 parameters are (wrongly) listed under the audio media.
        let raw = b"v=0\r\n\
                    o=- 0 0 IN IP4 0.0.0.0\r\n\
                    s=-\r\n\
                    t=0 0\r\n\
                    m=video 0 RTP/AVP 96\r\n\
                    a=rtpmap:96 H264/90000\r\n\
                    a=control:video\r\n\
                    m=audio 0 RTP/AVP 96\r\n\
                    a=rtpmap:96 MPEG4-GENERIC/16000/2\r\n\
                    a=fmtp:96 packetization-mode=1;profile-level-id=64001F\r\n\
                    a=control:audio\r\n";
        let medias = unmarshal_sdp(raw).unwrap();
        assert_eq!(
            medias[0].codecs[0].fmtp_line.as_deref(),
            Some("packetization-mode=1;profile-level-id=64001F")
        );
        assert_eq!(medias[1].codecs[0].to_string(), "MPEG4-GENERIC/16000/2");
    }

    #[test]
    fn round_trip() {
        let medias = vec![
            Media {
                kind: "video".to_owned(),
                direction: Direction::Sendonly,
                codecs: vec![Codec {
                    name: names::H264.to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    fmtp_line: Some("packetization-mode=1".to_owned()),
                    payload_type: 96,
                }],
                id: Some("trackID=0".to_owned()),
            },
            Media {
                kind: "audio".to_owned(),
                direction: Direction::Sendonly,
                codecs: vec![Codec {
                    name: names::PCML.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    fmtp_line: None,
                    payload_type: 97,
                }],
                id: Some("trackID=1".to_owned()),
            },
            Media {
                kind: "audio".to_owned(),
                direction: Direction::Recvonly,
                codecs: Vec::new(),
                id: None,
            },
        ];
        let sdp = marshal_sdp("", &medias);
        assert!(sdp.starts_with("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n"), "{sdp}");
        assert!(sdp.contains("a=rtpmap:97 L16/48000/2\r\n"), "{sdp}");
        let parsed = unmarshal_sdp(sdp.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], medias[0]);
        assert_eq!(parsed[1].to_string(), "audio, sendonly, L16/48000/2");
        assert_eq!(parsed[1].id, medias[1].id);
    }

    #[test]
    fn marshal() {
        let medias = vec![Media {
            kind: "audio".to_owned(),
            direction: Direction::Sendonly,
            codecs: vec![Codec {
                name: names::ELD.to_owned(),
                clock_rate: 48_000,
                channels: 1,
                fmtp_line: Some("streamtype=5".to_owned()),
                payload_type: 98,
            }],
            id: Some("trackID=2".to_owned()),
        }];
        assert_eq!(
            marshal_sdp("cam", &medias),
            "v=0\r\n\
             o=- 1 1 IN IP4 0.0.0.0\r\n\
             s=cam\r\n\
             c=IN IP4 0.0.0.0\r\n\
             t=0 0\r\n\
             m=audio 0 RTP/AVP 98\r\n\
             a=rtpmap:98 MPEG4-GENERIC/48000/1\r\n\
             a=fmtp:98 streamtype=5\r\n\
             a=control:trackID=2\r\n\
             a=sendonly\r\n"
        );
    }
}
