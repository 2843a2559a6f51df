// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frames RTCP data as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! Only the common header of each packet is interpreted; the packets are kept
//! so the caller can route or forward them.

use bytes::Bytes;

use crate::RtspMessageContext;

const COMMON_HEADER_LEN: usize = 4;

/// The RTCP common header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|    RC   |   PT          |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,

    /// The low 5 bits of the first octet, typically a report count or subtype.
    pub count: u8,
    pub packet_type: u8,

    /// The length of this packet in 32-bit words minus one, including the
    /// header and any padding.
    pub length: u16,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(format!(
                "RTCP packets must be at least {} bytes; have only {}",
                COMMON_HEADER_LEN,
                buf.len()
            ));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {ver}"));
        }
        Ok(Header {
            padding: (buf[0] & 0b0010_0000) != 0,
            count: buf[0] & 0b0001_1111,
            packet_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Returns the full byte length of the packet this header describes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        (usize::from(self.length) + 1) * 4
    }
}

/// A single RTCP packet within a compound packet.
#[derive(Clone)]
pub struct Packet {
    header: Header,
    raw: Bytes,
    payload_end: usize,
}

impl Packet {
    /// Splits the first packet off `buf`, validating its version, length, and padding.
    fn split(buf: &mut Bytes) -> Result<Self, String> {
        let header = Header::parse(&buf[..])?;
        let len = header.byte_len();
        if buf.len() < len {
            return Err(format!(
                "RTCP packet header has length {} bytes; have only {}",
                len,
                buf.len()
            ));
        }
        let raw = buf.split_to(len);
        let payload_end = if header.padding {
            if header.length == 0 {
                return Err("RTCP packet has invalid combination of padding and len=0".to_owned());
            }
            let padding_bytes = usize::from(raw[len - 1]);
            if padding_bytes == 0 || padding_bytes > len - COMMON_HEADER_LEN {
                return Err(format!(
                    "RTCP packet of len {len} states invalid {padding_bytes} padding bytes"
                ));
            }
            len - padding_bytes
        } else {
            len
        };
        Ok(Packet {
            header,
            raw,
            payload_end,
        })
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn packet_type(&self) -> u8 {
        self.header.packet_type
    }

    /// Returns the SSRC of the packet sender, for packet types which begin with one.
    pub fn ssrc(&self) -> Option<u32> {
        if self.payload_end < COMMON_HEADER_LEN + 4 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.raw[4],
            self.raw[5],
            self.raw[6],
            self.raw[7],
        ]))
    }

    /// Returns the data after the common header, excluding padding.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw[COMMON_HEADER_LEN..self.payload_end]
    }

    /// Returns the full raw data, including the header and padding.
    #[inline]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("raw", &crate::hex::LimitedHex::new(&self.raw[..], 64))
            .finish()
    }
}

/// An RTCP compound packet received on an interleaved channel.
///
/// Validated at least as specified in [RFC 3550 appendix
/// A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2), updated
/// by [RFC 5506](https://datatracker.ietf.org/doc/html/rfc5506):
///
/// *   There is at least one RTCP packet within the compound packet.
/// *   All packets are RTCP version 2.
/// *   Non-final packets have no padding.
/// *   The packets' lengths add up to the compound packet's length.
#[derive(Debug)]
pub struct RtcpEnvelope {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) channel_id: u8,
    pub(crate) media_i: Option<usize>,
    header: Header,
    packets: Vec<Packet>,
}

impl RtcpEnvelope {
    pub(crate) fn parse(
        ctx: RtspMessageContext,
        channel_id: u8,
        media_i: Option<usize>,
        data: Bytes,
    ) -> Result<Self, String> {
        let header = Header::parse(&data[..])?;
        let mut rest = data;
        let mut packets = Vec::new();
        while !rest.is_empty() {
            if packets.last().map(|p: &Packet| p.header.padding).unwrap_or(false) {
                return Err("padding on non-final packet within RTCP compound packet".to_owned());
            }
            packets.push(Packet::split(&mut rest)?);
        }
        Ok(RtcpEnvelope {
            ctx,
            channel_id,
            media_i,
            header,
            packets,
        })
    }

    #[inline]
    pub fn ctx(&self) -> &RtspMessageContext {
        &self.ctx
    }

    /// Returns the (odd) interleaved channel this was received on.
    #[inline]
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Returns the index of the media set up on this channel, if any.
    #[inline]
    pub fn media_i(&self) -> Option<usize> {
        self.media_i
    }

    /// Returns the header of the first packet.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dahua() {
        // Sender report and source description from a Dahua camera.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d\
                    \x81\xca\x00\x04\x66\x42\x6a\xe1\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        let env = RtcpEnvelope::parse(
            RtspMessageContext::dummy(),
            1,
            Some(0),
            Bytes::from_static(buf),
        )
        .unwrap();
        assert_eq!(env.header().packet_type, 200);
        assert_eq!(env.packets().len(), 2);
        assert_eq!(env.packets()[0].ssrc(), Some(0x66426ae1));
        assert_eq!(env.packets()[1].packet_type(), 202);
        assert_eq!(env.packets()[1].header().count, 1);
    }

    #[test]
    fn padding() {
        let mut buf = Bytes::from_static(b"\xa7\x00\x00\x02asdf\x00\x00\x00\x04rest");
        let pkt = Packet::split(&mut buf).unwrap();
        assert_eq!(pkt.header().count, 7);
        assert_eq!(pkt.payload(), b"asdf");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn padding_on_non_final() {
        let buf = b"\xa0\xc9\x00\x01\x00\x00\x00\x04\x80\xc9\x00\x01\x00\x00\x00\x00";
        let e = RtcpEnvelope::parse(
            RtspMessageContext::dummy(),
            1,
            None,
            Bytes::from_static(buf),
        )
        .unwrap_err();
        assert!(e.contains("non-final"), "{e}");
    }

    #[test]
    fn truncated() {
        let buf = b"\x80\xc8\x00\x06\x66\x42";
        RtcpEnvelope::parse(
            RtspMessageContext::dummy(),
            3,
            None,
            Bytes::from_static(buf),
        )
        .unwrap_err();
    }

    #[test]
    fn bad_version() {
        Header::parse(b"\x40\xc8\x00\x00").unwrap_err();
    }
}
