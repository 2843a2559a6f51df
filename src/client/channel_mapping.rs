// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track RTSP interleaved channel->media assignments.

use std::num::NonZeroU8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Rtp,
    Rtcp,
}

impl ChannelType {
    /// Classifies an interleaved channel: even channels carry RTP, odd ones RTCP.
    pub fn of(channel_id: u8) -> Self {
        if (channel_id & 1) == 0 {
            ChannelType::Rtp
        } else {
            ChannelType::Rtcp
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    pub media_i: usize,
    pub channel_type: ChannelType,
}

/// Mapping of the 256 possible RTSP interleaved channels to media indices and
/// RTP/RTCP.
///
/// Even channel numbers are RTP and their odd successors are RTCP for the
/// same media, matching what [RFC 2326 section
/// 10.12](https://tools.ietf.org/html/rfc2326#section-10.12) says of
/// `interleaved=n`. A server which answers with an odd `n` gets its channel
/// rounded down to the pair it belongs to.
#[derive(Default)]
pub struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMappings {
    /// Assigns the channel pair containing `channel_id` to `media_i`.
    pub fn assign(&mut self, channel_id: u8, media_i: usize) -> Result<(), String> {
        if media_i >= 255 {
            return Err(format!(
                "Can't assign channel to media {media_i} because it's >= 255"
            ));
        }
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        let c = &mut self.0[i];
        if let Some(c) = c {
            let existing = usize::from(c.get() - 1);
            if existing == media_i {
                return Ok(());
            }
            return Err(format!(
                "Channel id {channel_id} is already assigned to media {existing}; \
                 won't reassign to media {media_i}"
            ));
        }
        *c = Some(NonZeroU8::new((media_i + 1) as u8).expect("[0, 255) + 1 is non-zero"));
        Ok(())
    }

    /// Looks up a channel id's mapping.
    pub fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            return None;
        }
        self.0[i].map(|c| ChannelMapping {
            media_i: usize::from(c.get() - 1),
            channel_type: ChannelType::of(channel_id),
        })
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelMapping, ChannelType};

    #[test]
    fn channel_mappings() {
        let mut mappings = super::ChannelMappings::default();
        assert_eq!(mappings.lookup(0), None);
        mappings.assign(0, 42).unwrap();
        mappings.assign(0, 42).unwrap();
        mappings.assign(0, 43).unwrap_err();
        mappings.assign(1, 43).unwrap_err();
        assert_eq!(
            mappings.lookup(0),
            Some(ChannelMapping {
                media_i: 42,
                channel_type: ChannelType::Rtp,
            })
        );
        assert_eq!(
            mappings.lookup(1),
            Some(ChannelMapping {
                media_i: 42,
                channel_type: ChannelType::Rtcp,
            })
        );
        mappings.assign(9, 26).unwrap();
        assert_eq!(
            mappings.lookup(8),
            Some(ChannelMapping {
                media_i: 26,
                channel_type: ChannelType::Rtp,
            })
        );
        assert_eq!(
            mappings.lookup(9),
            Some(ChannelMapping {
                media_i: 26,
                channel_type: ChannelType::Rtcp,
            })
        );
        assert_eq!(mappings.lookup(200), None);
        mappings.assign(2, 255).unwrap_err();
        mappings.clear();
        assert_eq!(mappings.lookup(0), None);
    }
}
