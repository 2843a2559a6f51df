// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-limited hex dumps of wire data for log and error messages.

use pretty_hex::PrettyHex;

/// Formats at most `max_bytes` of `inner` via `pretty-hex`, noting how much was cut.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = std::cmp::min(self.inner.len(), self.max_bytes);
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            self.inner[..shown].hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        let omitted = self.inner.len() - shown;
        if omitted > 0 {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let s = format!("{:?}", LimitedHex::new(b"0123456789", 4));
        assert!(s.starts_with("Length: 10 (0xa) bytes\n"), "{s}");
        assert!(s.ends_with("...6 (0x6) bytes not shown..."), "{s}");
    }
}
