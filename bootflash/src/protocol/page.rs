//! Page framing and readback comparison.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+-----+------------------+
//! | SEQ | LEN |  DATA (LEN)      |
//! +-----+-----+------------------+
//! | 1   | 1   | 1..=page size    |
//! +-----+-----+------------------+
//! ```
//!
//! `SEQ` is the 1-based page number modulo 256. The logical page number is
//! kept as a `u32` on the host so that counting never wraps.

use crate::error::{Error, Result};
use std::fmt;

/// Number of pages needed for an image of `image_size` bytes.
#[must_use]
pub fn total_pages(image_size: u64, page_size: usize) -> u64 {
    if page_size == 0 {
        return 0;
    }
    image_size.div_ceil(page_size as u64)
}

/// Build the 2-byte page header.
#[must_use]
pub fn encode_header(sequence: u32, len: u8) -> [u8; 2] {
    [sequence.to_le_bytes()[0], len]
}

/// One unit of transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    sequence: u32,
    len: u8,
    payload: Vec<u8>,
}

impl Page {
    /// Create a page.
    ///
    /// # Arguments
    ///
    /// * `sequence` - 1-based logical page number
    /// * `payload` - page data, `1..=page_size` bytes
    /// * `page_size` - configured page size
    pub fn new(sequence: u32, payload: Vec<u8>, page_size: usize) -> Result<Self> {
        if sequence == 0 {
            return Err(Error::Protocol("page numbers start at 1".into()));
        }
        if payload.is_empty() {
            return Err(Error::Protocol(format!("page {sequence} has no data")));
        }
        if payload.len() > page_size {
            return Err(Error::Protocol(format!(
                "page {sequence} holds {} bytes, page size is {page_size}",
                payload.len()
            )));
        }
        let len = u8::try_from(payload.len()).map_err(|_| {
            Error::Protocol(format!(
                "page {sequence} holds {} bytes, length field is one byte",
                payload.len()
            ))
        })?;

        Ok(Self {
            sequence,
            len,
            payload,
        })
    }

    /// Logical 1-based page number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Page number as transmitted (modulo 256).
    pub fn wire_sequence(&self) -> u8 {
        self.sequence.to_le_bytes()[0]
    }

    /// Page data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Always false; pages are never empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Header bytes `[seq mod 256, len]`.
    pub fn header(&self) -> [u8; 2] {
        encode_header(self.sequence, self.len)
    }

    /// Header followed by payload, as sent in the write-page data stage.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.payload.len());
        frame.extend_from_slice(&self.header());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Compare a verify readback against this page.
    ///
    /// Only the first `len()` bytes are checked; whatever the bootloader
    /// returns past the payload of a short page is ignored.
    pub fn verify(&self, readback: &[u8]) -> Verification {
        let mismatch = self
            .payload
            .iter()
            .zip(readback)
            .position(|(expected, actual)| expected != actual);

        if let Some(index) = mismatch {
            return Verification::Mismatch {
                index,
                expected: self.payload[index],
                actual: readback[index],
            };
        }

        if readback.len() < self.payload.len() {
            return Verification::Short {
                received: readback.len(),
            };
        }

        Verification::Match
    }
}

/// Outcome of comparing a readback with the page that was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Every payload byte came back unchanged.
    Match,
    /// First differing byte.
    Mismatch {
        /// Lowest index where the bytes differ.
        index: usize,
        /// Byte that was sent.
        expected: u8,
        /// Byte that came back.
        actual: u8,
    },
    /// The readback ended before the payload did; all bytes received matched.
    Short {
        /// Bytes actually returned.
        received: usize,
    },
}

impl Verification {
    /// Whether the page can be accepted.
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => write!(f, "match"),
            Self::Mismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "mismatch at index {index}: expected 0x{expected:02x}, got 0x{actual:02x}"
            ),
            Self::Short { received } => write!(f, "short readback ({received} bytes)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: usize = 128;

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, P), 0);
        assert_eq!(total_pages(1, P), 1);
        assert_eq!(total_pages(P as u64, P), 1);
        assert_eq!(total_pages(P as u64 + 1, P), 2);
        assert_eq!(total_pages(256 * P as u64, P), 256);
        assert_eq!(total_pages(10_000, 100), 100);
    }

    #[test]
    fn test_header_layout() {
        let page = Page::new(1, vec![0xAA; P], P).unwrap();
        assert_eq!(page.header(), [1, 128]);

        let page = Page::new(2, vec![0x55], P).unwrap();
        assert_eq!(page.header(), [2, 1]);
    }

    #[test]
    fn test_header_wraps_modulo_256() {
        assert_eq!(encode_header(255, 4), [255, 4]);
        assert_eq!(encode_header(256, 4), [0, 4]);
        assert_eq!(encode_header(257, 4), [1, 4]);

        let page = Page::new(257, vec![0; 4], P).unwrap();
        assert_eq!(page.sequence(), 257);
        assert_eq!(page.wire_sequence(), 1);
    }

    #[test]
    fn test_encode_prefixes_header() {
        let page = Page::new(3, vec![0x10, 0x20, 0x30], P).unwrap();
        assert_eq!(page.encode(), vec![3, 3, 0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_encode_is_idempotent() {
        let page = Page::new(9, (0..64).collect(), P).unwrap();
        assert_eq!(page.encode(), page.encode());
    }

    #[test]
    fn test_new_rejects_invalid_pages() {
        assert!(Page::new(0, vec![1], P).is_err());
        assert!(Page::new(1, Vec::new(), P).is_err());
        assert!(Page::new(1, vec![0; P + 1], P).is_err());
        assert!(Page::new(1, vec![0; 256], 512).is_err());
    }

    #[test]
    fn test_verify_full_match() {
        let page = Page::new(1, vec![1, 2, 3, 4], P).unwrap();
        assert_eq!(page.verify(&[1, 2, 3, 4]), Verification::Match);
    }

    #[test]
    fn test_verify_ignores_trailing_bytes() {
        let page = Page::new(2, vec![1, 2, 3], P).unwrap();
        let mut readback = vec![1, 2, 3];
        readback.resize(P, 0xFF);
        assert!(page.verify(&readback).is_match());
    }

    #[test]
    fn test_verify_reports_lowest_mismatch() {
        let page = Page::new(1, vec![1, 2, 3, 4, 5], P).unwrap();
        let result = page.verify(&[1, 2, 9, 4, 9]);
        assert_eq!(
            result,
            Verification::Mismatch {
                index: 2,
                expected: 3,
                actual: 9
            }
        );
    }

    #[test]
    fn test_verify_compares_raw_bytes() {
        // 0xC3 0xA9 is "é" in UTF-8; comparison must not decode
        let page = Page::new(1, vec![0xC3, 0xA9], P).unwrap();
        assert!(page.verify(&[0xC3, 0xA9]).is_match());
        assert!(!page.verify(&[0xE9, 0x00]).is_match());
    }

    #[test]
    fn test_verify_short_readback() {
        let page = Page::new(1, vec![1, 2, 3, 4], P).unwrap();
        assert_eq!(page.verify(&[1, 2]), Verification::Short { received: 2 });
        assert_eq!(page.verify(&[]), Verification::Short { received: 0 });
    }

    #[test]
    fn test_verify_mismatch_wins_over_short() {
        let page = Page::new(1, vec![1, 2, 3, 4], P).unwrap();
        assert!(matches!(
            page.verify(&[1, 7]),
            Verification::Mismatch { index: 1, .. }
        ));
    }

    #[test]
    fn test_verification_display() {
        let v = Verification::Mismatch {
            index: 5,
            expected: 0xab,
            actual: 0x00,
        };
        assert_eq!(
            v.to_string(),
            "mismatch at index 5: expected 0xab, got 0x00"
        );
    }
}
