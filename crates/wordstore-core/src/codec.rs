//! Counter record codec
//!
//! A record is stored as two or three 32-bit words in the byte order of the
//! machine that created the list file:
//!
//! ```text
//!   [0..4]   spam_count
//!   [4..8]   good_count
//!   [8..12]  last_seen (YYYYMMDD), omitted when timestamps are off or unset
//! ```
//!
//! The file's order is read once when a list is opened; a [`Codec`] built from
//! it swaps on both decode and encode so foreign files stay self-consistent.

use crate::error::{StoreError, StoreResult};
use crate::record::CounterRecord;

/// Encoded length without the timestamp word.
pub const SHORT_RECORD_LEN: usize = 8;

/// Encoded length with the timestamp word.
pub const LONG_RECORD_LEN: usize = 12;

/// Byte order of the value blobs in a list file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Order of the running machine.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Header tag byte.
    pub fn tag(self) -> u8 {
        match self {
            ByteOrder::Little => b'l',
            ByteOrder::Big => b'B',
        }
    }

    /// Parse a header tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'l' => Some(ByteOrder::Little),
            b'B' => Some(ByteOrder::Big),
            _ => None,
        }
    }
}

/// Marshals [`CounterRecord`]s for one list file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    byte_order_differs: bool,
}

impl Codec {
    /// Codec for files written by this machine.
    pub const NATIVE: Codec = Codec {
        byte_order_differs: false,
    };

    /// Codec for a file whose header names `order`.
    pub fn for_order(order: ByteOrder) -> Self {
        Self {
            byte_order_differs: order != ByteOrder::native(),
        }
    }

    /// Whether values are swapped on the way in and out.
    pub fn byte_order_differs(&self) -> bool {
        self.byte_order_differs
    }

    fn word(&self, raw: &[u8]) -> u32 {
        self.swap(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn put_word(&self, out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&self.swap(v).to_ne_bytes());
    }

    fn swap(&self, v: u32) -> u32 {
        if self.byte_order_differs {
            v.swap_bytes()
        } else {
            v
        }
    }

    /// Decode an 8- or 12-byte value; missing trailing fields are 0.
    pub fn decode(&self, raw: &[u8]) -> StoreResult<CounterRecord> {
        match raw.len() {
            SHORT_RECORD_LEN => Ok(CounterRecord::counts(
                self.word(&raw[0..4]),
                self.word(&raw[4..8]),
            )),
            LONG_RECORD_LEN => Ok(CounterRecord::new(
                self.word(&raw[0..4]),
                self.word(&raw[4..8]),
                self.word(&raw[8..12]),
            )),
            len => Err(StoreError::MalformedRecord { len }),
        }
    }

    /// Encode a record; the date word is written only when enabled and set.
    pub fn encode(&self, rec: &CounterRecord, timestamps_enabled: bool) -> Vec<u8> {
        let with_date = timestamps_enabled && rec.last_seen != 0;
        let mut out = Vec::with_capacity(LONG_RECORD_LEN);
        self.put_word(&mut out, rec.spam_count);
        self.put_word(&mut out, rec.good_count);
        if with_date {
            self.put_word(&mut out, rec.last_seen);
        }
        out
    }
}

/// Decode a value written by this machine.
pub fn decode(raw: &[u8]) -> StoreResult<CounterRecord> {
    Codec::NATIVE.decode(raw)
}

/// Encode a value for a list written by this machine.
pub fn encode(rec: &CounterRecord, timestamps_enabled: bool) -> Vec<u8> {
    Codec::NATIVE.encode(rec, timestamps_enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn foreign() -> ByteOrder {
        match ByteOrder::native() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    #[test]
    fn test_lengths() {
        let rec = CounterRecord::new(10, 1, 20240101);
        assert_eq!(encode(&rec, true).len(), LONG_RECORD_LEN);
        assert_eq!(encode(&rec, false).len(), SHORT_RECORD_LEN);
        assert_eq!(encode(&CounterRecord::counts(10, 1), true).len(), SHORT_RECORD_LEN);
    }

    #[test]
    fn test_short_record_defaults_date() {
        let raw = encode(&CounterRecord::new(7, 9, 20240101), false);
        assert_eq!(decode(&raw).unwrap(), CounterRecord::counts(7, 9));
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        for len in [0usize, 4, 7, 9, 11, 13, 16] {
            let raw = vec![0u8; len];
            let result = decode(&raw);
            assert!(matches!(result, Err(StoreError::MalformedRecord { len: l }) if l == len));
        }
    }

    #[test]
    fn test_foreign_order_swaps() {
        let codec = Codec::for_order(foreign());
        assert!(codec.byte_order_differs());

        let rec = CounterRecord::new(0x0102_0304, 5, 20240101);
        let raw = codec.encode(&rec, true);
        // the stored words are byte-reversed relative to native
        assert_eq!(&raw[0..4], &0x0102_0304u32.swap_bytes().to_ne_bytes());
        assert_eq!(codec.decode(&raw).unwrap(), rec);
        assert_ne!(decode(&raw).unwrap(), rec);
    }

    #[test]
    fn test_byte_order_tags() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            assert_eq!(ByteOrder::from_tag(order.tag()), Some(order));
        }
        assert_eq!(ByteOrder::from_tag(b'x'), None);
        assert!(!Codec::for_order(ByteOrder::native()).byte_order_differs());
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            spam in any::<u32>(),
            good in any::<u32>(),
            date in any::<u32>(),
            ts in any::<bool>(),
            swapped in any::<bool>(),
        ) {
            let codec = if swapped {
                Codec::for_order(foreign())
            } else {
                Codec::NATIVE
            };
            let rec = CounterRecord::new(spam, good, date);
            let back = codec.decode(&codec.encode(&rec, ts)).unwrap();
            let expected = if ts {
                rec
            } else {
                CounterRecord::counts(spam, good)
            };
            prop_assert_eq!(back, expected);
        }
    }
}
