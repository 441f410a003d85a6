//! Revisions identify a mutation in the store's history: a `(main, sub)`
//! pair, lexicographically ordered, encoded so that byte order on the
//! backend equals revision order.

use byteorder::{BigEndian, ReadBytesExt};
use serde_derive::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{CResult, Error};

/// Marks a tombstone revision key on disk: a live revision key is 16 bytes,
/// a tombstone is 17 bytes with this trailing byte.
pub const TOMBSTONE_MARKER: u8 = b't';

/// A `(main, sub)` pair identifying a mutation. `main` advances by one per
/// committed write transaction; `sub` advances per mutation within a single
/// transaction, starting at 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub const ZERO: Revision = Revision { main: 0, sub: 0 };

    pub fn new(main: i64, sub: i64) -> Self {
        Revision { main, sub }
    }

    /// The next revision within the same transaction.
    pub fn next_sub(&self) -> Self {
        Revision { main: self.main, sub: self.sub + 1 }
    }

    /// The first revision of the following transaction.
    pub fn next_main(&self) -> Self {
        Revision { main: self.main + 1, sub: 0 }
    }

    /// Encodes a live revision key: 16 bytes, big-endian `main` then `sub`.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.main.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sub.to_be_bytes());
        buf
    }

    /// Encodes a tombstone revision key: the 16-byte encoding plus the `'t'` marker.
    pub fn encode_tombstone(&self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[0..16].copy_from_slice(&self.encode());
        buf[16] = TOMBSTONE_MARKER;
        buf
    }

    /// Decodes a revision key, returning whether it was a tombstone.
    /// Any length other than 16 or 17 bytes is invalid input.
    pub fn decode(bytes: &[u8]) -> CResult<(Self, bool)> {
        match bytes.len() {
            16 => {
                let mut cur = Cursor::new(bytes);
                let main = cur.read_i64::<BigEndian>()?;
                let sub = cur.read_i64::<BigEndian>()?;
                Ok((Revision { main, sub }, false))
            }
            17 => {
                if bytes[16] != TOMBSTONE_MARKER {
                    return Err(Error::Corruption(format!(
                        "17-byte revision key has unexpected marker byte {:#x}",
                        bytes[16]
                    )));
                }
                let (rev, _) = Self::decode(&bytes[0..16])?;
                Ok((rev, true))
            }
            n => Err(Error::Corruption(format!("invalid revision key length {}", n))),
        }
    }

    /// The smallest possible revision strictly greater than `self`, used as an
    /// exclusive-end bound or to resume a chunked scan after `self`.
    pub fn immediately_after(&self) -> Self {
        self.next_sub()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let rev = Revision::new(7, 3);
        let (decoded, tombstone) = Revision::decode(&rev.encode()).unwrap();
        assert_eq!(decoded, rev);
        assert!(!tombstone);
    }

    #[test]
    fn tombstone_round_trip() {
        let rev = Revision::new(7, 3);
        let (decoded, tombstone) = Revision::decode(&rev.encode_tombstone()).unwrap();
        assert_eq!(decoded, rev);
        assert!(tombstone);
    }

    #[test]
    fn byte_order_matches_revision_order() {
        let a = Revision::new(1, 5).encode();
        let b = Revision::new(2, 0).encode();
        assert!(a.as_slice() < b.as_slice());

        let a = Revision::new(3, 1).encode();
        let b = Revision::new(3, 2).encode();
        assert!(a.as_slice() < b.as_slice());
    }

    #[test]
    fn invalid_length_is_corruption() {
        assert!(Revision::decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn ordering_is_lexicographic_on_the_pair() {
        assert!(Revision::new(1, 9) < Revision::new(2, 0));
        assert!(Revision::new(5, 0) < Revision::new(5, 1));
    }
}
