//! Serialization for record log frame payloads.
//!
//! A frame payload is a bincode-encoded list of log operations. The options here are part of
//! the on-disk format: changing any of them means old logs no longer replay.

use bincode::Options;
use crate::{
    error::{Error, Result},
};
use serde::{
    de::Deserialize,
    ser::Serialize,
};

/// Frame lengths are stored as a `u32`, so no payload can be bigger than this.
const MAX_PAYLOAD: u64 = u32::MAX as u64;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        // integers are written the same way regardless of platform
        .with_big_endian()
        // every contract/timestamp/offset takes a fixed number of bytes
        .with_fixint_encoding()
        // a length prefix that checksummed fine but claims more than a frame can hold is
        // rejected instead of allocated
        .with_limit(MAX_PAYLOAD)
}

/// Serialize a value into a byte vector
pub(crate) fn serialize<T: Serialize>(val: &T) -> Result<Vec<u8>> {
    options()
        .serialize(val)
        .map_err(Error::Serde)
}

/// Deserialize a value from a byte vector
pub(crate) fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(Error::Serde)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        let bytes = serialize(&(7u32, -2i64, vec![0xabu8])).unwrap();
        assert_eq!(bytes, vec![
            0, 0, 0, 7,
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
            0, 0, 0, 0, 0, 0, 0, 1, 0xab,
        ]);
        let back: (u32, i64, Vec<u8>) = deserialize(&bytes).unwrap();
        assert_eq!(back, (7, -2, vec![0xab]));
    }

    #[test]
    fn truncated_payload() {
        let bytes = serialize(&vec![1u64, 2, 3]).unwrap();
        assert!(matches!(deserialize::<Vec<u64>>(&bytes[..bytes.len() - 1]), Err(Error::Serde(_))));
    }
}
