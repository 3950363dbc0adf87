//! The entry module holds the structures describing a single stored message, and the codec
//! that turns them into the binary records we keep in the log.
//!
//! A record is laid out as (all integers big endian):
//!
//! ```text
//! [version: u8][flags: u8][contract: u32][timestamp: i64][expiry: i64, if flagged]
//! [id_len: u32][id][topic_len: u32][topic][payload_len: u32][payload]
//! ```
//!
//! Every variable-length field carries its own length, so a record can be validated (and
//! skipped) without any outside schema.

use crate::{
    error::{Error, Result},
};
use getset::{CopyGetters, Getters, MutGetters};
use serde::{Serialize, Deserialize};
use std::ops::Deref;

macro_rules! wrapper_primitive {
    ($(#[$attr:meta])* $name:ident, $ty:ty) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name($ty);

        impl From<$ty> for $name {
            fn from(val: $ty) -> Self {
                Self(val)
            }
        }

        impl From<$name> for Vec<u8> {
            fn from(val: $name) -> Vec<u8> {
                Vec::from(val.0.to_be_bytes().as_slice())
            }
        }

        impl Deref for $name {
            type Target = $ty;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    }
}

wrapper_primitive! {
    /// A 32-bit namespace that keeps unrelated tenants' topics apart
    Contract, u32
}

wrapper_primitive! {
    /// A unix timestamp in microseconds
    Timestamp, i64
}

impl Timestamp {
    /// Grab the current wall-clock time.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_micros())
    }

    /// Add a number of seconds to this timestamp, saturating instead of overflowing.
    pub fn add_secs(&self, secs: u64) -> Self {
        let micros = i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000);
        Self(self.0.saturating_add(micros))
    }
}

/// A message's identifier. Generated ids sort in creation order, but callers are free to hand
/// us whatever bytes they like via `put_with_id`, so this is just an ordered byte string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Vec<u8>);

impl MessageId {
    /// Get the raw id bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert the id into a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse an id from a hex string. Returns `None` if the string isn't valid hex.
    pub fn from_hex(encoded: &str) -> Option<Self> {
        hex::decode(encoded).ok().map(Self)
    }
}

impl From<Vec<u8>> for MessageId {
    fn from(val: Vec<u8>) -> Self {
        Self(val)
    }
}

impl From<&[u8]> for MessageId {
    fn from(val: &[u8]) -> Self {
        Self(Vec::from(val))
    }
}

impl From<MessageId> for Vec<u8> {
    fn from(val: MessageId) -> Vec<u8> {
        val.0
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Represents a single stored message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Getters, CopyGetters, MutGetters)]
pub struct Entry {
    /// The message's id, unique within a (contract, topic)
    #[getset(get = "pub", get_mut = "pub")]
    pub(crate) id: MessageId,
    /// The tenant namespace this message lives in
    #[getset(get_copy = "pub")]
    pub(crate) contract: Contract,
    /// The topic this message was appended to
    #[getset(get = "pub")]
    pub(crate) topic: Vec<u8>,
    /// The message body. We never look inside.
    #[getset(get = "pub")]
    pub(crate) payload: Vec<u8>,
    /// When the message was written
    #[getset(get_copy = "pub")]
    pub(crate) timestamp: Timestamp,
    /// When the message stops being visible, if ever
    #[getset(get_copy = "pub", get_mut = "pub")]
    pub(crate) expiry: Option<Timestamp>,
}

impl Entry {
    /// Create a new entry with an empty id and no expiry, stamped with the current time.
    pub fn new<C, T, P>(contract: C, topic: T, payload: P) -> Self
        where C: Into<Contract>,
              T: Into<Vec<u8>>,
              P: Into<Vec<u8>>,
    {
        Self {
            id: MessageId::default(),
            contract: contract.into(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Timestamp::now(),
            expiry: None,
        }
    }

    /// Set the entry's id
    pub fn with_id<I: Into<MessageId>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    /// Set the entry's timestamp
    pub fn with_timestamp<T: Into<Timestamp>>(mut self, timestamp: T) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Set (or clear) the entry's expiry
    pub fn with_expiry<T: Into<Timestamp>>(mut self, expiry: Option<T>) -> Self {
        self.expiry = expiry.map(|x| x.into());
        self
    }

    /// Whether this entry is past its expiry at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Take the payload out of the entry
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

const RECORD_VERSION: u8 = 1;
const FLAG_EXPIRY: u8 = 0b0000_0001;
/// version + flags + contract + timestamp
const FIXED_LEN: usize = 1 + 1 + 4 + 8;

fn field_len(name: &str, len: usize) -> Result<[u8; 4]> {
    u32::try_from(len)
        .map(|x| x.to_be_bytes())
        .map_err(|_| Error::CorruptRecord(format!("{} is too long to encode ({} bytes)", name, len)))
}

/// Encode an [`Entry`] into a binary record.
pub fn encode(entry: &Entry) -> Result<Vec<u8>> {
    let Entry { id, contract, topic, payload, timestamp, expiry } = entry;
    let mut buf = Vec::with_capacity(
        FIXED_LEN + 8 + 12 + id.as_bytes().len() + topic.len() + payload.len()
    );
    let flags = if expiry.is_some() { FLAG_EXPIRY } else { 0 };
    buf.push(RECORD_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&contract.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    if let Some(expiry) = expiry {
        buf.extend_from_slice(&expiry.to_be_bytes());
    }
    for (name, field) in [("id", id.as_bytes()), ("topic", topic.as_slice()), ("payload", payload.as_slice())] {
        buf.extend_from_slice(&field_len(name, field.len())?);
        buf.extend_from_slice(field);
    }
    Ok(buf)
}

/// Walks a record, making sure every read stays inside the buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::CorruptRecord(format!(
                    "{} needs {} bytes at offset {} but record is {} bytes",
                    what, len, self.pos, self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N, what)?);
        Ok(arr)
    }

    fn field(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.array(what)?) as usize;
        self.take(len, what)
    }
}

/// Decode a binary record back into an [`Entry`].
pub fn decode(bytes: &[u8]) -> Result<Entry> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let [version] = reader.array::<1>("version")?;
    if version != RECORD_VERSION {
        return Err(Error::CorruptRecord(format!("unknown record version {}", version)));
    }
    let [flags] = reader.array::<1>("flags")?;
    if flags & !FLAG_EXPIRY != 0 {
        return Err(Error::CorruptRecord(format!("unknown record flags {:#010b}", flags)));
    }
    let contract = u32::from_be_bytes(reader.array("contract")?);
    let timestamp = i64::from_be_bytes(reader.array("timestamp")?);
    let expiry = if flags & FLAG_EXPIRY != 0 {
        Some(Timestamp::from(i64::from_be_bytes(reader.array("expiry")?)))
    } else {
        None
    };
    let id = reader.field("id")?;
    let topic = reader.field("topic")?;
    let payload = reader.field("payload")?;
    if reader.pos != bytes.len() {
        return Err(Error::CorruptRecord(format!("{} trailing bytes after record", bytes.len() - reader.pos)));
    }
    Ok(Entry {
        id: MessageId::from(id),
        contract: Contract::from(contract),
        topic: Vec::from(topic),
        payload: Vec::from(payload),
        timestamp: Timestamp::from(timestamp),
        expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry() -> Entry {
        Entry::new(42u32, "sensors/kitchen", "it's 23C in here")
            .with_id(vec![0u8, 1, 2, 3, 4, 5, 6, 7])
            .with_timestamp(1_678_169_565_578_000i64)
    }

    proptest! {
        #[test]
        fn round_trip(
            contract in any::<u32>(),
            id in proptest::collection::vec(any::<u8>(), 0..32),
            topic in proptest::collection::vec(any::<u8>(), 0..64),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            timestamp in any::<i64>(),
            expiry in proptest::option::of(any::<i64>()),
        ) {
            let entry = Entry::new(contract, topic, payload)
                .with_id(id)
                .with_timestamp(timestamp)
                .with_expiry(expiry);
            let bytes = encode(&entry).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), entry);
        }
    }

    #[test]
    fn empty_fields() {
        let entry = Entry::new(0u32, Vec::new(), Vec::new()).with_timestamp(0i64);
        let bytes = encode(&entry).unwrap();
        assert_eq!(bytes.len(), FIXED_LEN + 12);
        assert_eq!(decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn truncated() {
        let bytes = encode(&entry()).unwrap();
        for len in [0, 1, FIXED_LEN - 1, FIXED_LEN + 2, bytes.len() - 1] {
            let res = decode(&bytes[0..len]);
            assert!(matches!(res, Err(Error::CorruptRecord(_))), "len {} decoded: {:?}", len, res);
        }
    }

    #[test]
    fn length_past_end() {
        let mut bytes = encode(&entry()).unwrap();
        // id length sits right after the fixed header (no expiry on this one)
        bytes[FIXED_LEN..FIXED_LEN + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn trailing_garbage() {
        let mut bytes = encode(&entry()).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn bad_version_and_flags() {
        let mut bytes = encode(&entry()).unwrap();
        bytes[0] = 9;
        assert!(matches!(decode(&bytes), Err(Error::CorruptRecord(_))));
        let mut bytes = encode(&entry()).unwrap();
        bytes[1] = 0b1000_0000;
        assert!(matches!(decode(&bytes), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn hex_ids() {
        let id = MessageId::from(vec![0x00u8, 0xab, 0x10, 0xff]);
        assert_eq!(id.to_hex(), "00ab10ff");
        assert_eq!(MessageId::from_hex("00ab10ff"), Some(id));
        assert_eq!(MessageId::from_hex("00AB10FF").map(|x| x.to_hex()), Some(String::from("00ab10ff")));
        assert_eq!(MessageId::from_hex("abc"), None);
        assert_eq!(MessageId::from_hex("zz"), None);
    }

    #[test]
    fn expiry() {
        let entry = entry().with_expiry(Some(100i64));
        assert!(!entry.is_expired(Timestamp::from(99i64)));
        assert!(entry.is_expired(Timestamp::from(100i64)));
        assert!(!entry.with_expiry(None::<i64>).is_expired(Timestamp::from(i64::MAX)));
    }
}
