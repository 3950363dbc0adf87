//! Message id generation.
//!
//! A generated id is 16 bytes: an 8 byte big endian timestamp (microseconds) followed by an
//! 8 byte fingerprint of the contract, topic, and payload. Big endian timestamps mean ids sort
//! bytewise in creation order, so the index never needs a separate time ordering.
//!
//! The id for a given (contract, topic, payload, timestamp) is always the same. The generator
//! hands out strictly increasing timestamps, so two calls on the same generator never share one
//! even when the clock hasn't moved and the inputs are identical.

use crate::{
    entry::{Contract, MessageId, Timestamp},
    error::{Error, Result},
};
use std::sync::atomic::{AtomicI64, Ordering};
use xxhash_rust::xxh3::Xxh3;

/// Length of a generated id
pub const ID_LEN: usize = 16;

/// Hash the identifying parts of a message.
pub fn fingerprint(contract: Contract, topic: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&contract.to_be_bytes());
    // length-prefix the topic so ("ab", "c") and ("a", "bc") hash differently
    hasher.update(&(topic.len() as u64).to_be_bytes());
    hasher.update(topic);
    hasher.update(payload);
    hasher.digest()
}

/// Derive an id from a message's parts and a fixed timestamp. Returns
/// [`Error::EmptyKey`] if there's nothing to derive an identity from.
pub fn generate_at<C, T>(contract: C, topic: &[u8], payload: &[u8], timestamp: T) -> Result<MessageId>
    where C: Into<Contract>,
          T: Into<Timestamp>,
{
    let contract: Contract = contract.into();
    if *contract == 0 && topic.is_empty() && payload.is_empty() {
        return Err(Error::EmptyKey);
    }
    // clocks before 1970 get pinned to zero so the unsigned prefix still sorts
    let timestamp: Timestamp = timestamp.into();
    let ts = (*timestamp).max(0) as u64;
    let mut id = Vec::with_capacity(ID_LEN);
    id.extend_from_slice(&ts.to_be_bytes());
    id.extend_from_slice(&fingerprint(contract, topic, payload).to_be_bytes());
    Ok(MessageId::from(id))
}

/// Pull the timestamp back out of a generated id. Ids that weren't made by us (wrong length)
/// give `None`.
pub fn timestamp_of(id: &MessageId) -> Option<Timestamp> {
    let bytes = id.as_bytes();
    if bytes.len() != ID_LEN {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&bytes[0..8]);
    i64::try_from(u64::from_be_bytes(ts)).ok().map(Timestamp::from)
}

/// Generates time-ordered message ids. Safe to share between threads.
#[derive(Debug, Default)]
pub struct IdGenerator {
    /// The last timestamp handed out
    last: AtomicI64,
}

impl IdGenerator {
    /// Create a new generator
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current time, or one tick past the last timestamp we gave out if the clock
    /// hasn't moved forward since.
    pub fn next_timestamp(&self) -> Timestamp {
        let now = *Timestamp::now();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self.last.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Timestamp::from(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Generate a fresh id for the given message parts.
    pub fn generate<C: Into<Contract>>(&self, contract: C, topic: &[u8], payload: &[u8]) -> Result<MessageId> {
        let contract: Contract = contract.into();
        if *contract == 0 && topic.is_empty() && payload.is_empty() {
            return Err(Error::EmptyKey);
        }
        generate_at(contract, topic, payload, self.next_timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::{Arc, RwLock};

    #[test]
    fn deterministic() {
        let id1 = generate_at(7u32, b"weather", b"sunny", 1_678_169_565_578_000i64).unwrap();
        let id2 = generate_at(7u32, b"weather", b"sunny", 1_678_169_565_578_000i64).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.as_bytes().len(), ID_LEN);
        assert_eq!(timestamp_of(&id1), Some(Timestamp::from(1_678_169_565_578_000i64)));
    }

    #[test]
    fn distinct_inputs_same_instant() {
        let ts = 1_678_169_565_578_000i64;
        let ids = [
            generate_at(7u32, b"weather", b"sunny", ts).unwrap(),
            generate_at(7u32, b"weather", b"cloudy", ts).unwrap(),
            generate_at(8u32, b"weather", b"sunny", ts).unwrap(),
            generate_at(7u32, b"weathe", b"rsunny", ts).unwrap(),
        ];
        let unique = ids.iter().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn sorts_by_time() {
        let early = generate_at(1u32, b"a", b"zzzzzz", 1000i64).unwrap();
        let late = generate_at(1u32, b"a", b"aaaaaa", 1001i64).unwrap();
        assert!(early < late);
        // pre-epoch clocks pin to zero instead of wrapping to the end of the keyspace
        let ancient = generate_at(1u32, b"a", b"x", -5i64).unwrap();
        assert!(ancient < early);
    }

    #[test]
    fn empty_key() {
        assert!(matches!(generate_at(0u32, b"", b"", 1i64), Err(Error::EmptyKey)));
        assert!(matches!(IdGenerator::new().generate(0u32, b"", b""), Err(Error::EmptyKey)));
        assert!(generate_at(1u32, b"", b"", 1i64).is_ok());
        assert!(generate_at(0u32, b"t", b"", 1i64).is_ok());
        assert!(generate_at(0u32, b"", b"p", 1i64).is_ok());
    }

    #[test]
    fn foreign_ids_have_no_timestamp() {
        assert_eq!(timestamp_of(&MessageId::from(vec![1u8, 2, 3])), None);
    }

    #[test]
    fn generates_ids() {
        let generator = Arc::new(IdGenerator::new());
        let id_dumpster = Arc::new(RwLock::new(BTreeSet::new()));
        let mut handles = Vec::new();

        for _i in 0..8 {
            let local_gen = generator.clone();
            let ids = id_dumpster.clone();
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for _x in 0..50 {
                    mine.push(local_gen.generate(1u32, b"jobs", b"same payload every time").unwrap());
                }
                // each thread sees its own ids in increasing order
                let mut sorted = mine.clone();
                sorted.sort();
                assert_eq!(mine, sorted);
                let mut handle = ids.write().unwrap();
                for id in mine {
                    (*handle).insert(id);
                }
            }));
        }

        for handle in handles { handle.join().unwrap(); }
        assert_eq!(id_dumpster.read().unwrap().len(), 8 * 50);
    }
}
