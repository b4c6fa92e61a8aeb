//! In-memory keyspace.
//!
//! Maps byte-string keys to byte-string values on top of the incrementally
//! resizing `HMap`. The keyspace owns hashing (FNV-1a) and key comparison,
//! which the index delegates to its callers.

use crate::hashtable::{HMap, HNode};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A stored key/value pair.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Single-threaded key-value store.
#[derive(Debug, Default)]
pub struct Keyspace {
    map: HMap<Entry>,
}

/// 64-bit FNV-1a hash of a key.
pub fn hash_key(key: &[u8]) -> u64 {
    key.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.map
            .lookup(hash_key(key), |entry| entry.key == key)
            .map(|node| node.value().value.as_slice())
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        let hcode = hash_key(key);
        match self.map.lookup(hcode, |entry| entry.key == key) {
            Some(node) => {
                let stored = &mut node.value_mut().value;
                stored.clear();
                stored.extend_from_slice(value);
            }
            None => {
                self.map.insert(HNode::new(
                    hcode,
                    Entry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                ));
            }
        }
    }

    /// Remove `key`, returning whether it was present.
    pub fn del(&mut self, key: &[u8]) -> bool {
        self.map
            .pop(hash_key(key), |entry| entry.key == key)
            .is_some()
    }

    /// Iterate over all keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.map.iter().map(|node| node.value().key.as_slice())
    }

    pub fn len(&self) -> usize {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.map.destroy();
    }
}
