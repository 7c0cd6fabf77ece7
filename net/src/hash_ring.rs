//! Consistent-hash ring over virtual nodes.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::ops::Bound::{Excluded, Unbounded};

use ahash::AHasher;

/// Maps keys to physical node indices through a ring of virtual nodes.
///
/// Each physical node contributes `replicas` positions on the ring; a key
/// lands on the first position strictly greater than its hash, wrapping to
/// the smallest position past the end. Membership changes therefore disturb
/// only the keys between the removed node's positions and their successors.
pub struct HashRing {
    replicas: usize,
    ring: BTreeMap<u64, usize>,
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        HashRing {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Place `replicas` virtual nodes for `name`, all resolving to `index`.
    pub fn add_node(&mut self, name: &str, index: usize) {
        for i in 0..self.replicas {
            self.ring.insert(hash_str(&format!("{name}-{i}")), index);
        }
    }

    /// Remove every virtual node previously placed for `name`.
    pub fn remove_node(&mut self, name: &str) {
        for i in 0..self.replicas {
            self.ring.remove(&hash_str(&format!("{name}-{i}")));
        }
    }

    /// Node index responsible for `key`, or `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let h = hash_str(key);
        self.ring
            .range((Excluded(h), Unbounded))
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &index)| index)
    }
}
