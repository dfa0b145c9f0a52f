//! Consistent-hash ring mapping keys onto node identifiers.
//!
//! Each node owns `replicas` virtual slots on a 32-bit ring. A key maps to
//! the node owning the first slot at or after the key's hash, wrapping to
//! the first slot past the end. Adding or removing one node only moves the
//! keys that fall into that node's slots.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Replica count used by the routing policies when none is configured.
pub const DEFAULT_REPLICAS: usize = 2999;

/// Prefix mixed into every virtual-slot hash.
pub const SLOT_SALT: &str = "n*@if09^Ig3h";

pub type HashFn = fn(&[u8]) -> u32;

/// 32-bit FNV-1.
pub fn fnv1_32(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    data.iter()
        .fold(OFFSET, |hash, byte| hash.wrapping_mul(PRIME) ^ u32::from(*byte))
}

#[derive(Default)]
struct Slots {
    /// Always sorted, never contains duplicates.
    sorted: Vec<u32>,
    owners: HashMap<u32, String>,
}

pub struct KeyRing {
    replicas: usize,
    hash: HashFn,
    slots: RwLock<Slots>,
}

impl KeyRing {
    pub fn new(replicas: usize) -> Result<Self> {
        Self::with_hasher(replicas, fnv1_32)
    }

    pub fn with_hasher(replicas: usize, hash: HashFn) -> Result<Self> {
        if replicas == 0 {
            return Err(Error::Config("ring replicas must be at least 1".into()));
        }
        Ok(Self {
            replicas,
            hash,
            slots: RwLock::new(Slots::default()),
        })
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    fn slot_hash(&self, replica: usize, node: &str) -> u32 {
        (self.hash)(format!("{SLOT_SALT}{replica}{node}").as_bytes())
    }

    /// Inserts every virtual slot of `nodes`, then re-sorts once.
    pub fn add<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..self.replicas {
                let slot = self.slot_hash(replica, node);
                if slots.owners.insert(slot, node.to_string()).is_none() {
                    slots.sorted.push(slot);
                }
            }
        }
        slots.sorted.sort_unstable();
    }

    /// Drops the virtual slots of `nodes` and compacts the sorted slot list
    /// in one linear pass.
    pub fn remove<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let mut deleted = Vec::new();
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..self.replicas {
                let slot = self.slot_hash(replica, node);
                if slots.owners.remove(&slot).is_some() {
                    deleted.push(slot);
                }
            }
        }
        if deleted.is_empty() {
            return;
        }
        deleted.sort_unstable();
        compact(&mut slots.sorted, &deleted);
    }

    /// Returns the node owning `key`, or `None` when the ring is empty.
    pub fn get(&self, key: &str) -> Option<String> {
        let hash = (self.hash)(key.as_bytes());
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        if slots.sorted.is_empty() {
            return None;
        }
        let mut idx = slots.sorted.partition_point(|slot| *slot < hash);
        if idx == slots.sorted.len() {
            idx = 0;
        }
        slots.owners.get(&slots.sorted[idx]).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sorted
            .is_empty()
    }

    /// Number of distinct nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    /// Distinct nodes currently on the ring, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut nodes: Vec<String> = slots.owners.values().cloned().collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    pub fn slot_count(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sorted
            .len()
    }
}

/// Removes every value in `deleted` (sorted) from `sorted` without re-sorting.
fn compact(sorted: &mut Vec<u32>, deleted: &[u32]) {
    let mut doomed = deleted.iter().peekable();
    let mut write = 0;
    for read in 0..sorted.len() {
        let slot = sorted[read];
        while doomed.next_if(|d| **d < slot).is_some() {}
        if doomed.next_if_eq(&&slot).is_some() {
            continue;
        }
        sorted[write] = slot;
        write += 1;
    }
    sorted.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("player-{i}")).collect()
    }

    #[test]
    fn fnv1_matches_reference_vectors() {
        assert_eq!(fnv1_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1_32(b"a"), 0x050c_5d7e);
        assert_eq!(fnv1_32(b"foobar"), 0x31f0_b262);
    }

    #[test]
    fn lookup_is_stable_then_empty_after_removal() {
        let ring = KeyRing::new(9).expect("ring");
        let nodes = ["n1", "n2", "n3", "n4"];
        for node in nodes {
            ring.add([node]);
        }

        let first = ring.get("testKey1").expect("non-empty ring resolves");
        let second = ring.get("testKey1").expect("non-empty ring resolves");
        assert_eq!(first, second);
        assert!(nodes.contains(&first.as_str()));

        for node in nodes {
            ring.remove([node]);
        }
        assert!(ring.is_empty());
        assert_eq!(ring.get("testKey1"), None);
    }

    #[test]
    fn slots_stay_sorted_and_sized() {
        let ring = KeyRing::new(50).expect("ring");
        ring.add(["a", "b", "c"]);
        assert_eq!(ring.nodes(), vec!["a", "b", "c"]);
        assert_eq!(ring.len(), 3);
        assert!(ring.slot_count() <= 150 && ring.slot_count() >= 148);

        ring.remove(["b"]);
        let slots = ring.slots.read().unwrap();
        assert!(slots.sorted.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(slots.sorted.len(), slots.owners.len());
        assert!(slots.owners.values().all(|n| n != "b"));
    }

    #[test]
    fn removing_unknown_node_is_a_noop() {
        let ring = KeyRing::new(16).expect("ring");
        ring.add(["a"]);
        let before = ring.slot_count();
        ring.remove(["zzz"]);
        assert_eq!(ring.slot_count(), before);
    }

    #[test]
    fn zero_replicas_rejected() {
        assert!(matches!(KeyRing::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn adding_a_node_moves_about_one_share_of_keys() {
        let keys = sample_keys(20_000);
        let ring = KeyRing::new(160).expect("ring");
        let base: Vec<String> = (1..=4).map(|i| format!("10.0.0.{i}:9000")).collect();
        ring.add(&base);
        let before: Vec<String> = keys.iter().map(|k| ring.get(k).unwrap()).collect();

        ring.add(["10.0.0.5:9000"]);
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, old)| ring.get(k).as_ref() != Some(*old))
            .count();

        let rate = moved as f64 / keys.len() as f64;
        let expected = 1.0 / 5.0;
        assert!(
            (rate - expected).abs() < 0.07,
            "moved {rate:.3} of keys, expected close to {expected:.3}"
        );
        // Keys that moved must have moved to the new node.
        for (key, old) in keys.iter().zip(&before) {
            let now = ring.get(key).unwrap();
            assert!(now == *old || now == "10.0.0.5:9000");
        }
    }

    #[test]
    fn compact_handles_interleaved_deletions() {
        let mut sorted = vec![1, 3, 5, 7, 9, 11];
        compact(&mut sorted, &[1, 7, 11]);
        assert_eq!(sorted, vec![3, 5, 9]);

        let mut sorted = vec![2, 4, 6];
        compact(&mut sorted, &[1, 4, 10]);
        assert_eq!(sorted, vec![2, 6]);
    }
}
