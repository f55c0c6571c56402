use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Key, Result, StoreErr};

/// The position of a row inside the store's file, in slot units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub u64);

#[derive(Debug, Default)]
struct Slots {
    by_key: HashMap<Key, Slot>,
    next: u64,
}

/// Maps embedding keys to their storage slots.
///
/// Lookups run concurrently behind a read lock while inserts are serialized behind the write
/// lock. Slots are handed out monotonically and never released.
#[derive(Debug)]
pub struct KeyIndex {
    slots: RwLock<Slots>,
    limit: Option<usize>,
}

impl KeyIndex {
    /// Creates a new empty `KeyIndex`.
    ///
    /// # Arguments
    /// * `limit` - An optional upper bound for the amount of keys.
    ///
    /// # Returns
    /// A new `KeyIndex` instance.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            limit,
        }
    }

    /// Looks up the slot of `key`.
    ///
    /// # Returns
    /// The slot, or `None` if the key was never inserted.
    pub fn resolve(&self, key: Key) -> Option<Slot> {
        self.slots.read().by_key.get(&key).copied()
    }

    /// Allocates a slot for `key`, returns the existing slot if it was already indexed.
    ///
    /// # Arguments
    /// * `key` - The key to index.
    ///
    /// # Returns
    /// The key's slot or a `VocabularyExhausted` error if the limit was reached.
    pub fn insert(&self, key: Key) -> Result<Slot> {
        let mut slots = self.slots.write();

        if let Some(slot) = slots.by_key.get(&key) {
            return Ok(*slot);
        }

        if let Some(limit) = self.limit {
            if slots.by_key.len() >= limit {
                return Err(StoreErr::VocabularyExhausted { key, limit });
            }
        }

        let slot = Slot(slots.next);
        slots.next += 1;
        slots.by_key.insert(key, slot);
        Ok(slot)
    }

    /// Registers a key found at a known slot while recovering the index from disk.
    ///
    /// # Returns
    /// The slot previously registered for `key`, if any.
    pub(crate) fn restore(&self, key: Key, slot: Slot) -> Option<Slot> {
        let mut slots = self.slots.write();
        slots.next = slots.next.max(slot.0 + 1);
        slots.by_key.insert(key, slot)
    }

    /// Makes sure new slots are allocated after `count` already existing ones.
    pub(crate) fn reserve_slots(&self, count: u64) {
        let mut slots = self.slots.write();
        slots.next = slots.next.max(count);
    }

    pub fn contains(&self, key: Key) -> bool {
        self.slots.read().by_key.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The amount of slots handed out so far, including slots left empty by a crash.
    pub fn allocated(&self) -> u64 {
        self.slots.read().next
    }

    /// Collects every indexed key, ordered by slot.
    pub fn keys(&self) -> Vec<Key> {
        let slots = self.slots.read();
        let mut entries: Vec<_> = slots.by_key.iter().map(|(k, s)| (*s, *k)).collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, k)| k).collect()
    }
}
