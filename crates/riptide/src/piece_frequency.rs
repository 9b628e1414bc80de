use std::collections::{HashMap, HashSet};

/// Replication counts over the swarm with O(1) increment, decrement, and
/// rarest/most-common queries.
///
/// A doubly linked list of buckets, one per distinct count, ordered from the
/// highest count at the head to the lowest at the tail. Each bucket holds
/// the set of piece indices sharing that count, so `inc`/`dec` move a key
/// between neighboring buckets without scanning. The list is arena-backed:
/// nodes live in a slab and link by slot index.
#[derive(Debug)]
pub struct PieceFrequency {
    slab: Vec<Bucket>,
    free: Vec<usize>,
    lookup: HashMap<usize, usize>,
}

#[derive(Debug)]
struct Bucket {
    count: usize,
    keys: HashSet<usize>,
    prev: usize,
    next: usize,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

impl Default for PieceFrequency {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceFrequency {
    pub fn new() -> Self {
        let slab = vec![
            Bucket {
                count: usize::MAX,
                keys: HashSet::new(),
                prev: HEAD,
                next: TAIL,
            },
            Bucket {
                count: 0,
                keys: HashSet::new(),
                prev: HEAD,
                next: TAIL,
            },
        ];
        Self {
            slab,
            free: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Current replication count of a piece; zero when untracked.
    pub fn count(&self, key: usize) -> usize {
        self.lookup
            .get(&key)
            .map(|&slot| self.slab[slot].count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// The piece with the smallest positive count, if any piece is tracked.
    pub fn rarest(&self) -> Option<usize> {
        let slot = self.slab[TAIL].prev;
        if slot == HEAD {
            return None;
        }
        self.slab[slot].keys.iter().next().copied()
    }

    /// The piece with the largest count.
    pub fn most_common(&self) -> Option<usize> {
        let slot = self.slab[HEAD].next;
        if slot == TAIL {
            return None;
        }
        self.slab[slot].keys.iter().next().copied()
    }

    pub fn inc(&mut self, key: usize) {
        match self.lookup.get(&key).copied() {
            Some(slot) => {
                let new_count = self.slab[slot].count + 1;
                let prev = self.slab[slot].prev;
                let target = if prev != HEAD && self.slab[prev].count == new_count {
                    prev
                } else {
                    self.insert_before(slot, new_count)
                };
                self.move_key(key, slot, target);
            }
            None => {
                let last = self.slab[TAIL].prev;
                let target = if last != HEAD && self.slab[last].count == 1 {
                    last
                } else {
                    self.insert_before(TAIL, 1)
                };
                self.slab[target].keys.insert(key);
                self.lookup.insert(key, target);
            }
        }
    }

    pub fn dec(&mut self, key: usize) {
        let Some(slot) = self.lookup.get(&key).copied() else {
            debug_assert!(false, "dec of untracked piece {}", key);
            return;
        };
        let new_count = self.slab[slot].count - 1;
        if new_count == 0 {
            self.slab[slot].keys.remove(&key);
            self.lookup.remove(&key);
            self.collect_if_empty(slot);
            return;
        }
        let next = self.slab[slot].next;
        let target = if next != TAIL && self.slab[next].count == new_count {
            next
        } else {
            self.insert_after(slot, new_count)
        };
        self.move_key(key, slot, target);
    }

    fn move_key(&mut self, key: usize, from: usize, to: usize) {
        self.slab[from].keys.remove(&key);
        self.slab[to].keys.insert(key);
        self.lookup.insert(key, to);
        self.collect_if_empty(from);
    }

    fn insert_before(&mut self, slot: usize, count: usize) -> usize {
        let prev = self.slab[slot].prev;
        self.link_new(prev, slot, count)
    }

    fn insert_after(&mut self, slot: usize, count: usize) -> usize {
        let next = self.slab[slot].next;
        self.link_new(slot, next, count)
    }

    fn link_new(&mut self, before: usize, after: usize, count: usize) -> usize {
        let node = Bucket {
            count,
            keys: HashSet::new(),
            prev: before,
            next: after,
        };
        let slot = match self.free.pop() {
            Some(reused) => {
                self.slab[reused] = node;
                reused
            }
            None => {
                self.slab.push(node);
                self.slab.len() - 1
            }
        };
        self.slab[before].next = slot;
        self.slab[after].prev = slot;
        slot
    }

    fn collect_if_empty(&mut self, slot: usize) {
        if slot == HEAD || slot == TAIL || !self.slab[slot].keys.is_empty() {
            return;
        }
        let prev = self.slab[slot].prev;
        let next = self.slab[slot].next;
        self.slab[prev].next = next;
        self.slab[next].prev = prev;
        self.free.push(slot);
    }
}
