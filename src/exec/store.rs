//! Tuple stores: slot allocation, reference counts, and per-synopsis stub
//! state.
//!
//! A store owns pages from the memory manager and slices them into
//! fixed-size tuple slots. Each slot carries a reference count; a tuple is
//! born with count 1 when allocated, gains a count for every queue element
//! or synopsis entry that holds it, and returns to the freelist when the
//! count reaches zero.
//!
//! Synopses attach to a store through *stubs*. A stub is one unit of
//! auxiliary state — a timestamp FIFO for window synopses, a lineage map,
//! per-partition FIFOs, or a scannable live set for relation synopses. One
//! store may carry several stubs of mixed kinds, so a single operator
//! output can back, say, a window synopsis for one consumer and a relation
//! synopsis for another.

use std::collections::{HashMap, VecDeque};

use crate::error::RilletError;
use crate::exec::memory::{MemoryManager, Page};
use crate::types::Timestamp;

/// Reference to a tuple slot; the identity used for PLUS/MINUS pairing and
/// lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TuplePtr {
    pub store: u32,
    pub slot: u32,
}

/// Lineage of a derived tuple: the input tuples that produced it.
pub type LineageKey = Vec<TuplePtr>;

/// Byte ranges (offset, len) of the partition columns within a tuple.
/// Concatenated, they form the partition key.
#[derive(Debug, Clone, Default)]
pub struct PartitionSpec {
    pub ranges: Vec<(usize, usize)>,
}

impl PartitionSpec {
    pub fn key_of(&self, tuple: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.ranges.iter().map(|r| r.1).sum());
        for &(off, len) in &self.ranges {
            key.extend_from_slice(&tuple[off..off + len]);
        }
        key
    }
}

/// The kinds of stub state a synopsis can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Window,
    Lineage,
    Partition,
    Relation,
}

#[derive(Debug)]
enum StubState {
    /// Timestamp-ordered FIFO for window synopses.
    Window { fifo: VecDeque<(u32, Timestamp)> },
    /// Lineage-key map plus its reverse for deletion by tuple.
    Lineage {
        by_key: HashMap<LineageKey, u32>,
        key_of: HashMap<u32, LineageKey>,
    },
    /// Oldest-first FIFO per partition key.
    Partition {
        parts: HashMap<Vec<u8>, VecDeque<u32>>,
    },
    /// Scannable live set; scan order is unspecified.
    Relation {
        entries: Vec<u32>,
        pos: HashMap<u32, usize>,
    },
}

/// A tuple store.
#[derive(Debug)]
pub struct TupleStore {
    id: u32,
    tuple_len: usize,
    slots_per_page: usize,
    pages: Vec<Page>,
    refs: Vec<u32>,
    free: Vec<u32>,
    stubs: Vec<StubState>,
    partition_spec: PartitionSpec,
    max_pages: usize,
}

impl TupleStore {
    fn new(id: u32, tuple_len: usize, page_size: usize) -> Self {
        let tuple_len = tuple_len.max(1);
        Self {
            id,
            tuple_len,
            slots_per_page: (page_size / tuple_len).max(1),
            pages: Vec::new(),
            refs: Vec::new(),
            free: Vec::new(),
            stubs: Vec::new(),
            partition_spec: PartitionSpec::default(),
            max_pages: 0,
        }
    }

    pub fn tuple_len(&self) -> usize {
        self.tuple_len
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Attach a new stub; returns its id within this store.
    pub fn add_stub(&mut self, kind: StubKind) -> usize {
        let state = match kind {
            StubKind::Window => StubState::Window { fifo: VecDeque::new() },
            StubKind::Lineage => StubState::Lineage {
                by_key: HashMap::new(),
                key_of: HashMap::new(),
            },
            StubKind::Partition => StubState::Partition { parts: HashMap::new() },
            StubKind::Relation => StubState::Relation {
                entries: Vec::new(),
                pos: HashMap::new(),
            },
        };
        self.stubs.push(state);
        self.stubs.len() - 1
    }

    /// Declare the partition columns used by this store's partition stubs.
    pub fn set_partition_spec(&mut self, spec: PartitionSpec) {
        self.partition_spec = spec;
    }

    fn slot_bytes(&self, slot: u32) -> &[u8] {
        let page = slot as usize / self.slots_per_page;
        let off = (slot as usize % self.slots_per_page) * self.tuple_len;
        &self.pages[page][off..off + self.tuple_len]
    }

    fn slot_bytes_mut(&mut self, slot: u32) -> &mut [u8] {
        let page = slot as usize / self.slots_per_page;
        let off = (slot as usize % self.slots_per_page) * self.tuple_len;
        &mut self.pages[page][off..off + self.tuple_len]
    }

    fn new_slot(&mut self, mm: &mut MemoryManager) -> Result<u32, RilletError> {
        if let Some(slot) = self.free.pop() {
            self.refs[slot as usize] = 1;
            return Ok(slot);
        }
        let page = mm.allocate_page()?;
        let base = (self.pages.len() * self.slots_per_page) as u32;
        self.pages.push(page);
        self.max_pages = self.max_pages.max(self.pages.len());
        self.refs.resize(self.refs.len() + self.slots_per_page, 0);
        // Hand out the first slot of the new page, freelist the rest.
        for s in (1..self.slots_per_page as u32).rev() {
            self.free.push(base + s);
        }
        self.refs[base as usize] = 1;
        Ok(base)
    }

    fn add_ref(&mut self, slot: u32) {
        debug_assert!(self.refs[slot as usize] > 0, "add_ref on a dead tuple");
        self.refs[slot as usize] += 1;
    }

    fn decr_ref(&mut self, slot: u32) {
        let r = &mut self.refs[slot as usize];
        debug_assert!(*r > 0, "decr_ref on a dead tuple");
        *r -= 1;
        if *r == 0 {
            self.free.push(slot);
        }
    }

    fn ref_count(&self, slot: u32) -> u32 {
        self.refs[slot as usize]
    }

    // ── Window stub ────────────────────────────────────────────────────────

    pub fn win_insert(&mut self, stub: usize, slot: u32, ts: Timestamp) {
        match &mut self.stubs[stub] {
            StubState::Window { fifo } => fifo.push_back((slot, ts)),
            _ => unreachable!("stub {stub} is not a window stub"),
        }
    }

    pub fn win_oldest(&self, stub: usize) -> Option<(u32, Timestamp)> {
        match &self.stubs[stub] {
            StubState::Window { fifo } => fifo.front().copied(),
            _ => unreachable!("stub {stub} is not a window stub"),
        }
    }

    pub fn win_delete_oldest(&mut self, stub: usize) -> Option<u32> {
        match &mut self.stubs[stub] {
            StubState::Window { fifo } => fifo.pop_front().map(|(s, _)| s),
            _ => unreachable!("stub {stub} is not a window stub"),
        }
    }

    pub fn win_len(&self, stub: usize) -> usize {
        match &self.stubs[stub] {
            StubState::Window { fifo } => fifo.len(),
            _ => unreachable!("stub {stub} is not a window stub"),
        }
    }

    // ── Lineage stub ───────────────────────────────────────────────────────

    pub fn lin_insert(&mut self, stub: usize, slot: u32, key: LineageKey) {
        match &mut self.stubs[stub] {
            StubState::Lineage { by_key, key_of } => {
                debug_assert!(
                    !by_key.contains_key(&key),
                    "lineage synopsis already holds a tuple for this lineage"
                );
                by_key.insert(key.clone(), slot);
                key_of.insert(slot, key);
            }
            _ => unreachable!("stub {stub} is not a lineage stub"),
        }
    }

    pub fn lin_get(&self, stub: usize, key: &[TuplePtr]) -> Option<u32> {
        match &self.stubs[stub] {
            StubState::Lineage { by_key, .. } => by_key.get(key).copied(),
            _ => unreachable!("stub {stub} is not a lineage stub"),
        }
    }

    pub fn lin_delete(&mut self, stub: usize, slot: u32) -> bool {
        match &mut self.stubs[stub] {
            StubState::Lineage { by_key, key_of } => match key_of.remove(&slot) {
                Some(key) => {
                    by_key.remove(&key);
                    true
                }
                None => false,
            },
            _ => unreachable!("stub {stub} is not a lineage stub"),
        }
    }

    pub fn lin_len(&self, stub: usize) -> usize {
        match &self.stubs[stub] {
            StubState::Lineage { by_key, .. } => by_key.len(),
            _ => unreachable!("stub {stub} is not a lineage stub"),
        }
    }

    // ── Partition stub ─────────────────────────────────────────────────────

    /// Insert into the partition FIFO keyed by the tuple's own partition
    /// columns; partitions are created on first insert.
    pub fn partn_insert(&mut self, stub: usize, slot: u32) {
        let key = self.partition_spec.key_of(self.slot_bytes(slot));
        match &mut self.stubs[stub] {
            StubState::Partition { parts } => parts.entry(key).or_default().push_back(slot),
            _ => unreachable!("stub {stub} is not a partition stub"),
        }
    }

    /// Size of the partition that `slot`'s columns select.
    pub fn partn_size(&self, stub: usize, slot: u32) -> usize {
        let key = self.partition_spec.key_of(self.slot_bytes(slot));
        match &self.stubs[stub] {
            StubState::Partition { parts } => parts.get(&key).map_or(0, |f| f.len()),
            _ => unreachable!("stub {stub} is not a partition stub"),
        }
    }

    /// Remove and return the oldest tuple of the partition that `slot`'s
    /// columns select.
    pub fn partn_delete_oldest(&mut self, stub: usize, slot: u32) -> Option<u32> {
        let key = self.partition_spec.key_of(self.slot_bytes(slot));
        match &mut self.stubs[stub] {
            StubState::Partition { parts } => {
                let fifo = parts.get_mut(&key)?;
                let oldest = fifo.pop_front();
                if fifo.is_empty() {
                    parts.remove(&key);
                }
                oldest
            }
            _ => unreachable!("stub {stub} is not a partition stub"),
        }
    }

    pub fn partn_total_len(&self, stub: usize) -> usize {
        match &self.stubs[stub] {
            StubState::Partition { parts } => parts.values().map(|f| f.len()).sum(),
            _ => unreachable!("stub {stub} is not a partition stub"),
        }
    }

    // ── Relation stub ──────────────────────────────────────────────────────

    pub fn rel_insert(&mut self, stub: usize, slot: u32) {
        match &mut self.stubs[stub] {
            StubState::Relation { entries, pos } => {
                debug_assert!(!pos.contains_key(&slot), "relation stub already holds slot");
                pos.insert(slot, entries.len());
                entries.push(slot);
            }
            _ => unreachable!("stub {stub} is not a relation stub"),
        }
    }

    pub fn rel_delete(&mut self, stub: usize, slot: u32) -> bool {
        match &mut self.stubs[stub] {
            StubState::Relation { entries, pos } => match pos.remove(&slot) {
                Some(i) => {
                    entries.swap_remove(i);
                    if let Some(&moved) = entries.get(i) {
                        pos.insert(moved, i);
                    }
                    true
                }
                None => false,
            },
            _ => unreachable!("stub {stub} is not a relation stub"),
        }
    }

    pub fn rel_contains(&self, stub: usize, slot: u32) -> bool {
        match &self.stubs[stub] {
            StubState::Relation { pos, .. } => pos.contains_key(&slot),
            _ => unreachable!("stub {stub} is not a relation stub"),
        }
    }

    pub fn rel_entries(&self, stub: usize) -> &[u32] {
        match &self.stubs[stub] {
            StubState::Relation { entries, .. } => entries,
            _ => unreachable!("stub {stub} is not a relation stub"),
        }
    }

    pub fn rel_len(&self, stub: usize) -> usize {
        match &self.stubs[stub] {
            StubState::Relation { entries, .. } => entries.len(),
            _ => unreachable!("stub {stub} is not a relation stub"),
        }
    }
}

// ── Store pool ─────────────────────────────────────────────────────────────

/// All stores of one engine, addressed by the `store` half of a
/// [`TuplePtr`].
#[derive(Debug, Default)]
pub struct StorePool {
    stores: Vec<TupleStore>,
}

impl StorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store for tuples of `tuple_len` bytes; returns its id.
    pub fn add_store(&mut self, tuple_len: usize, page_size: usize) -> u32 {
        let id = self.stores.len() as u32;
        self.stores.push(TupleStore::new(id, tuple_len, page_size));
        id
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn store(&self, id: u32) -> &TupleStore {
        &self.stores[id as usize]
    }

    pub fn store_mut(&mut self, id: u32) -> &mut TupleStore {
        &mut self.stores[id as usize]
    }

    /// Reserve a fresh slot with reference count 1.
    pub fn new_tuple(&mut self, store: u32, mm: &mut MemoryManager) -> Result<TuplePtr, RilletError> {
        let slot = self.stores[store as usize].new_slot(mm)?;
        Ok(TuplePtr { store, slot })
    }

    pub fn tuple(&self, p: TuplePtr) -> &[u8] {
        self.stores[p.store as usize].slot_bytes(p.slot)
    }

    pub fn tuple_mut(&mut self, p: TuplePtr) -> &mut [u8] {
        self.stores[p.store as usize].slot_bytes_mut(p.slot)
    }

    pub fn add_ref(&mut self, p: TuplePtr) {
        self.stores[p.store as usize].add_ref(p.slot);
    }

    pub fn decr_ref(&mut self, p: TuplePtr) {
        self.stores[p.store as usize].decr_ref(p.slot);
    }

    pub fn ref_count(&self, p: TuplePtr) -> u32 {
        self.stores[p.store as usize].ref_count(p.slot)
    }
}
