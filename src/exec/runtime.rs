//! The runtime arena: every shared entity of a running engine, owned by
//! value and addressed by dense indices.
//!
//! Operators borrow entities through this arena instead of holding
//! references to each other — the instantiator records indices, and all
//! access happens on the scheduler thread. Synopsis operations live here
//! because they combine store access, index maintenance and statistics.

use crate::error::RilletError;
use crate::exec::eval::Role;
use crate::exec::index::HashIndex;
use crate::exec::memory::MemoryManager;
use crate::exec::monitor::OpMonitor;
use crate::exec::queue::Queue;
use crate::exec::store::{LineageKey, StorePool, TuplePtr};
use crate::exec::synopsis::{SynKind, Synopsis};
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Runtime {
    pub mem: MemoryManager,
    pub stores: StorePool,
    pub synopses: Vec<Synopsis>,
    pub indexes: Vec<HashIndex>,
    pub queues: Vec<Queue>,
    pub op_monitors: Vec<OpMonitor>,
}

impl Runtime {
    pub fn new(mem: MemoryManager) -> Self {
        Self {
            mem,
            stores: StorePool::new(),
            synopses: Vec::new(),
            indexes: Vec::new(),
            queues: Vec::new(),
            op_monitors: Vec::new(),
        }
    }

    // ── Entity registration ────────────────────────────────────────────────

    pub fn add_queue(&mut self, capacity: usize) -> usize {
        let id = self.queues.len();
        self.queues.push(Queue::new(id, capacity));
        id
    }

    pub fn add_synopsis(&mut self, kind: SynKind, store: u32, stub: usize) -> usize {
        let id = self.synopses.len();
        self.synopses.push(Synopsis::new(id, kind, store, stub));
        id
    }

    pub fn add_index(&mut self, index: HashIndex) -> usize {
        let id = self.indexes.len();
        debug_assert_eq!(id, index.id());
        self.indexes.push(index);
        id
    }

    // ── Tuple helpers ──────────────────────────────────────────────────────

    pub fn new_tuple(&mut self, store: u32) -> Result<TuplePtr, RilletError> {
        self.stores.new_tuple(store, &mut self.mem)
    }

    pub fn add_ref(&mut self, t: TuplePtr) {
        self.stores.add_ref(t);
    }

    pub fn decr_ref(&mut self, t: TuplePtr) {
        self.stores.decr_ref(t);
    }

    // ── Window synopsis ────────────────────────────────────────────────────

    pub fn win_insert(&mut self, syn: usize, t: TuplePtr, ts: Timestamp) {
        let s = &mut self.synopses[syn];
        debug_assert_eq!(s.kind, SynKind::Window);
        debug_assert_eq!(s.store, t.store);
        self.stores.store_mut(s.store).win_insert(s.stub, t.slot, ts);
        let n = self.stores.store(s.store).win_len(s.stub);
        s.stats.record(n);
    }

    pub fn win_is_empty(&self, syn: usize) -> bool {
        let s = &self.synopses[syn];
        self.stores.store(s.store).win_len(s.stub) == 0
    }

    pub fn win_len(&self, syn: usize) -> usize {
        let s = &self.synopses[syn];
        self.stores.store(s.store).win_len(s.stub)
    }

    pub fn win_oldest(&self, syn: usize) -> Option<(TuplePtr, Timestamp)> {
        let s = &self.synopses[syn];
        self.stores
            .store(s.store)
            .win_oldest(s.stub)
            .map(|(slot, ts)| (TuplePtr { store: s.store, slot }, ts))
    }

    /// Remove the oldest window tuple. The synopsis's reference is dropped
    /// by the caller (ownership of the MINUS element usually takes it).
    pub fn win_delete_oldest(&mut self, syn: usize) -> Option<TuplePtr> {
        let s = &mut self.synopses[syn];
        let slot = self.stores.store_mut(s.store).win_delete_oldest(s.stub)?;
        let n = self.stores.store(s.store).win_len(s.stub);
        s.stats.record(n);
        Some(TuplePtr { store: s.store, slot })
    }

    // ── Lineage synopsis ───────────────────────────────────────────────────

    pub fn lin_insert(&mut self, syn: usize, t: TuplePtr, lineage: LineageKey) {
        let s = &mut self.synopses[syn];
        debug_assert_eq!(s.kind, SynKind::Lineage);
        self.stores.store_mut(s.store).lin_insert(s.stub, t.slot, lineage);
        let n = self.stores.store(s.store).lin_len(s.stub);
        s.stats.record(n);
    }

    /// Look up the tuple produced for a lineage; missing lineage is an
    /// internal error (a MINUS arrived for something never produced).
    pub fn lin_get(&self, syn: usize, lineage: &[TuplePtr]) -> Result<TuplePtr, RilletError> {
        let s = &self.synopses[syn];
        self.stores
            .store(s.store)
            .lin_get(s.stub, lineage)
            .map(|slot| TuplePtr { store: s.store, slot })
            .ok_or_else(|| {
                RilletError::InternalError(format!("synopsis {syn}: no tuple for lineage"))
            })
    }

    pub fn lin_delete(&mut self, syn: usize, t: TuplePtr) -> Result<(), RilletError> {
        let s = &mut self.synopses[syn];
        if !self.stores.store_mut(s.store).lin_delete(s.stub, t.slot) {
            return Err(RilletError::InternalError(format!(
                "synopsis {syn}: lineage delete of absent tuple"
            )));
        }
        let n = self.stores.store(s.store).lin_len(s.stub);
        s.stats.record(n);
        Ok(())
    }

    // ── Partition-window synopsis ──────────────────────────────────────────

    pub fn pwin_insert(&mut self, syn: usize, t: TuplePtr) {
        let s = &mut self.synopses[syn];
        debug_assert_eq!(s.kind, SynKind::PartnWindow);
        debug_assert_eq!(s.store, t.store);
        self.stores.store_mut(s.store).partn_insert(s.stub, t.slot);
        let n = self.stores.store(s.store).partn_total_len(s.stub);
        s.stats.record(n);
    }

    /// Size of the partition selected by `t`'s partition columns.
    pub fn pwin_size(&self, syn: usize, t: TuplePtr) -> usize {
        let s = &self.synopses[syn];
        self.stores.store(s.store).partn_size(s.stub, t.slot)
    }

    pub fn pwin_delete_oldest(&mut self, syn: usize, t: TuplePtr) -> Result<TuplePtr, RilletError> {
        let s = &mut self.synopses[syn];
        let slot = self
            .stores
            .store_mut(s.store)
            .partn_delete_oldest(s.stub, t.slot)
            .ok_or_else(|| {
                RilletError::InternalError(format!("synopsis {syn}: empty partition on delete"))
            })?;
        let n = self.stores.store(s.store).partn_total_len(s.stub);
        s.stats.record(n);
        Ok(TuplePtr { store: s.store, slot })
    }

    // ── Relation synopsis ──────────────────────────────────────────────────

    /// Insert into the live set and every index attached to the synopsis.
    pub fn rel_insert(&mut self, syn: usize, t: TuplePtr) -> Result<(), RilletError> {
        let s = &mut self.synopses[syn];
        debug_assert_eq!(s.kind, SynKind::Relation);
        self.stores.store_mut(s.store).rel_insert(s.stub, t.slot);
        let n = self.stores.store(s.store).rel_len(s.stub);
        s.stats.record(n);
        let indexes = s.indexes.clone();
        for ix in indexes {
            self.indexes[ix].insert(&mut self.stores, &mut self.mem, t)?;
        }
        Ok(())
    }

    pub fn rel_delete(&mut self, syn: usize, t: TuplePtr) -> Result<(), RilletError> {
        let s = &mut self.synopses[syn];
        if !self.stores.store_mut(s.store).rel_delete(s.stub, t.slot) {
            return Err(RilletError::InternalError(format!(
                "synopsis {syn}: relation delete of absent tuple"
            )));
        }
        let n = self.stores.store(s.store).rel_len(s.stub);
        s.stats.record(n);
        let indexes = s.indexes.clone();
        for ix in indexes {
            self.indexes[ix].delete(&self.stores, t);
        }
        Ok(())
    }

    pub fn rel_contains(&self, syn: usize, t: TuplePtr) -> bool {
        let s = &self.synopses[syn];
        s.store == t.store && self.stores.store(s.store).rel_contains(s.stub, t.slot)
    }

    pub fn rel_len(&self, syn: usize) -> usize {
        let s = &self.synopses[syn];
        self.stores.store(s.store).rel_len(s.stub)
    }

    /// Snapshot of the live set; scan order is unspecified.
    pub fn rel_entries(&self, syn: usize) -> Vec<TuplePtr> {
        let s = &self.synopses[syn];
        self.stores
            .store(s.store)
            .rel_entries(s.stub)
            .iter()
            .map(|&slot| TuplePtr { store: s.store, slot })
            .collect()
    }

    // ── Index probes ───────────────────────────────────────────────────────

    pub fn index_probe(&mut self, index: usize, probe: &[(Role, TuplePtr)]) -> Vec<TuplePtr> {
        self.indexes[index].probe(&mut self.stores, probe)
    }

    /// Current cardinality of a synopsis, for the monitor.
    pub fn syn_cardinality(&self, syn: usize) -> usize {
        let s = &self.synopses[syn];
        match s.kind {
            SynKind::Relation => self.stores.store(s.store).rel_len(s.stub),
            SynKind::Window => self.stores.store(s.store).win_len(s.stub),
            SynKind::PartnWindow => self.stores.store(s.store).partn_total_len(s.stub),
            SynKind::Lineage => self.stores.store(s.store).lin_len(s.stub),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::store::StubKind;

    fn rt_with_store(tuple_len: usize) -> (Runtime, u32) {
        let mut rt = Runtime::new(MemoryManager::new(256 * PAGE_SIZE, PAGE_SIZE));
        let store = rt.stores.add_store(tuple_len, PAGE_SIZE);
        (rt, store)
    }

    #[test]
    fn test_window_synopsis_order_and_stats() {
        let (mut rt, store) = rt_with_store(8);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Window);
        let syn = rt.add_synopsis(SynKind::Window, store, stub);

        let a = rt.new_tuple(store).unwrap();
        let b = rt.new_tuple(store).unwrap();
        rt.win_insert(syn, a, 1);
        rt.win_insert(syn, b, 2);
        assert_eq!(rt.win_oldest(syn), Some((a, 1)));
        assert_eq!(rt.win_delete_oldest(syn), Some(a));
        assert_eq!(rt.win_len(syn), 1);
        assert_eq!(rt.synopses[syn].stats.max_tuples, 2);
    }

    #[test]
    fn test_lineage_synopsis_errors_on_absent() {
        let (mut rt, store) = rt_with_store(8);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Lineage);
        let syn = rt.add_synopsis(SynKind::Lineage, store, stub);

        let out = rt.new_tuple(store).unwrap();
        let input = TuplePtr { store: 7, slot: 3 };
        rt.lin_insert(syn, out, vec![input]);
        assert_eq!(rt.lin_get(syn, &[input]).unwrap(), out);
        rt.lin_delete(syn, out).unwrap();
        assert!(rt.lin_get(syn, &[input]).is_err());
        assert!(rt.lin_delete(syn, out).is_err());
    }

    #[test]
    fn test_relation_synopsis_snapshot() {
        let (mut rt, store) = rt_with_store(8);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Relation);
        let syn = rt.add_synopsis(SynKind::Relation, store, stub);

        let a = rt.new_tuple(store).unwrap();
        let b = rt.new_tuple(store).unwrap();
        rt.rel_insert(syn, a).unwrap();
        rt.rel_insert(syn, b).unwrap();
        let mut entries = rt.rel_entries(syn);
        entries.sort();
        assert_eq!(entries, vec![a, b]);
        rt.rel_delete(syn, a).unwrap();
        assert!(!rt.rel_contains(syn, a));
        assert_eq!(rt.syn_cardinality(syn), 1);
    }
}
