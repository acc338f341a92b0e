//! Linear-hashing index over a relation synopsis.
//!
//! Buckets are unordered chains of tuple references. The bucket directory
//! grows by doubling: when the fraction of non-empty buckets exceeds the
//! configured threshold, one more hash bit is used and every existing
//! bucket splits in two, entries rehashed by the new bit only. Directory
//! growth is charged against the memory manager in page-size steps.
//!
//! Three evaluator programs drive the index:
//! - *update hash* — hash of the stored tuple (bound to the UPDATE role),
//!   used by insert/delete;
//! - *scan hash* — hash of the probe context (whatever roles the probing
//!   operator binds), used to select the bucket;
//! - *key equality* — boolean program comparing the stored tuple against
//!   the probe context, used to filter the bucket chain.
//!
//! Within a chain, scan order is insertion order; across chains it is
//! unspecified.

use crate::error::RilletError;
use crate::exec::eval::{BEval, EvalContext, HEval, Role};
use crate::exec::memory::MemoryManager;
use crate::exec::store::{StorePool, TuplePtr};

const PTR_SIZE: usize = std::mem::size_of::<usize>();

#[derive(Debug)]
pub struct HashIndex {
    id: usize,
    threshold: f64,
    num_bits: u32,
    buckets: Vec<Vec<TuplePtr>>,
    num_non_empty: usize,
    num_entries: usize,
    pages_charged: usize,
    page_size: usize,

    ctx: EvalContext,
    update_hash: HEval,
    scan_hash: HEval,
    key_equal: BEval,
}

impl HashIndex {
    /// Create an index with its initial single directory layer:
    /// `2^floor(log2(page_size / ptr_size))` buckets.
    pub fn new(
        id: usize,
        threshold: f64,
        mm: &mut MemoryManager,
        update_hash: HEval,
        scan_hash: HEval,
        key_equal: BEval,
    ) -> Result<Self, RilletError> {
        debug_assert!(threshold > 0.0 && threshold < 1.0);
        let page_size = mm.page_size();
        // Bits per directory layer: floor(log2(page_size / pointer size)).
        let num_bits = (page_size / PTR_SIZE).max(2).ilog2();
        let num_buckets = 1usize << num_bits;
        let pages = Self::pages_for(num_buckets, page_size);
        mm.charge_pages(pages)?;
        Ok(Self {
            id,
            threshold,
            num_bits,
            buckets: vec![Vec::new(); num_buckets],
            num_non_empty: 0,
            num_entries: 0,
            pages_charged: pages,
            page_size,
            ctx: EvalContext::new(),
            update_hash,
            scan_hash,
            key_equal,
        })
    }

    fn pages_for(num_buckets: usize, page_size: usize) -> usize {
        (num_buckets * PTR_SIZE).div_ceil(page_size)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_non_empty_buckets(&self) -> usize {
        self.num_non_empty
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash & ((1u64 << self.num_bits) - 1)) as usize
    }

    /// Insert a stored tuple. May trigger a directory doubling.
    pub fn insert(
        &mut self,
        stores: &mut StorePool,
        mm: &mut MemoryManager,
        tuple: TuplePtr,
    ) -> Result<(), RilletError> {
        self.ctx.bind(Role::Update, tuple);
        let hash = self.update_hash.eval(&self.ctx, stores);
        let b = self.bucket_of(hash);
        if self.buckets[b].is_empty() {
            self.num_non_empty += 1;
        }
        self.buckets[b].push(tuple);
        self.num_entries += 1;

        if self.num_non_empty as f64 / self.buckets.len() as f64 > self.threshold {
            self.double_buckets(stores, mm)?;
        }
        Ok(())
    }

    /// Delete a stored tuple by reference.
    pub fn delete(&mut self, stores: &StorePool, tuple: TuplePtr) {
        self.ctx.bind(Role::Update, tuple);
        let hash = self.update_hash.eval(&self.ctx, stores);
        let b = self.bucket_of(hash);
        if let Some(i) = self.buckets[b].iter().position(|&p| p == tuple) {
            self.buckets[b].remove(i);
            self.num_entries -= 1;
            if self.buckets[b].is_empty() {
                self.num_non_empty -= 1;
            }
        } else {
            debug_assert!(false, "index {}: delete of absent tuple", self.id);
        }
    }

    /// Probe: bind the given roles, hash with the scan program, and return
    /// the chain entries surviving the key-equality filter.
    ///
    /// The result is materialized so the caller may mutate the index (or
    /// the synopsis behind it) while walking the matches.
    pub fn probe(&mut self, stores: &mut StorePool, probe: &[(Role, TuplePtr)]) -> Vec<TuplePtr> {
        for &(role, tuple) in probe {
            self.ctx.bind(role, tuple);
        }
        let hash = self.scan_hash.eval(&self.ctx, stores);
        let b = self.bucket_of(hash);
        let mut out = Vec::new();
        // Walk a snapshot of the chain so the equality program may rebind
        // UPDATE freely.
        let chain: Vec<TuplePtr> = self.buckets[b].clone();
        for cand in chain {
            self.ctx.bind(Role::Update, cand);
            if self.key_equal.eval(&mut self.ctx, stores) {
                out.push(cand);
            }
        }
        out
    }

    fn double_buckets(
        &mut self,
        stores: &StorePool,
        mm: &mut MemoryManager,
    ) -> Result<(), RilletError> {
        let old_n = self.buckets.len();
        let new_pages = Self::pages_for(old_n * 2, self.page_size);
        if new_pages > self.pages_charged {
            mm.charge_pages(new_pages - self.pages_charged)?;
            self.pages_charged = new_pages;
        }

        self.buckets.resize(old_n * 2, Vec::new());
        let split_bit = 1u64 << self.num_bits;
        self.num_bits += 1;

        self.num_non_empty = 0;
        for b in 0..old_n {
            let chain = std::mem::take(&mut self.buckets[b]);
            let mut low = Vec::new();
            let mut high = Vec::new();
            for tuple in chain {
                self.ctx.bind(Role::Update, tuple);
                let hash = self.update_hash.eval(&self.ctx, stores);
                if hash & split_bit == 0 {
                    low.push(tuple);
                } else {
                    high.push(tuple);
                }
            }
            if !low.is_empty() {
                self.num_non_empty += 1;
            }
            if !high.is_empty() {
                self.num_non_empty += 1;
            }
            self.buckets[b] = low;
            self.buckets[b + old_n] = high;
        }
        tracing::debug!(
            index = self.id,
            buckets = self.buckets.len(),
            "hash index doubled"
        );
        Ok(())
    }
}
