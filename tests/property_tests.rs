//! Property-based tests using proptest.
//!
//! Covers the invariants the engine promises on every trace:
//! - tuple layout prefix stability and wire-codec round-trips
//! - queue FIFO order and timestamp monotonicity
//! - row window cardinality (`min(N, plusses - minuses)`)
//! - range window expiry (nothing older than `max_ts - W` survives a run)
//! - hash index consistency against a model map
//! - distinct zero-crossing behavior under balanced PLUS/MINUS noise

use proptest::prelude::*;

use rillet::config::PAGE_SIZE;
use rillet::exec::eval::{BEval, BInstr, Cmp, EvalContext, HEval, HInstr, Operand, Role};
use rillet::exec::index::HashIndex;
use rillet::exec::memory::MemoryManager;
use rillet::exec::queue::{Element, Queue};
use rillet::exec::runtime::Runtime;
use rillet::exec::store::{StorePool, StubKind, TuplePtr};
use rillet::interface::{decode_data, encode_output, wire_data_len};
use rillet::layout::{self, TupleLayout};
use rillet::types::{Attr, AttrType};

// ── Strategies ─────────────────────────────────────────────────────────────

fn arb_attr() -> impl Strategy<Value = Attr> {
    prop_oneof![
        Just(Attr::int()),
        Just(Attr::float()),
        Just(Attr::byte()),
        (1u32..16).prop_map(Attr::char),
    ]
}

fn arb_schema() -> impl Strategy<Value = Vec<Attr>> {
    prop::collection::vec(arb_attr(), 1..8)
}

/// A packed wire data portion matching the schema, with CHAR columns
/// NUL-terminated within their declared length.
fn arb_wire_row(schema: &[Attr]) -> impl Strategy<Value = Vec<u8>> + use<> {
    let mut strategies: Vec<BoxedStrategy<Vec<u8>>> = Vec::new();
    for attr in schema {
        match attr.ty {
            AttrType::Int => {
                strategies.push(any::<i32>().prop_map(|v| v.to_ne_bytes().to_vec()).boxed())
            }
            AttrType::Float => strategies.push(
                prop::num::f32::NORMAL
                    .prop_map(|v| v.to_ne_bytes().to_vec())
                    .boxed(),
            ),
            AttrType::Byte => strategies.push(any::<u8>().prop_map(|v| vec![v]).boxed()),
            AttrType::Char => {
                let len = attr.len as usize;
                strategies.push(
                    prop::collection::vec(1u8..=127, 0..len)
                        .prop_map(move |mut s| {
                            s.resize(len, 0);
                            s
                        })
                        .boxed(),
                );
            }
        }
    }
    strategies.prop_map(|cols| cols.concat())
}

// ── Layout properties ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_layout_prefix_stability(schema in arb_schema(), extra in prop::collection::vec(arb_attr(), 0..4)) {
        let l1 = TupleLayout::for_schema(&schema);
        let extended: Vec<Attr> = schema.iter().chain(&extra).copied().collect();
        let l2 = TupleLayout::for_schema(&extended);
        for pos in 0..schema.len() {
            prop_assert_eq!(l1.column(pos), l2.column(pos));
        }
    }

    #[test]
    fn prop_layout_len_aligned(schema in arb_schema()) {
        let l = TupleLayout::for_schema(&schema);
        prop_assert_eq!(l.tuple_len() % layout::TUPLE_ALIGN, 0);
        // Alignment only ever adds padding.
        prop_assert!(l.tuple_len() as usize >= wire_data_len(&schema));
    }

    /// decode(encode(row)) == row for every schema-conforming row.
    #[test]
    fn prop_wire_roundtrip((schema, wire) in arb_schema().prop_flat_map(|s| {
        let rows = arb_wire_row(&s);
        (Just(s), rows)
    })) {
        let tl = TupleLayout::for_schema(&schema);
        let mut tuple = vec![0u8; tl.tuple_len() as usize];
        decode_data(&schema, &tl, &wire, &mut tuple).unwrap();
        let mut out = Vec::new();
        encode_output(&schema, &tl, &tuple, 42, b'+', &mut out);
        prop_assert_eq!(&out[..4], &42u32.to_ne_bytes());
        prop_assert_eq!(out[4], b'+');
        prop_assert_eq!(&out[5..], &wire[..]);
    }
}

// ── Queue properties ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_queue_fifo_and_monotonic(deltas in prop::collection::vec(0u32..5, 1..40)) {
        let mut q = Queue::new(0, 64);
        let mut ts = 0;
        let mut accepted = Vec::new();
        for d in deltas {
            ts += d;
            if q.enqueue(Element::Heartbeat { ts }) {
                accepted.push(ts);
            }
        }
        let mut last = 0;
        let mut drained = Vec::new();
        while let Some(e) = q.dequeue() {
            prop_assert!(e.timestamp() >= last);
            last = e.timestamp();
            drained.push(e.timestamp());
        }
        prop_assert_eq!(drained, accepted);
    }
}

// ── Window properties ──────────────────────────────────────────────────────

proptest! {
    /// Invariant: a row window of size N holds min(N, seen) tuples.
    #[test]
    fn prop_row_window_cardinality(n in 1usize..6, count in 0usize..40) {
        use rillet::exec::ops::{Operator, RowWindow};
        use rillet::exec::synopsis::SynKind;

        let mut rt = Runtime::new(MemoryManager::new(512 * PAGE_SIZE, PAGE_SIZE));
        let store = rt.stores.add_store(8, PAGE_SIZE);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Window);
        let syn = rt.add_synopsis(SynKind::Window, store, stub);
        let input = rt.add_queue(64.max(count + 1));
        let output = rt.add_queue(2 * count + 2);
        let mut op = Operator::RowWindow(RowWindow::new(0, input, output, n, syn));

        for ts in 0..count {
            let t = rt.new_tuple(store).unwrap();
            rt.queues[input].enqueue(Element::Plus { tuple: t, ts: ts as u32 });
        }
        op.run(&mut rt, (count + 1) as u32).unwrap();
        prop_assert_eq!(rt.win_len(syn), count.min(n));
    }

    /// Invariant: after a run, no tuple older than max_ts - W remains in
    /// a sliding range window.
    #[test]
    fn prop_range_window_expiry(w in 0u32..6, deltas in prop::collection::vec(0u32..4, 1..30)) {
        use rillet::exec::ops::{Operator, RangeWindow};
        use rillet::exec::ops::range_win::RangeMode;
        use rillet::exec::synopsis::SynKind;

        let mut rt = Runtime::new(MemoryManager::new(512 * PAGE_SIZE, PAGE_SIZE));
        let store = rt.stores.add_store(8, PAGE_SIZE);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Window);
        let syn = rt.add_synopsis(SynKind::Window, store, stub);
        let input = rt.add_queue(64);
        let output = rt.add_queue(256);
        let mut op = Operator::RangeWindow(RangeWindow::new(
            0, input, output, RangeMode::Sliding { size: w }, Some(syn),
        ));

        let mut ts = 0;
        for d in &deltas {
            ts += d;
            let t = rt.new_tuple(store).unwrap();
            rt.queues[input].enqueue(Element::Plus { tuple: t, ts });
        }
        op.run(&mut rt, deltas.len() as u32 + 1).unwrap();

        let max_ts = ts;
        if let Some((_, oldest_ts)) = rt.win_oldest(syn) {
            prop_assert!(
                oldest_ts as u64 + w as u64 >= max_ts as u64,
                "tuple from {} survived at {} with W={}", oldest_ts, max_ts, w
            );
        }
    }
}

// ── Hash index vs. model ───────────────────────────────────────────────────

fn int_key_index(mm: &mut MemoryManager) -> HashIndex {
    let mut update = HEval::new();
    update.push(HInstr { role: Role::Update, col: 0, ty: AttrType::Int, len: 0 });
    let mut scan = HEval::new();
    scan.push(HInstr { role: Role::Input, col: 0, ty: AttrType::Int, len: 0 });
    let mut eq = BEval::new();
    eq.push(BInstr {
        cmp: Cmp::IntEq,
        left: Operand::new(Role::Input, 0),
        right: Operand::new(Role::Update, 0),
        char_len: 0,
        left_prep: None,
        right_prep: None,
    });
    HashIndex::new(0, 0.6, mm, update, scan, eq).unwrap()
}

proptest! {
    /// Insert/delete against a model multimap; probes agree throughout.
    #[test]
    fn prop_index_matches_model(ops in prop::collection::vec((0i32..12, any::<bool>()), 1..120)) {
        use std::collections::HashMap;

        let mut pool = StorePool::new();
        // Small pages force early directory doublings.
        let mut mm = MemoryManager::new(4096 * 64, 64);
        let store = pool.add_store(8, 64);
        let mut index = int_key_index(&mut mm);
        let mut model: HashMap<i32, Vec<TuplePtr>> = HashMap::new();

        for (key, insert) in ops {
            if insert || model.get(&key).is_none_or(|v| v.is_empty()) {
                let t = pool.new_tuple(store, &mut mm).unwrap();
                layout::set_icol(pool.tuple_mut(t), 0, key);
                index.insert(&mut pool, &mut mm, t).unwrap();
                model.entry(key).or_default().push(t);
            } else {
                let t = model.get_mut(&key).unwrap().pop().unwrap();
                index.delete(&pool, t);
            }

            let probe = pool.new_tuple(store, &mut mm).unwrap();
            layout::set_icol(pool.tuple_mut(probe), 0, key);
            let mut got = index.probe(&mut pool, &[(Role::Input, probe)]);
            got.sort();
            let mut want = model.get(&key).cloned().unwrap_or_default();
            want.sort();
            prop_assert_eq!(got, want);
            pool.decr_ref(probe);
        }
    }
}

// ── Distinct zero crossings ────────────────────────────────────────────────

proptest! {
    /// For any interleaving where MINUS never outruns PLUS, distinct
    /// emits strictly alternating PLUS/MINUS per value.
    #[test]
    fn prop_distinct_alternates(script in prop::collection::vec(any::<bool>(), 1..60)) {
        use rillet::exec::eval::{AEval, AInstr};
        use rillet::exec::ops::{Distinct, Operator};
        use rillet::exec::synopsis::SynKind;

        let mut rt = Runtime::new(MemoryManager::new(1024 * PAGE_SIZE, PAGE_SIZE));
        let in_store = rt.stores.add_store(4, PAGE_SIZE);
        let out_store = rt.stores.add_store(8, PAGE_SIZE);
        let stub = rt.stores.store_mut(out_store).add_stub(StubKind::Relation);
        let syn = rt.add_synopsis(SynKind::Relation, out_store, stub);
        let idx_val = int_key_index(&mut rt.mem);
        let index = rt.add_index(idx_val);
        rt.synopses[syn].indexes.push(index);
        let input = rt.add_queue(256);
        let output = rt.add_queue(256);

        let mut copy = AEval::new();
        copy.push(AInstr::IntCpy(Operand::new(Role::Input, 0), Operand::new(Role::Output, 0)));
        let mut op = Operator::Distinct(Distinct::new(
            0, input, output, syn, index, out_store, copy, 1, EvalContext::new(),
        ));

        // Interpret the script over a single value: true = PLUS, false =
        // MINUS (only when the multiset is non-empty).
        let mut live = 0u32;
        let mut ts = 0;
        for plus in script {
            ts += 1;
            if plus {
                live += 1;
                let t = rt.new_tuple(in_store).unwrap();
                layout::set_icol(rt.stores.tuple_mut(t), 0, 1);
                rt.queues[input].enqueue(Element::Plus { tuple: t, ts });
            } else if live > 0 {
                live -= 1;
                let t = rt.new_tuple(in_store).unwrap();
                layout::set_icol(rt.stores.tuple_mut(t), 0, 1);
                rt.queues[input].enqueue(Element::Minus { tuple: t, ts });
            }
        }
        op.run(&mut rt, 256).unwrap();

        let mut expect_plus = true;
        while let Some(e) = rt.queues[output].dequeue() {
            match e {
                Element::Plus { .. } => {
                    prop_assert!(expect_plus, "two PLUSes without a MINUS between");
                    expect_plus = false;
                }
                Element::Minus { .. } => {
                    prop_assert!(!expect_plus, "MINUS before any PLUS");
                    expect_plus = true;
                }
                Element::Heartbeat { .. } => {}
            }
        }
    }
}
