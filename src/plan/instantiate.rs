//! Plan instantiation: physical plan → runtime entities.
//!
//! Walks the validated plan in topological order. For each node it
//! allocates the shared entities (store, queue, stubs, synopses, hash
//! indexes), compiles the node's expressions into evaluator programs, and
//! appends the operator; cross-references are dense indices into the
//! engine's runtime arena. Consumers attach their synopsis stubs to the
//! *producer's* store, which is why instantiation follows producer order.
//!
//! Expression compilation mirrors the evaluator model: attribute
//! references address input roles, literals go to the constant tuple,
//! intermediate arithmetic lands in the scratch tuple. Both tuples are
//! provisioned per operator and installed in its evaluation context.

use crate::catalog::TableCatalog;
use crate::config::ServerParams;
use crate::error::RilletError;
use crate::exec::engine::Engine;
use crate::exec::eval::{
    AEval, AInstr, BEval, BInstr, Cmp, EvalContext, HEval, HInstr, Operand, Role,
};
use crate::exec::index::HashIndex;
use crate::exec::monitor::{OpMonitor, SYS_STREAM_NAME};
use crate::exec::ops::{
    Distinct, Dstream, Except, GroupAggr, Istream, Join, Operator, OutputOp, PartnWindow, Project,
    RangeWindow, RelnSource, Rstream, RowWindow, Select, Sink, StreamJoin, StreamSource,
    SysStreamGen, Union,
};
use crate::exec::ops::group_aggr::AggrSpec;
use crate::exec::ops::range_win::RangeMode;
use crate::exec::store::{PartitionSpec, StubKind};
use crate::exec::synopsis::SynKind;
use crate::interface::QueryOutput;
use crate::layout::{ConstTupleLayout, TupleLayout};
use crate::plan::graph::{self, resolve_attr};
use crate::plan::{AttrRef, BoolExpr, PlanNode, PlanOpKind, QueryPlan, ScalarExpr};
use crate::types::{AggrFn, ArithOp, Attr, AttrType, CompOp};

/// What instantiation reports back for a registered query.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub schema: Vec<Attr>,
    pub output_op: usize,
}

/// Per-node products other nodes link against.
#[derive(Debug, Clone)]
struct NodeOut {
    store: u32,
    queue: usize,
    layout: TupleLayout,
}

/// Instantiate one query plan into the engine, wiring its root to the
/// given output.
pub fn instantiate_query(
    engine: &mut Engine,
    params: &ServerParams,
    catalog: &mut TableCatalog,
    plan: &QueryPlan,
    mut output: Box<dyn QueryOutput>,
) -> Result<QueryInfo, RilletError> {
    let order = graph::validate(plan)?;

    let mut inst = Instantiator {
        engine,
        params,
        catalog,
        plan,
        outs: vec![None; plan.nodes.len()],
    };
    for idx in order {
        let out = inst.build_node(idx)?;
        inst.outs[idx] = Some(out);
    }

    // Wire the root to the external output.
    let schema = plan.nodes[plan.root].schema.clone();
    output.set_num_attrs(schema.len())?;
    for (pos, attr) in schema.iter().enumerate() {
        output.set_attr_info(pos, attr.ty, attr.len)?;
    }
    output.start()?;

    let root_queue = inst.outs[plan.root].as_ref().map(|o| o.queue).ok_or_else(|| {
        RilletError::InternalError("plan root was not instantiated".into())
    })?;
    let output_op = inst.add_op(|id| Operator::Output(OutputOp::new(id, root_queue, schema.clone(), output)), false);

    Ok(QueryInfo { schema, output_op })
}

/// Attach a sink to a queue. Used for branches that lose their consumer
/// (e.g. a failed registration's partial plan is never the case — this
/// exists for embedders driving the engine directly).
pub fn attach_sink(engine: &mut Engine, queue: usize) -> usize {
    let id = engine.ops.len();
    engine.rt.op_monitors.push(OpMonitor::default());
    engine.ops.push(Operator::Sink(Sink::new(id, queue)));
    id
}

struct Instantiator<'a> {
    engine: &'a mut Engine,
    params: &'a ServerParams,
    catalog: &'a mut TableCatalog,
    plan: &'a QueryPlan,
    outs: Vec<Option<NodeOut>>,
}

impl<'a> Instantiator<'a> {
    fn add_op(&mut self, make: impl FnOnce(usize) -> Operator, is_join: bool) -> usize {
        let id = self.engine.ops.len();
        self.engine
            .rt
            .op_monitors
            .push(OpMonitor { is_join, ..OpMonitor::default() });
        let op = make(id);
        self.engine.ops.push(op);
        id
    }

    fn node(&self, idx: usize) -> &PlanNode {
        &self.plan.nodes[idx]
    }

    fn input_out(&self, node: &PlanNode, i: usize) -> &NodeOut {
        self.outs[node.inputs[i]]
            .as_ref()
            .expect("inputs instantiated before consumers")
    }

    fn new_queue(&mut self) -> usize {
        self.engine.rt.add_queue(self.params.queue_capacity())
    }

    /// (column, type, declared length) of an attribute reference.
    fn attr_col(&self, node: &PlanNode, a: AttrRef) -> Result<(u32, AttrType, u32), RilletError> {
        let attr = resolve_attr(self.plan, node, a)?;
        let layout = &self.input_out(node, a.input).layout;
        Ok((layout.column(a.pos), attr.ty, attr.len))
    }

    /// Build a key index over stored tuples (UPDATE role) probed through
    /// `probe_role`. `pairs` lists (probe column, update column) per key
    /// attribute.
    fn build_key_index(
        &mut self,
        probe_role: Role,
        pairs: &[((u32, AttrType, u32), (u32, AttrType, u32))],
    ) -> Result<usize, RilletError> {
        let mut update_hash = HEval::new();
        let mut scan_hash = HEval::new();
        let mut key_equal = BEval::new();
        for &((pcol, pty, plen), (ucol, uty, ulen)) in pairs {
            debug_assert_eq!(pty, uty);
            scan_hash.push(HInstr { role: probe_role, col: pcol, ty: pty, len: plen });
            update_hash.push(HInstr { role: Role::Update, col: ucol, ty: uty, len: ulen });
            key_equal.push(BInstr {
                cmp: eq_cmp(pty),
                left: Operand::new(probe_role, pcol),
                right: Operand::new(Role::Update, ucol),
                char_len: plen.max(ulen),
                left_prep: None,
                right_prep: None,
            });
        }
        let id = self.engine.rt.indexes.len();
        let index = HashIndex::new(
            id,
            self.params.index_threshold,
            &mut self.engine.rt.mem,
            update_hash,
            scan_hash,
            key_equal,
        )?;
        Ok(self.engine.rt.add_index(index))
    }

    /// A relation synopsis (plus optional key index) on a producer store.
    fn relation_synopsis(
        &mut self,
        store: u32,
        index: Option<usize>,
    ) -> usize {
        let stub = self.engine.rt.stores.store_mut(store).add_stub(StubKind::Relation);
        let syn = self.engine.rt.add_synopsis(SynKind::Relation, store, stub);
        if let Some(ix) = index {
            self.engine.rt.synopses[syn].indexes.push(ix);
        }
        syn
    }

    /// Identity columns of a schema under its layout.
    fn schema_cols(schema: &[Attr], layout: &TupleLayout) -> Vec<(u32, AttrType, u32)> {
        schema
            .iter()
            .enumerate()
            .map(|(pos, a)| (layout.column(pos), a.ty, a.len))
            .collect()
    }

    /// A program copying every schema column from `src_role` to
    /// `dst_role`, assuming identical layouts on both sides.
    fn whole_row_copy(schema: &[Attr], layout: &TupleLayout, src_role: Role, dst_role: Role) -> AEval {
        let mut eval = AEval::new();
        for (pos, attr) in schema.iter().enumerate() {
            let col = layout.column(pos);
            push_copy(&mut eval, attr, Operand::new(src_role, col), Operand::new(dst_role, col));
        }
        eval
    }

    // ── Node builders ──────────────────────────────────────────────────────

    fn build_node(&mut self, idx: usize) -> Result<NodeOut, RilletError> {
        // Clone the node description: builders borrow the instantiator
        // mutably while reading it.
        let node = self.node(idx).clone();
        match &node.kind {
            PlanOpKind::StreamSource { table } => self.build_stream_source(&node, table),
            PlanOpKind::RelnSource { table } => self.build_reln_source(&node, table),
            PlanOpKind::Select { pred } => self.build_select(&node, pred),
            PlanOpKind::Project { exprs } => self.build_project(&node, exprs),
            PlanOpKind::RowWin { rows } => self.build_row_win(&node, *rows),
            PlanOpKind::RangeWin { size, stride } => self.build_range_win(&node, *size, *stride),
            PlanOpKind::UnboundedWin => self.build_unbounded_win(&node),
            PlanOpKind::PartnWin { attrs, rows } => self.build_partn_win(&node, attrs, *rows),
            PlanOpKind::Join { pred } => self.build_join(&node, pred, None),
            PlanOpKind::JoinProject { pred, exprs } => self.build_join(&node, pred, Some(exprs)),
            PlanOpKind::StreamJoin { pred } => self.build_stream_join(&node, pred, None),
            PlanOpKind::StreamJoinProject { pred, exprs } => {
                self.build_stream_join(&node, pred, Some(exprs))
            }
            PlanOpKind::GroupAggr { group, aggrs } => self.build_group_aggr(&node, group, aggrs),
            PlanOpKind::Distinct => self.build_distinct(&node),
            PlanOpKind::Istream => self.build_xstream(&node, Xstream::I),
            PlanOpKind::Dstream => self.build_xstream(&node, Xstream::D),
            PlanOpKind::Rstream => self.build_xstream(&node, Xstream::R),
            PlanOpKind::Union => self.build_union(&node),
            PlanOpKind::Except => self.build_except(&node),
        }
    }

    fn build_stream_source(&mut self, node: &PlanNode, table: &str) -> Result<NodeOut, RilletError> {
        let layout = TupleLayout::for_schema(&node.schema);
        let entry = self.catalog.lookup(table)?;
        if !entry.is_stream {
            return Err(RilletError::SchemaMismatch(format!(
                "table {table} is a relation, not a stream"
            )));
        }
        if entry.schema != node.schema {
            return Err(RilletError::SchemaMismatch(format!(
                "plan schema for {table} differs from its registration"
            )));
        }

        let store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        if table == SYS_STREAM_NAME {
            // Monitor tap: a dedicated output of the system-stream
            // generator, no operator of its own.
            let queue = self
                .engine
                .rt
                .add_queue(self.params.shared_queue_capacity());
            let ss = self
                .engine
                .ops
                .iter_mut()
                .find_map(|op| match op {
                    Operator::SysStreamGen(g) => Some(g),
                    _ => None,
                })
                .ok_or_else(|| {
                    RilletError::InternalError("system-stream generator not instantiated".into())
                })?;
            ss.add_output(queue, store);
            return Ok(NodeOut { store, queue, layout });
        }

        let src = self.catalog.take_source(table)?;
        let queue = self.new_queue();
        let schema = node.schema.clone();
        self.add_op(
            |id| Operator::StreamSource(StreamSource::new(id, queue, store, schema, src)),
            false,
        );
        Ok(NodeOut { store, queue, layout })
    }

    fn build_reln_source(&mut self, node: &PlanNode, table: &str) -> Result<NodeOut, RilletError> {
        let layout = TupleLayout::for_schema(&node.schema);
        let entry = self.catalog.lookup(table)?;
        if entry.is_stream {
            return Err(RilletError::SchemaMismatch(format!(
                "table {table} is a stream, not a relation"
            )));
        }
        if entry.schema != node.schema {
            return Err(RilletError::SchemaMismatch(format!(
                "plan schema for {table} differs from its registration"
            )));
        }

        let store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());
        let cols = Self::schema_cols(&node.schema, &layout);
        let pairs: Vec<_> = cols.iter().map(|&c| (c, c)).collect();
        let index = self.build_key_index(Role::Input, &pairs)?;
        let syn = self.relation_synopsis(store, Some(index));

        let src = self.catalog.take_source(table)?;
        let queue = self.new_queue();
        let schema = node.schema.clone();
        self.add_op(
            |id| Operator::RelnSource(RelnSource::new(id, queue, store, syn, index, schema, src)),
            false,
        );
        Ok(NodeOut { store, queue, layout })
    }

    fn build_select(&mut self, node: &PlanNode, pred: &[BoolExpr]) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let queue = self.new_queue();

        let mut cx = ExprCompiler::new(self.plan, node, vec![(&input.layout, Role::Input)]);
        let beval = cx.compile_pred(pred)?;
        let ctx = cx.finish();

        self.add_op(
            |id| Operator::Select(Select::new(id, input.queue, queue, beval, ctx)),
            false,
        );
        // Selection reuses its input's tuples.
        Ok(NodeOut { store: input.store, queue, layout: input.layout })
    }

    fn build_project(&mut self, node: &PlanNode, exprs: &[ScalarExpr]) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let layout = TupleLayout::for_schema(&node.schema);
        let store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let out_syn = if node.is_stream {
            None
        } else {
            let stub = self.engine.rt.stores.store_mut(store).add_stub(StubKind::Lineage);
            Some(self.engine.rt.add_synopsis(SynKind::Lineage, store, stub))
        };

        let mut cx = ExprCompiler::new(self.plan, node, vec![(&input.layout, Role::Input)]);
        let proj = cx.compile_projection(exprs, &node.schema, &layout)?;
        let ctx = cx.finish();

        let queue = self.new_queue();
        self.add_op(
            |id| Operator::Project(Project::new(id, input.queue, queue, store, out_syn, proj, ctx)),
            false,
        );
        Ok(NodeOut { store, queue, layout })
    }

    fn build_row_win(&mut self, node: &PlanNode, rows: u32) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let stub = self
            .engine
            .rt
            .stores
            .store_mut(input.store)
            .add_stub(StubKind::Window);
        let syn = self.engine.rt.add_synopsis(SynKind::Window, input.store, stub);
        let queue = self.new_queue();
        self.add_op(
            |id| Operator::RowWindow(RowWindow::new(id, input.queue, queue, rows as usize, syn)),
            false,
        );
        Ok(NodeOut { store: input.store, queue, layout: input.layout })
    }

    fn build_range_win(&mut self, node: &PlanNode, size: u32, stride: u32) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let stub = self
            .engine
            .rt
            .stores
            .store_mut(input.store)
            .add_stub(StubKind::Window);
        let syn = self.engine.rt.add_synopsis(SynKind::Window, input.store, stub);
        let mode = if stride == 0 {
            RangeMode::Sliding { size }
        } else {
            RangeMode::Tumbling { size, stride, window_start: 0 }
        };
        let queue = self.new_queue();
        self.add_op(
            |id| Operator::RangeWindow(RangeWindow::new(id, input.queue, queue, mode, Some(syn))),
            false,
        );
        Ok(NodeOut { store: input.store, queue, layout: input.layout })
    }

    fn build_unbounded_win(&mut self, node: &PlanNode) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let queue = self.new_queue();
        self.add_op(
            |id| Operator::RangeWindow(RangeWindow::new(id, input.queue, queue, RangeMode::Unbounded, None)),
            false,
        );
        Ok(NodeOut { store: input.store, queue, layout: input.layout })
    }

    fn build_partn_win(&mut self, node: &PlanNode, attrs: &[AttrRef], rows: u32) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let layout = TupleLayout::for_schema(&node.schema);
        let store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        // Partition identity: the byte ranges of the declared columns.
        let mut ranges = Vec::with_capacity(attrs.len());
        for a in attrs {
            let (col, ty, len) = self.attr_col(node, *a)?;
            let byte = match ty {
                AttrType::Int | AttrType::Float => (col * 4) as usize,
                AttrType::Byte | AttrType::Char => col as usize,
            };
            ranges.push((byte, ty.size(len) as usize));
        }
        self.engine
            .rt
            .stores
            .store_mut(store)
            .set_partition_spec(PartitionSpec { ranges });
        let stub = self.engine.rt.stores.store_mut(store).add_stub(StubKind::Partition);
        let syn = self.engine.rt.add_synopsis(SynKind::PartnWindow, store, stub);

        let copy_eval = Self::whole_row_copy(&node.schema, &layout, Role::Input, Role::Copy);
        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::PartnWindow(PartnWindow::new(
                    id,
                    input.queue,
                    queue,
                    rows as usize,
                    syn,
                    store,
                    copy_eval,
                    EvalContext::new(),
                ))
            },
            false,
        );
        Ok(NodeOut { store, queue, layout })
    }

    /// Equality comparisons between pure attribute references of the two
    /// inputs; these become the index keys.
    fn join_key_pairs(pred: &[BoolExpr]) -> Vec<(AttrRef, AttrRef)> {
        let mut pairs = Vec::new();
        for b in pred {
            if b.op != CompOp::Eq {
                continue;
            }
            if let (ScalarExpr::Attr(x), ScalarExpr::Attr(y)) = (&b.left, &b.right) {
                match (x.input, y.input) {
                    (0, 1) => pairs.push((*x, *y)),
                    (1, 0) => pairs.push((*y, *x)),
                    _ => {}
                }
            }
        }
        pairs
    }

    fn build_join(
        &mut self,
        node: &PlanNode,
        pred: &[BoolExpr],
        fused: Option<&Vec<ScalarExpr>>,
    ) -> Result<NodeOut, RilletError> {
        let left = self.input_out(node, 0).clone();
        let right = self.input_out(node, 1).clone();
        let layout = TupleLayout::for_schema(&node.schema);
        let out_store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let key_pairs = Self::join_key_pairs(pred);
        let mut left_pairs = Vec::new(); // probe by RIGHT, stored LEFT
        let mut right_pairs = Vec::new(); // probe by LEFT, stored RIGHT
        for (l, r) in &key_pairs {
            let lc = self.attr_col(node, *l)?;
            let rc = self.attr_col(node, *r)?;
            left_pairs.push((rc, lc));
            right_pairs.push((lc, rc));
        }
        let left_index = self.build_key_index(Role::Right, &left_pairs)?;
        let right_index = self.build_key_index(Role::Left, &right_pairs)?;
        let left_syn = self.relation_synopsis(left.store, Some(left_index));
        let right_syn = self.relation_synopsis(right.store, Some(right_index));

        let out_stub = self.engine.rt.stores.store_mut(out_store).add_stub(StubKind::Lineage);
        let out_syn = self.engine.rt.add_synopsis(SynKind::Lineage, out_store, out_stub);

        let mut cx = ExprCompiler::new(
            self.plan,
            node,
            vec![(&left.layout, Role::Left), (&right.layout, Role::Right)],
        );
        let beval = cx.compile_pred(pred)?;
        let out_eval = match fused {
            Some(exprs) => cx.compile_projection(exprs, &node.schema, &layout)?,
            None => concat_copy(self.plan, node, &left.layout, &right.layout, &layout),
        };
        let ctx = cx.finish();

        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::Join(Join::new(
                    id, left.queue, right.queue, queue, left_syn, right_syn, left_index,
                    right_index, out_syn, out_store, out_eval, beval, ctx,
                ))
            },
            true,
        );
        Ok(NodeOut { store: out_store, queue, layout })
    }

    fn build_stream_join(
        &mut self,
        node: &PlanNode,
        pred: &[BoolExpr],
        fused: Option<&Vec<ScalarExpr>>,
    ) -> Result<NodeOut, RilletError> {
        let left = self.input_out(node, 0).clone();
        let right = self.input_out(node, 1).clone();
        let layout = TupleLayout::for_schema(&node.schema);
        let out_store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let key_pairs = Self::join_key_pairs(pred);
        let mut inner_pairs = Vec::new(); // probe by LEFT stream tuples
        for (l, r) in &key_pairs {
            let lc = self.attr_col(node, *l)?;
            let rc = self.attr_col(node, *r)?;
            inner_pairs.push((lc, rc));
        }
        let inner_index = self.build_key_index(Role::Left, &inner_pairs)?;
        let inner_syn = self.relation_synopsis(right.store, Some(inner_index));

        let mut cx = ExprCompiler::new(
            self.plan,
            node,
            vec![(&left.layout, Role::Left), (&right.layout, Role::Right)],
        );
        let beval = cx.compile_pred(pred)?;
        let out_eval = match fused {
            Some(exprs) => cx.compile_projection(exprs, &node.schema, &layout)?,
            None => concat_copy(self.plan, node, &left.layout, &right.layout, &layout),
        };
        let ctx = cx.finish();

        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::StreamJoin(StreamJoin::new(
                    id, left.queue, right.queue, queue, inner_syn, inner_index, out_store,
                    out_eval, beval, ctx,
                ))
            },
            true,
        );
        Ok(NodeOut { store: out_store, queue, layout })
    }

    fn build_group_aggr(
        &mut self,
        node: &PlanNode,
        group: &[AttrRef],
        aggrs: &[crate::plan::AggrExpr],
    ) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();

        // Group-row layout: declared schema, then the hidden count and the
        // hidden AVG sums.
        let mut full_layout = TupleLayout::for_schema(&node.schema);
        let count_col = full_layout.add_attr(Attr::int())?;
        let mut specs = Vec::with_capacity(aggrs.len());
        for (i, a) in aggrs.iter().enumerate() {
            let (in_col, in_ty, _) = self.attr_col(node, a.attr)?;
            let out_col = full_layout.column(group.len() + i);
            let sum_col = if a.func == AggrFn::Avg {
                Some(full_layout.add_attr(Attr { ty: in_ty, len: in_ty.size(0) })?)
            } else {
                None
            };
            specs.push(AggrSpec { func: a.func, in_col, in_ty, out_col, sum_col });
        }

        let out_store = self
            .engine
            .rt
            .stores
            .add_store(full_layout.tuple_len() as usize, self.engine.rt.mem.page_size());
        let out_layout = TupleLayout::for_schema(&node.schema);

        // Index keys: the input's group attrs probe both synopses.
        let mut in_pairs = Vec::new(); // stored input tuples
        let mut out_pairs = Vec::new(); // stored group rows
        let mut group_copy = AEval::new();
        for (pos, g) in group.iter().enumerate() {
            let gc = self.attr_col(node, *g)?;
            let out_col = out_layout.column(pos);
            let attr = node.schema[pos];
            in_pairs.push((gc, gc));
            out_pairs.push((gc, (out_col, attr.ty, attr.len)));
            push_copy(
                &mut group_copy,
                &attr,
                Operand::new(Role::Input, gc.0),
                Operand::new(Role::Output, out_col),
            );
        }
        let in_index = self.build_key_index(Role::Input, &in_pairs)?;
        let out_index = self.build_key_index(Role::Input, &out_pairs)?;
        let in_syn = self.relation_synopsis(input.store, Some(in_index));
        let out_syn = self.relation_synopsis(out_store, Some(out_index));

        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::GroupAggr(GroupAggr::new(
                    id, input.queue, queue, in_syn, in_index, out_syn, out_index, out_store,
                    group_copy, count_col, specs, EvalContext::new(),
                ))
            },
            false,
        );
        Ok(NodeOut { store: out_store, queue, layout: out_layout })
    }

    fn build_distinct(&mut self, node: &PlanNode) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let mut full_layout = TupleLayout::for_schema(&node.schema);
        let count_col = full_layout.add_attr(Attr::int())?;
        let out_layout = TupleLayout::for_schema(&node.schema);

        let out_store = self
            .engine
            .rt
            .stores
            .add_store(full_layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let cols = Self::schema_cols(&node.schema, &out_layout);
        let pairs: Vec<_> = cols.iter().map(|&c| (c, c)).collect();
        let out_index = self.build_key_index(Role::Input, &pairs)?;
        let out_syn = self.relation_synopsis(out_store, Some(out_index));

        let copy_eval = Self::whole_row_copy(&node.schema, &out_layout, Role::Input, Role::Output);
        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::Distinct(Distinct::new(
                    id, input.queue, queue, out_syn, out_index, out_store, copy_eval, count_col,
                    EvalContext::new(),
                ))
            },
            false,
        );
        Ok(NodeOut { store: out_store, queue, layout: out_layout })
    }

    fn build_xstream(&mut self, node: &PlanNode, kind: Xstream) -> Result<NodeOut, RilletError> {
        let input = self.input_out(node, 0).clone();
        let stub = self
            .engine
            .rt
            .stores
            .store_mut(input.store)
            .add_stub(StubKind::Relation);
        let syn = self.engine.rt.add_synopsis(SynKind::Relation, input.store, stub);
        let queue = self.new_queue();
        self.add_op(
            |id| match kind {
                Xstream::I => Operator::Istream(Istream::new(id, input.queue, queue, syn)),
                Xstream::D => Operator::Dstream(Dstream::new(id, input.queue, queue, syn)),
                Xstream::R => Operator::Rstream(Rstream::new(id, input.queue, queue, syn)),
            },
            false,
        );
        Ok(NodeOut { store: input.store, queue, layout: input.layout })
    }

    fn build_union(&mut self, node: &PlanNode) -> Result<NodeOut, RilletError> {
        let left = self.input_out(node, 0).clone();
        let right = self.input_out(node, 1).clone();
        let layout = TupleLayout::for_schema(&node.schema);
        let store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let out_syn = if node.is_stream {
            None
        } else {
            let stub = self.engine.rt.stores.store_mut(store).add_stub(StubKind::Lineage);
            Some(self.engine.rt.add_synopsis(SynKind::Lineage, store, stub))
        };

        let left_eval = Self::whole_row_copy(&node.schema, &layout, Role::Input, Role::Output);
        let right_eval = Self::whole_row_copy(&node.schema, &layout, Role::Input, Role::Output);
        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::Union(Union::new(
                    id, left.queue, right.queue, queue, store, out_syn, left_eval, right_eval,
                    EvalContext::new(),
                ))
            },
            false,
        );
        Ok(NodeOut { store, queue, layout })
    }

    fn build_except(&mut self, node: &PlanNode) -> Result<NodeOut, RilletError> {
        let left = self.input_out(node, 0).clone();
        let right = self.input_out(node, 1).clone();
        let layout = TupleLayout::for_schema(&node.schema);

        // Count rows: the value columns plus hidden per-side counts.
        let mut count_layout = TupleLayout::for_schema(&node.schema);
        let left_count_col = count_layout.add_attr(Attr::int())?;
        let right_count_col = count_layout.add_attr(Attr::int())?;
        let count_store = self
            .engine
            .rt
            .stores
            .add_store(count_layout.tuple_len() as usize, self.engine.rt.mem.page_size());
        let out_store = self
            .engine
            .rt
            .stores
            .add_store(layout.tuple_len() as usize, self.engine.rt.mem.page_size());

        let cols = Self::schema_cols(&node.schema, &layout);
        let pairs: Vec<_> = cols.iter().map(|&c| (c, c)).collect();
        let count_index = self.build_key_index(Role::Input, &pairs)?;
        let count_syn = self.relation_synopsis(count_store, Some(count_index));
        let left_index = self.build_key_index(Role::Input, &pairs)?;
        let left_syn = self.relation_synopsis(left.store, Some(left_index));

        let out_stub = self.engine.rt.stores.store_mut(out_store).add_stub(StubKind::Lineage);
        let out_syn = self.engine.rt.add_synopsis(SynKind::Lineage, out_store, out_stub);

        let copy_eval = Self::whole_row_copy(&node.schema, &layout, Role::Input, Role::Output);
        let queue = self.new_queue();
        self.add_op(
            |id| {
                Operator::Except(Except::new(
                    id,
                    left.queue,
                    right.queue,
                    queue,
                    count_syn,
                    count_index,
                    count_store,
                    left_count_col,
                    right_count_col,
                    left_syn,
                    left_index,
                    out_syn,
                    out_store,
                    copy_eval,
                    EvalContext::new(),
                ))
            },
            false,
        );
        Ok(NodeOut { store: out_store, queue, layout })
    }
}

enum Xstream {
    I,
    D,
    R,
}

/// Create the system-stream generator as the engine's first operator.
pub fn install_sys_stream_gen(engine: &mut Engine) -> usize {
    debug_assert!(engine.ops.is_empty(), "generator must be operator 0");
    let id = engine.ops.len();
    engine.rt.op_monitors.push(OpMonitor::default());
    engine.ops.push(Operator::SysStreamGen(SysStreamGen::new(id)));
    id
}

// ── Expression compilation ─────────────────────────────────────────────────

fn eq_cmp(ty: AttrType) -> Cmp {
    match ty {
        AttrType::Int => Cmp::IntEq,
        AttrType::Float => Cmp::FltEq,
        AttrType::Byte => Cmp::ByteEq,
        AttrType::Char => Cmp::CharEq,
    }
}

fn cmp_of(ty: AttrType, op: CompOp) -> Cmp {
    match (ty, op) {
        (AttrType::Int, CompOp::Lt) => Cmp::IntLt,
        (AttrType::Int, CompOp::Le) => Cmp::IntLe,
        (AttrType::Int, CompOp::Gt) => Cmp::IntGt,
        (AttrType::Int, CompOp::Ge) => Cmp::IntGe,
        (AttrType::Int, CompOp::Eq) => Cmp::IntEq,
        (AttrType::Int, CompOp::Ne) => Cmp::IntNe,
        (AttrType::Float, CompOp::Lt) => Cmp::FltLt,
        (AttrType::Float, CompOp::Le) => Cmp::FltLe,
        (AttrType::Float, CompOp::Gt) => Cmp::FltGt,
        (AttrType::Float, CompOp::Ge) => Cmp::FltGe,
        (AttrType::Float, CompOp::Eq) => Cmp::FltEq,
        (AttrType::Float, CompOp::Ne) => Cmp::FltNe,
        (AttrType::Byte, CompOp::Lt) => Cmp::ByteLt,
        (AttrType::Byte, CompOp::Le) => Cmp::ByteLe,
        (AttrType::Byte, CompOp::Gt) => Cmp::ByteGt,
        (AttrType::Byte, CompOp::Ge) => Cmp::ByteGe,
        (AttrType::Byte, CompOp::Eq) => Cmp::ByteEq,
        (AttrType::Byte, CompOp::Ne) => Cmp::ByteNe,
        (AttrType::Char, CompOp::Lt) => Cmp::CharLt,
        (AttrType::Char, CompOp::Le) => Cmp::CharLe,
        (AttrType::Char, CompOp::Gt) => Cmp::CharGt,
        (AttrType::Char, CompOp::Ge) => Cmp::CharGe,
        (AttrType::Char, CompOp::Eq) => Cmp::CharEq,
        (AttrType::Char, CompOp::Ne) => Cmp::CharNe,
    }
}

fn push_copy(eval: &mut AEval, attr: &Attr, src: Operand, dst: Operand) {
    match attr.ty {
        AttrType::Int => eval.push(AInstr::IntCpy(src, dst)),
        AttrType::Float => eval.push(AInstr::FltCpy(src, dst)),
        AttrType::Byte => eval.push(AInstr::ByteCpy(src, dst)),
        AttrType::Char => eval.push(AInstr::CharCpy(src, dst, attr.len)),
    }
}

/// The default join output: left columns then right columns.
fn concat_copy(
    plan: &QueryPlan,
    node: &PlanNode,
    left: &TupleLayout,
    right: &TupleLayout,
    out: &TupleLayout,
) -> AEval {
    let mut eval = AEval::new();
    let left_schema = &plan.nodes[node.inputs[0]].schema;
    let right_schema = &plan.nodes[node.inputs[1]].schema;
    for (pos, attr) in left_schema.iter().enumerate() {
        push_copy(
            &mut eval,
            attr,
            Operand::new(Role::Left, left.column(pos)),
            Operand::new(Role::Output, out.column(pos)),
        );
    }
    for (pos, attr) in right_schema.iter().enumerate() {
        push_copy(
            &mut eval,
            attr,
            Operand::new(Role::Right, right.column(pos)),
            Operand::new(Role::Output, out.column(left_schema.len() + pos)),
        );
    }
    eval
}

/// Lowers a node's expressions against its input layouts, provisioning
/// the scratch and constant tuples as it goes.
struct ExprCompiler<'a> {
    plan: &'a QueryPlan,
    node: &'a PlanNode,
    inputs: Vec<(&'a TupleLayout, Role)>,
    scratch: TupleLayout,
    consts: ConstTupleLayout,
}

impl<'a> ExprCompiler<'a> {
    fn new(plan: &'a QueryPlan, node: &'a PlanNode, inputs: Vec<(&'a TupleLayout, Role)>) -> Self {
        Self {
            plan,
            node,
            inputs,
            scratch: TupleLayout::new(),
            consts: ConstTupleLayout::new(),
        }
    }

    /// Compile a scalar expression, appending any arithmetic to `eval`.
    /// `char_len_hint` supplies the declared length when the expression
    /// is a string literal.
    fn compile_scalar(
        &mut self,
        e: &ScalarExpr,
        eval: &mut AEval,
        char_len_hint: u32,
    ) -> Result<(Operand, AttrType, u32), RilletError> {
        match e {
            ScalarExpr::IntConst(v) => {
                Ok((Operand::new(Role::Const, self.consts.add_int(*v)?), AttrType::Int, 0))
            }
            ScalarExpr::FloatConst(v) => Ok((
                Operand::new(Role::Const, self.consts.add_float(*v)?),
                AttrType::Float,
                0,
            )),
            ScalarExpr::ByteConst(v) => {
                Ok((Operand::new(Role::Const, self.consts.add_byte(*v)?), AttrType::Byte, 0))
            }
            ScalarExpr::CharConst(s) => {
                if char_len_hint == 0 {
                    return Err(RilletError::TypeMismatch(
                        "string literal without a CHAR column to size it".into(),
                    ));
                }
                let col = self.consts.add_char(s.as_bytes(), char_len_hint)?;
                Ok((Operand::new(Role::Const, col), AttrType::Char, char_len_hint))
            }
            ScalarExpr::Attr(a) => {
                let attr = resolve_attr(self.plan, self.node, *a)?;
                let (layout, role) = self.inputs[a.input];
                Ok((Operand::new(role, layout.column(a.pos)), attr.ty, attr.len))
            }
            ScalarExpr::Arith { op, left, right } => {
                let (l, lt, _) = self.compile_scalar(left, eval, 0)?;
                let (r, rt, _) = self.compile_scalar(right, eval, 0)?;
                if lt != rt || !matches!(lt, AttrType::Int | AttrType::Float) {
                    return Err(RilletError::TypeMismatch(format!(
                        "arithmetic over {} and {}",
                        lt.as_str(),
                        rt.as_str()
                    )));
                }
                let dst = Operand::new(
                    Role::Scratch,
                    self.scratch.add_attr(Attr { ty: lt, len: lt.size(0) })?,
                );
                eval.push(arith_instr(lt, *op, l, r, dst));
                Ok((dst, lt, 0))
            }
        }
    }

    /// Compile a CNF predicate. Each side's arithmetic becomes a nested
    /// preparation program on the comparison instruction.
    fn compile_pred(&mut self, pred: &[BoolExpr]) -> Result<BEval, RilletError> {
        let mut beval = BEval::new();
        for b in pred {
            // Resolve the CHAR length from whichever side is an attribute.
            let hint = [&b.left, &b.right]
                .into_iter()
                .find_map(|side| match side {
                    ScalarExpr::Attr(a) => resolve_attr(self.plan, self.node, *a)
                        .ok()
                        .filter(|attr| attr.ty == AttrType::Char)
                        .map(|attr| attr.len),
                    _ => None,
                })
                .unwrap_or(0);

            let mut left_prep = AEval::new();
            let (left, lt, llen) = self.compile_scalar(&b.left, &mut left_prep, hint)?;
            let mut right_prep = AEval::new();
            let (right, rt, rlen) = self.compile_scalar(&b.right, &mut right_prep, hint)?;
            if lt != rt {
                return Err(RilletError::TypeMismatch(format!(
                    "comparison of {} with {}",
                    lt.as_str(),
                    rt.as_str()
                )));
            }
            beval.push(BInstr {
                cmp: cmp_of(lt, b.op),
                left,
                right,
                char_len: llen.max(rlen),
                left_prep: (!left_prep.is_empty()).then_some(left_prep),
                right_prep: (!right_prep.is_empty()).then_some(right_prep),
            });
        }
        Ok(beval)
    }

    /// Compile a projection list into one program writing the OUTPUT role.
    fn compile_projection(
        &mut self,
        exprs: &[ScalarExpr],
        out_schema: &[Attr],
        out_layout: &TupleLayout,
    ) -> Result<AEval, RilletError> {
        let mut eval = AEval::new();
        for (pos, e) in exprs.iter().enumerate() {
            let attr = out_schema[pos];
            let (src, ty, _) = self.compile_scalar(e, &mut eval, attr.len)?;
            if ty != attr.ty {
                return Err(RilletError::TypeMismatch(format!(
                    "projection {pos} yields {}, schema says {}",
                    ty.as_str(),
                    attr.ty.as_str()
                )));
            }
            push_copy(&mut eval, &attr, src, Operand::new(Role::Output, out_layout.column(pos)));
        }
        Ok(eval)
    }

    /// Build the evaluation context with the provisioned scratch and
    /// constant tuples.
    fn finish(self) -> EvalContext {
        let mut ctx = EvalContext::new();
        if self.scratch.tuple_len() > 0 {
            ctx.set_scratch(self.scratch.tuple_len() as usize);
        }
        if self.consts.tuple_len() > 0 {
            ctx.set_consts(self.consts.build());
        }
        ctx
    }
}

fn arith_instr(ty: AttrType, op: ArithOp, l: Operand, r: Operand, dst: Operand) -> AInstr {
    match (ty, op) {
        (AttrType::Int, ArithOp::Add) => AInstr::IntAdd(l, r, dst),
        (AttrType::Int, ArithOp::Sub) => AInstr::IntSub(l, r, dst),
        (AttrType::Int, ArithOp::Mul) => AInstr::IntMul(l, r, dst),
        (AttrType::Int, ArithOp::Div) => AInstr::IntDiv(l, r, dst),
        (AttrType::Float, ArithOp::Add) => AInstr::FltAdd(l, r, dst),
        (AttrType::Float, ArithOp::Sub) => AInstr::FltSub(l, r, dst),
        (AttrType::Float, ArithOp::Mul) => AInstr::FltMul(l, r, dst),
        (AttrType::Float, ArithOp::Div) => AInstr::FltDiv(l, r, dst),
        _ => unreachable!("non-numeric arithmetic rejected during validation"),
    }
}
