//! Plan-graph validation.
//!
//! Checks a [`QueryPlan`] before instantiation: wiring (arity, bounds,
//! single consumer, acyclicity via Kahn's algorithm), stream/relation
//! typing per operator kind, and schema consistency. Returns the
//! topological order instantiation walks.

use std::collections::VecDeque;

use crate::error::RilletError;
use crate::layout::MAX_ATTRS;
use crate::plan::{AttrRef, PlanNode, PlanOpKind, QueryPlan, ScalarExpr};
use crate::types::AttrType;

/// Validate the plan and return a topological order of its nodes.
pub fn validate(plan: &QueryPlan) -> Result<Vec<usize>, RilletError> {
    if plan.nodes.is_empty() {
        return Err(RilletError::InvalidParam("plan has no nodes".into()));
    }
    if plan.root >= plan.nodes.len() {
        return Err(RilletError::InvalidParam(format!(
            "plan root {} out of range",
            plan.root
        )));
    }

    let mut consumers = vec![0usize; plan.nodes.len()];
    for (i, node) in plan.nodes.iter().enumerate() {
        let arity = expected_arity(&node.kind);
        if node.inputs.len() != arity {
            return Err(RilletError::InvalidParam(format!(
                "node {i}: expected {arity} inputs, got {}",
                node.inputs.len()
            )));
        }
        if node.schema.is_empty() || node.schema.len() > MAX_ATTRS {
            return Err(RilletError::InvalidParam(format!(
                "node {i}: schema must have 1..={MAX_ATTRS} attributes"
            )));
        }
        for &input in &node.inputs {
            if input >= plan.nodes.len() {
                return Err(RilletError::InvalidParam(format!(
                    "node {i}: input {input} out of range"
                )));
            }
            consumers[input] += 1;
        }
    }

    for (i, &n) in consumers.iter().enumerate() {
        let expected = if i == plan.root { 0 } else { 1 };
        if n != expected {
            return Err(RilletError::InvalidParam(format!(
                "node {i}: read by {n} consumers; every queue has exactly one \
                 reader (duplicate the subplan for fan-out)"
            )));
        }
    }

    let order = topological_order(plan)?;
    for &i in &order {
        check_node(plan, i)?;
    }
    Ok(order)
}

/// Kahn's algorithm over the input edges.
fn topological_order(plan: &QueryPlan) -> Result<Vec<usize>, RilletError> {
    let n = plan.nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, node) in plan.nodes.iter().enumerate() {
        in_degree[i] = node.inputs.len();
        for &input in &node.inputs {
            dependents[input].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != n {
        return Err(RilletError::InvalidParam(
            "plan graph contains a cycle".into(),
        ));
    }
    Ok(order)
}

fn expected_arity(kind: &PlanOpKind) -> usize {
    match kind {
        PlanOpKind::StreamSource { .. } | PlanOpKind::RelnSource { .. } => 0,
        PlanOpKind::Join { .. }
        | PlanOpKind::StreamJoin { .. }
        | PlanOpKind::JoinProject { .. }
        | PlanOpKind::StreamJoinProject { .. }
        | PlanOpKind::Union
        | PlanOpKind::Except => 2,
        _ => 1,
    }
}

/// Resolve an attribute reference against a node's inputs.
pub fn resolve_attr(
    plan: &QueryPlan,
    node: &PlanNode,
    a: AttrRef,
) -> Result<crate::types::Attr, RilletError> {
    let input = *node.inputs.get(a.input).ok_or_else(|| {
        RilletError::InvalidParam(format!("attribute reference to missing input {}", a.input))
    })?;
    plan.nodes[input]
        .schema
        .get(a.pos)
        .copied()
        .ok_or_else(|| {
            RilletError::UnknownAttr(format!("position {} of node {input}", a.pos))
        })
}

/// Output type of a scalar expression in a node's context.
pub fn expr_type(
    plan: &QueryPlan,
    node: &PlanNode,
    e: &ScalarExpr,
) -> Result<AttrType, RilletError> {
    match e {
        ScalarExpr::IntConst(_) => Ok(AttrType::Int),
        ScalarExpr::FloatConst(_) => Ok(AttrType::Float),
        ScalarExpr::ByteConst(_) => Ok(AttrType::Byte),
        ScalarExpr::CharConst(_) => Ok(AttrType::Char),
        ScalarExpr::Attr(a) => Ok(resolve_attr(plan, node, *a)?.ty),
        ScalarExpr::Arith { left, right, .. } => {
            let lt = expr_type(plan, node, left)?;
            let rt = expr_type(plan, node, right)?;
            if lt != rt {
                return Err(RilletError::TypeMismatch(format!(
                    "arithmetic over {} and {}",
                    lt.as_str(),
                    rt.as_str()
                )));
            }
            if !matches!(lt, AttrType::Int | AttrType::Float) {
                return Err(RilletError::TypeMismatch(format!(
                    "arithmetic over non-numeric {}",
                    lt.as_str()
                )));
            }
            Ok(lt)
        }
    }
}

fn check_pred(
    plan: &QueryPlan,
    node: &PlanNode,
    pred: &[crate::plan::BoolExpr],
) -> Result<(), RilletError> {
    for b in pred {
        let lt = expr_type(plan, node, &b.left)?;
        let rt = expr_type(plan, node, &b.right)?;
        if lt != rt {
            return Err(RilletError::TypeMismatch(format!(
                "comparison of {} with {}",
                lt.as_str(),
                rt.as_str()
            )));
        }
    }
    Ok(())
}

fn schemas_compatible(a: &[crate::types::Attr], b: &[crate::types::Attr]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ty == y.ty && x.len == y.len)
}

fn input_of<'a>(plan: &'a QueryPlan, node: &PlanNode, i: usize) -> &'a PlanNode {
    &plan.nodes[node.inputs[i]]
}

/// Per-node typing and schema checks. Also verifies the declared
/// `is_stream` flag against what the operator kind produces.
fn check_node(plan: &QueryPlan, idx: usize) -> Result<(), RilletError> {
    let node = &plan.nodes[idx];
    let fail_stream = |expected: bool| {
        Err(RilletError::SchemaMismatch(format!(
            "node {idx}: is_stream must be {expected} for {:?}",
            std::mem::discriminant(&node.kind)
        )))
    };

    match &node.kind {
        PlanOpKind::StreamSource { .. } => {
            if !node.is_stream {
                return fail_stream(true);
            }
        }
        PlanOpKind::RelnSource { .. } => {
            if node.is_stream {
                return fail_stream(false);
            }
        }

        PlanOpKind::Select { pred } => {
            let input = input_of(plan, node, 0);
            if !schemas_compatible(&node.schema, &input.schema) {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: selection must preserve its input schema"
                )));
            }
            if node.is_stream != input.is_stream {
                return fail_stream(input.is_stream);
            }
            check_pred(plan, node, pred)?;
        }

        PlanOpKind::Project { exprs } => {
            check_projection(plan, node, idx, exprs)?;
            let input = input_of(plan, node, 0);
            if node.is_stream != input.is_stream {
                return fail_stream(input.is_stream);
            }
        }

        PlanOpKind::RowWin { rows } => {
            check_window_input(plan, node, idx)?;
            if *rows == 0 {
                return Err(RilletError::InvalidParam(format!(
                    "node {idx}: row window size must be positive"
                )));
            }
            if node.is_stream {
                return fail_stream(false);
            }
        }
        PlanOpKind::RangeWin { size: _, stride: _ } | PlanOpKind::UnboundedWin => {
            check_window_input(plan, node, idx)?;
            if node.is_stream {
                return fail_stream(false);
            }
        }
        PlanOpKind::PartnWin { attrs, rows } => {
            check_window_input(plan, node, idx)?;
            if *rows == 0 {
                return Err(RilletError::InvalidParam(format!(
                    "node {idx}: partition window size must be positive"
                )));
            }
            if attrs.is_empty() {
                return Err(RilletError::InvalidParam(format!(
                    "node {idx}: partition window needs partition attributes"
                )));
            }
            for a in attrs {
                resolve_attr(plan, node, *a)?;
            }
            if node.is_stream {
                return fail_stream(false);
            }
        }

        PlanOpKind::Join { pred } | PlanOpKind::JoinProject { pred, .. } => {
            for i in 0..2 {
                if input_of(plan, node, i).is_stream {
                    return Err(RilletError::SchemaMismatch(format!(
                        "node {idx}: relation join over a stream input; window it first"
                    )));
                }
            }
            check_pred(plan, node, pred)?;
            if node.is_stream {
                return fail_stream(false);
            }
            if let PlanOpKind::JoinProject { exprs, .. } = &node.kind {
                check_projection(plan, node, idx, exprs)?;
            } else {
                let concat: Vec<_> = input_of(plan, node, 0)
                    .schema
                    .iter()
                    .chain(&input_of(plan, node, 1).schema)
                    .copied()
                    .collect();
                if !schemas_compatible(&node.schema, &concat) {
                    return Err(RilletError::SchemaMismatch(format!(
                        "node {idx}: join schema must concatenate its inputs"
                    )));
                }
            }
        }

        PlanOpKind::StreamJoin { pred } | PlanOpKind::StreamJoinProject { pred, .. } => {
            if !input_of(plan, node, 0).is_stream {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: stream join's left input must be a stream"
                )));
            }
            if input_of(plan, node, 1).is_stream {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: stream join's right input must be a relation"
                )));
            }
            check_pred(plan, node, pred)?;
            if !node.is_stream {
                return fail_stream(true);
            }
            if let PlanOpKind::StreamJoinProject { exprs, .. } = &node.kind {
                check_projection(plan, node, idx, exprs)?;
            }
        }

        PlanOpKind::GroupAggr { group, aggrs } => {
            if node.is_stream {
                return fail_stream(false);
            }
            if aggrs.is_empty() {
                return Err(RilletError::InvalidParam(format!(
                    "node {idx}: group-by without aggregates"
                )));
            }
            if node.schema.len() != group.len() + aggrs.len() {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: schema must be grouping attrs then aggregates"
                )));
            }
            for (pos, g) in group.iter().enumerate() {
                let attr = resolve_attr(plan, node, *g)?;
                if node.schema[pos].ty != attr.ty {
                    return Err(RilletError::TypeMismatch(format!(
                        "node {idx}: grouping attribute {pos}"
                    )));
                }
            }
            for (i, a) in aggrs.iter().enumerate() {
                let input = resolve_attr(plan, node, a.attr)?;
                if !matches!(input.ty, AttrType::Int | AttrType::Float) {
                    return Err(RilletError::TypeMismatch(format!(
                        "node {idx}: aggregate {i} over non-numeric attribute"
                    )));
                }
                let out_ty = a.func.output_type(input.ty);
                if node.schema[group.len() + i].ty != out_ty {
                    return Err(RilletError::TypeMismatch(format!(
                        "node {idx}: aggregate {i} output must be {}",
                        out_ty.as_str()
                    )));
                }
            }
        }

        PlanOpKind::Distinct => {
            let input = input_of(plan, node, 0);
            if !schemas_compatible(&node.schema, &input.schema) {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: distinct must preserve its input schema"
                )));
            }
            if node.is_stream {
                return fail_stream(false);
            }
        }

        PlanOpKind::Istream | PlanOpKind::Dstream | PlanOpKind::Rstream => {
            let input = input_of(plan, node, 0);
            if input.is_stream {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: relation-to-stream conversion over a stream"
                )));
            }
            if !schemas_compatible(&node.schema, &input.schema) {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: conversion must preserve its input schema"
                )));
            }
            if !node.is_stream {
                return fail_stream(true);
            }
        }

        PlanOpKind::Union => {
            let (l, r) = (input_of(plan, node, 0), input_of(plan, node, 1));
            if !schemas_compatible(&l.schema, &r.schema)
                || !schemas_compatible(&node.schema, &l.schema)
            {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: union inputs must share the output schema"
                )));
            }
            let stream = l.is_stream && r.is_stream;
            if node.is_stream != stream {
                return fail_stream(stream);
            }
        }

        PlanOpKind::Except => {
            let (l, r) = (input_of(plan, node, 0), input_of(plan, node, 1));
            if l.is_stream || r.is_stream {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: except requires relation inputs"
                )));
            }
            if !schemas_compatible(&l.schema, &r.schema)
                || !schemas_compatible(&node.schema, &l.schema)
            {
                return Err(RilletError::SchemaMismatch(format!(
                    "node {idx}: except inputs must share the output schema"
                )));
            }
            if node.is_stream {
                return fail_stream(false);
            }
        }
    }
    Ok(())
}

fn check_window_input(plan: &QueryPlan, node: &PlanNode, idx: usize) -> Result<(), RilletError> {
    let input = input_of(plan, node, 0);
    if !input.is_stream {
        return Err(RilletError::WindowOverRelation(format!(
            "node {idx}: window over a relation-valued input"
        )));
    }
    if !schemas_compatible(&node.schema, &input.schema) {
        return Err(RilletError::SchemaMismatch(format!(
            "node {idx}: window must preserve its input schema"
        )));
    }
    Ok(())
}

fn check_projection(
    plan: &QueryPlan,
    node: &PlanNode,
    idx: usize,
    exprs: &[ScalarExpr],
) -> Result<(), RilletError> {
    if exprs.len() != node.schema.len() {
        return Err(RilletError::SchemaMismatch(format!(
            "node {idx}: {} projection expressions for {} output attributes",
            exprs.len(),
            node.schema.len()
        )));
    }
    for (pos, e) in exprs.iter().enumerate() {
        let ty = expr_type(plan, node, e)?;
        if ty != node.schema[pos].ty {
            return Err(RilletError::TypeMismatch(format!(
                "node {idx}: projection {pos} yields {}, schema says {}",
                ty.as_str(),
                node.schema[pos].ty.as_str()
            )));
        }
    }
    Ok(())
}
