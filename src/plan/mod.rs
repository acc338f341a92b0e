//! Physical plan description.
//!
//! The external planner delivers a fully annotated plan: operator kinds,
//! output schemas, expressions, predicates (in CNF), window sizes, and
//! input wiring as indices into the node list. The types here are plain
//! data and serde-deserializable, so a plan can arrive as JSON.
//!
//! Validation and instantiation live in [`graph`] and [`instantiate`].

pub mod graph;
pub mod instantiate;

use serde::{Deserialize, Serialize};

use crate::error::RilletError;
use crate::types::{AggrFn, ArithOp, Attr, CompOp};

/// Reference to an attribute of one of a node's inputs: which input, and
/// the position in that input's output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrRef {
    pub input: usize,
    pub pos: usize,
}

/// A scalar expression: constants, attribute references, arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    IntConst(i32),
    FloatConst(f32),
    ByteConst(u8),
    /// String literal; must fit the consuming column's declared length.
    CharConst(String),
    Attr(AttrRef),
    Arith {
        op: ArithOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
}

impl ScalarExpr {
    pub fn attr(input: usize, pos: usize) -> Self {
        ScalarExpr::Attr(AttrRef { input, pos })
    }
}

/// One comparison of a CNF predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoolExpr {
    pub op: CompOp,
    pub left: ScalarExpr,
    pub right: ScalarExpr,
}

/// One aggregation of a group-by node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggrExpr {
    pub func: AggrFn,
    pub attr: AttrRef,
}

/// Physical operator kinds, annotated with their parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanOpKind {
    /// Base stream registered in the catalog (or `SysStream`).
    StreamSource { table: String },
    /// Base relation registered in the catalog.
    RelnSource { table: String },
    Select { pred: Vec<BoolExpr> },
    Project { exprs: Vec<ScalarExpr> },
    /// Relation-relation join.
    Join { pred: Vec<BoolExpr> },
    /// Stream (left) against relation (right).
    StreamJoin { pred: Vec<BoolExpr> },
    /// Join fused with a projection over both sides.
    JoinProject { pred: Vec<BoolExpr>, exprs: Vec<ScalarExpr> },
    StreamJoinProject { pred: Vec<BoolExpr>, exprs: Vec<ScalarExpr> },
    GroupAggr { group: Vec<AttrRef>, aggrs: Vec<AggrExpr> },
    Distinct,
    RowWin { rows: u32 },
    /// `stride == 0` slides; `stride > 0` tumbles. Size 0 is NOW.
    RangeWin { size: u32, stride: u32 },
    /// Identity stream → relation conversion.
    UnboundedWin,
    PartnWin { attrs: Vec<AttrRef>, rows: u32 },
    Istream,
    Dstream,
    Rstream,
    Union,
    Except,
}

/// One node of the plan graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub kind: PlanOpKind,
    /// Indices of the producing nodes, in operator order (left, right).
    pub inputs: Vec<usize>,
    /// Output schema, fully annotated.
    pub schema: Vec<Attr>,
    /// Whether the output is a pure stream (append-only).
    pub is_stream: bool,
}

/// A compiled physical plan for one continuous query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub nodes: Vec<PlanNode>,
    /// The node whose output feeds the query output.
    pub root: usize,
}

impl QueryPlan {
    pub fn from_json(json: &str) -> Result<Self, RilletError> {
        serde_json::from_str(json)
            .map_err(|e| RilletError::ParseError(format!("plan JSON: {e}")))
    }

    pub fn to_json(&self) -> Result<String, RilletError> {
        serde_json::to_string(self)
            .map_err(|e| RilletError::InternalError(format!("plan JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttrType;

    fn small_plan() -> QueryPlan {
        QueryPlan {
            nodes: vec![
                PlanNode {
                    kind: PlanOpKind::StreamSource { table: "S".into() },
                    inputs: vec![],
                    schema: vec![Attr::int(), Attr::int()],
                    is_stream: true,
                },
                PlanNode {
                    kind: PlanOpKind::Select {
                        pred: vec![BoolExpr {
                            op: CompOp::Lt,
                            left: ScalarExpr::attr(0, 0),
                            right: ScalarExpr::IntConst(10),
                        }],
                    },
                    inputs: vec![0],
                    schema: vec![Attr::int(), Attr::int()],
                    is_stream: true,
                },
            ],
            root: 1,
        }
    }

    #[test]
    fn test_plan_json_roundtrip() {
        let plan = small_plan();
        let json = plan.to_json().unwrap();
        let back = QueryPlan::from_json(&json).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let err = QueryPlan::from_json("{not json").unwrap_err();
        assert!(matches!(err, RilletError::ParseError(_)));
    }

    #[test]
    fn test_schema_types_survive_serde() {
        let plan = small_plan();
        let json = plan.to_json().unwrap();
        let back = QueryPlan::from_json(&json).unwrap();
        assert_eq!(back.nodes[0].schema[0].ty, AttrType::Int);
    }
}
