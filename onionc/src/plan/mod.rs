//! Plan trees.
//!
//! Leaves are rewritten SQL statements evaluated server-side against
//! encrypted storage; interior nodes are client-side operators that finish
//! any work the server cannot perform under the chosen encryption scheme.

use enum_as_inner::EnumAsInner;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ast::{Expr, SortDirection};
use crate::codegen::{SqlSelect, write_expr, write_select};
use crate::onion::Onion;
use crate::{Error, Result};

/// The onion of one tuple position. Packed-HOM aggregate columns carry the
/// group identity rather than a plain onion bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumAsInner)]
pub enum PosOnion {
    Onion(Onion),
    HomGroup { table: String, group: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosDesc {
    pub onion: PosOnion,
    pub vector_ctx: bool,
}

impl PosDesc {
    pub fn new(onion: Onion) -> Self {
        PosDesc {
            onion: PosOnion::Onion(onion),
            vector_ctx: false,
        }
    }

    pub fn plain() -> Self {
        PosDesc::new(Onion::Plain)
    }

    pub fn hom_group(table: &str, group: usize) -> Self {
        PosDesc {
            onion: PosOnion::HomGroup {
                table: table.to_string(),
                group,
            },
            vector_ctx: false,
        }
    }

    pub fn is_plain(&self) -> bool {
        self.onion == PosOnion::Onion(Onion::Plain)
    }
}

impl std::fmt::Display for PosDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.onion {
            PosOnion::Onion(o) => write!(f, "{o}")?,
            PosOnion::HomGroup { table, group } => write!(f, "HOM_GROUP({table}, {group})")?,
        }
        if self.vector_ctx {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// An embedded correlated subquery of a local filter: its plan plus the
/// bindings from dependent placeholders to outer tuple positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSubquery {
    pub plan: PlanNode,
    /// `(placeholder index, tuple position)` pairs; the tuple value is
    /// passed through still encrypted under the onion the placeholder was
    /// bound to.
    pub bindings: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformItem {
    /// Pass through the child position unchanged.
    Pass(usize),
    /// Evaluate a client expression over the child tuple.
    Compute(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub pos: usize,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum PlanNode {
    RemoteSql {
        stmt: SqlSelect,
        tuple_desc: Vec<PosDesc>,
        subplans: Vec<PlanNode>,
    },
    /// Materialize a child plan server-side under a synthetic table name so
    /// an outer statement can reference it as a relation.
    RemoteMaterialize {
        name: String,
        child: Box<PlanNode>,
    },
    LocalFilter {
        expr: Expr,
        orig_expr: Expr,
        child: Box<PlanNode>,
        subqueries: Vec<PlanSubquery>,
    },
    /// Same shape as `LocalFilter`, applied post-aggregation (one tuple per
    /// group).
    LocalGroupFilter {
        expr: Expr,
        orig_expr: Expr,
        child: Box<PlanNode>,
        subqueries: Vec<PlanSubquery>,
    },
    LocalTransform {
        ops: Vec<TransformItem>,
        child: Box<PlanNode>,
    },
    LocalOrderBy {
        keys: Vec<SortKey>,
        child: Box<PlanNode>,
    },
    LocalLimit {
        n: u64,
        child: Box<PlanNode>,
    },
    LocalDecrypt {
        positions: Vec<usize>,
        child: Box<PlanNode>,
    },
    LocalEncrypt {
        /// Positions with the onion to re-encrypt to.
        positions: Vec<(usize, Onion)>,
        child: Box<PlanNode>,
    },
}

impl PlanNode {
    pub fn child(&self) -> Option<&PlanNode> {
        use PlanNode::*;
        match self {
            RemoteSql { .. } => None,
            RemoteMaterialize { child, .. }
            | LocalFilter { child, .. }
            | LocalGroupFilter { child, .. }
            | LocalTransform { child, .. }
            | LocalOrderBy { child, .. }
            | LocalLimit { child, .. }
            | LocalDecrypt { child, .. }
            | LocalEncrypt { child, .. } => Some(child),
        }
    }

    /// The ordered descriptor of this node's output tuple.
    pub fn tuple_desc(&self) -> Vec<PosDesc> {
        use PlanNode::*;
        match self {
            RemoteSql { tuple_desc, .. } => tuple_desc.clone(),
            RemoteMaterialize { child, .. }
            | LocalFilter { child, .. }
            | LocalGroupFilter { child, .. }
            | LocalOrderBy { child, .. }
            | LocalLimit { child, .. } => child.tuple_desc(),
            LocalTransform { ops, child } => {
                let child_desc = child.tuple_desc();
                ops.iter()
                    .map(|op| match op {
                        TransformItem::Pass(i) => child_desc[*i].clone(),
                        TransformItem::Compute(_) => PosDesc::plain(),
                    })
                    .collect()
            }
            LocalDecrypt { positions, child } => {
                let mut desc = child.tuple_desc();
                for p in positions {
                    desc[*p].onion = PosOnion::Onion(Onion::Plain);
                }
                desc
            }
            LocalEncrypt { positions, child } => {
                let mut desc = child.tuple_desc();
                for (p, o) in positions {
                    desc[*p].onion = PosOnion::Onion(*o);
                }
                desc
            }
        }
    }

    pub fn width(&self) -> usize {
        self.tuple_desc().len()
    }

    /// Internal tuple-descriptor sanity check, applied to every node.
    pub fn validate(&self) -> Result<()> {
        use PlanNode::*;
        let check = |cond: bool, msg: &str| -> Result<()> {
            if cond {
                Ok(())
            } else {
                Err(Error::new_assert(msg))
            }
        };

        match self {
            RemoteSql {
                stmt,
                tuple_desc,
                subplans,
            } => {
                check(
                    stmt.projections.len() == tuple_desc.len(),
                    "tuple descriptor length differs from server projection count",
                )?;
                for p in subplans {
                    p.validate()?;
                }
            }
            RemoteMaterialize { child, .. } => child.validate()?,
            LocalFilter {
                child, subqueries, ..
            }
            | LocalGroupFilter {
                child, subqueries, ..
            } => {
                let width = child.width();
                for sq in subqueries {
                    sq.plan.validate()?;
                    for (_, pos) in &sq.bindings {
                        check(*pos < width, "subquery binding position out of range")?;
                    }
                }
                child.validate()?;
            }
            LocalTransform { ops, child } => {
                let width = child.width();
                for op in ops {
                    if let TransformItem::Pass(i) = op {
                        check(*i < width, "transform pass-through position out of range")?;
                    }
                }
                child.validate()?;
            }
            LocalOrderBy { keys, child } => {
                let width = child.width();
                for k in keys {
                    check(k.pos < width, "order-by key position out of range")?;
                }
                child.validate()?;
            }
            LocalLimit { child, .. } => child.validate()?,
            LocalDecrypt { positions, child } => {
                let desc = child.tuple_desc();
                for p in positions {
                    check(*p < desc.len(), "decrypt position out of range")?;
                    check(!desc[*p].is_plain(), "decrypting an already-plain position")?;
                }
                check(
                    positions.iter().all_unique(),
                    "duplicate decrypt positions",
                )?;
                child.validate()?;
            }
            LocalEncrypt { positions, child } => {
                let width = child.width();
                for (p, _) in positions {
                    check(*p < width, "encrypt position out of range")?;
                }
                child.validate()?;
            }
        }
        Ok(())
    }

    /// Stable indented text rendering for tests and debugging.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, indent: usize) {
        use PlanNode::*;
        let pad = "  ".repeat(indent);
        let desc = self
            .tuple_desc()
            .iter()
            .map(|d| d.to_string())
            .join(", ");
        match self {
            RemoteSql { stmt, subplans, .. } => {
                out.push_str(&format!("{pad}RemoteSql [{desc}]\n"));
                out.push_str(&format!("{pad}  {}\n", write_select(stmt)));
                for p in subplans {
                    out.push_str(&format!("{pad}  subplan:\n"));
                    p.explain_into(out, indent + 2);
                }
            }
            RemoteMaterialize { name, child } => {
                out.push_str(&format!("{pad}RemoteMaterialize {name}\n"));
                child.explain_into(out, indent + 1);
            }
            LocalFilter {
                expr,
                child,
                subqueries,
                ..
            } => {
                out.push_str(&format!("{pad}LocalFilter {}\n", write_expr(expr)));
                for sq in subqueries {
                    out.push_str(&format!("{pad}  subquery (bindings {:?}):\n", sq.bindings));
                    sq.plan.explain_into(out, indent + 2);
                }
                child.explain_into(out, indent + 1);
            }
            LocalGroupFilter {
                expr,
                child,
                subqueries,
                ..
            } => {
                out.push_str(&format!("{pad}LocalGroupFilter {}\n", write_expr(expr)));
                for sq in subqueries {
                    out.push_str(&format!("{pad}  subquery (bindings {:?}):\n", sq.bindings));
                    sq.plan.explain_into(out, indent + 2);
                }
                child.explain_into(out, indent + 1);
            }
            LocalTransform { ops, child } => {
                let ops = ops
                    .iter()
                    .map(|op| match op {
                        TransformItem::Pass(i) => i.to_string(),
                        TransformItem::Compute(e) => format!("({})", write_expr(e)),
                    })
                    .join(", ");
                out.push_str(&format!("{pad}LocalTransform [{ops}]\n"));
                child.explain_into(out, indent + 1);
            }
            LocalOrderBy { keys, child } => {
                let keys = keys
                    .iter()
                    .map(|k| match k.direction {
                        SortDirection::Asc => k.pos.to_string(),
                        SortDirection::Desc => format!("{} DESC", k.pos),
                    })
                    .join(", ");
                out.push_str(&format!("{pad}LocalOrderBy [{keys}]\n"));
                child.explain_into(out, indent + 1);
            }
            LocalLimit { n, child } => {
                out.push_str(&format!("{pad}LocalLimit {n}\n"));
                child.explain_into(out, indent + 1);
            }
            LocalDecrypt { positions, child } => {
                out.push_str(&format!("{pad}LocalDecrypt {positions:?}\n"));
                child.explain_into(out, indent + 1);
            }
            LocalEncrypt { positions, child } => {
                let positions = positions
                    .iter()
                    .map(|(p, o)| format!("{p}:{o}"))
                    .join(", ");
                out.push_str(&format!("{pad}LocalEncrypt [{positions}]\n"));
                child.explain_into(out, indent + 1);
            }
        }
    }

    /// The server SQL of the leaf, when the whole plan is a single
    /// `RemoteSql`.
    pub fn as_pure_remote_sql(&self) -> Option<&SqlSelect> {
        match self {
            PlanNode::RemoteSql { stmt, .. } => Some(stmt),
            _ => None,
        }
    }
}
