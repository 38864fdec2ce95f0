//! Resolved query AST
//!
//! Strictly typed AST for SELECT statements over the logical schema. The
//! planner consumes these nodes read-only; rewriting produces new nodes with
//! shared subtrees where unchanged.

mod fold;

use enum_as_inner::EnumAsInner;
pub use fold::*;
use serde::{Deserialize, Serialize};

use crate::onion::Onion;
use crate::scope::{ScopeId, Symbol};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr { kind }
    }
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Self {
        Expr { kind }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumAsInner)]
pub enum ExprKind {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),

    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
    },

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Case {
        branches: Vec<CaseBranch>,
        default: Option<Box<Expr>>,
    },

    Agg {
        func: AggFunc,
        /// `None` only for `COUNT(*)`.
        arg: Option<Box<Expr>>,
    },

    /// Opaque scalar function the planner has no special knowledge of
    /// (`substr`, `searchSWP`, UDFs). Answerable server-side only when the
    /// whole call is a precomputed expression in the onion set.
    FuncCall {
        name: String,
        args: Vec<Expr>,
    },

    Subselect(Box<SelectStmt>),
    Exists(Box<SelectStmt>),

    /// Server-side only: a subselect already planned and inlined as server
    /// SQL (the child plan was a pure `RemoteSql`).
    SqlSubselect(Box<crate::codegen::SqlSelect>),
    /// Server-side only: `EXISTS` over an inlined subselect.
    SqlExists(Box<crate::codegen::SqlSelect>),

    Field(FieldIdent),
    Literal(Literal),

    /// Positional stand-in for an outer-tuple value, inserted when a
    /// correlated subselect is rewritten for independent planning. Bound at
    /// execution time.
    DependentPlaceholder(usize),

    /// Server-side only: encrypt a literal under an onion before shipping.
    Encrypt {
        expr: Box<Expr>,
        onion: Onion,
    },
    /// Server-side only: packed-HOM aggregation over a group's rowid column.
    HomAgg {
        arg: Box<Expr>,
        table: String,
        group: usize,
    },
    /// Server-side only: `GROUP_CONCAT(arg, ',')`, packing one group's
    /// values into a vector for residual client work.
    GroupConcat(Box<Expr>),

    /// Client-side only: reference into the consumed tuple.
    TuplePos(usize),
    /// Client-side only: extract one aggregate from a decrypted packed-HOM
    /// ciphertext row.
    HomGetPos {
        arg: Box<Expr>,
        pos: usize,
    },
    /// Client-side only: value of the k-th embedded subquery plan.
    SubqueryPos(usize),
    /// Client-side only: non-emptiness of the k-th embedded subquery plan.
    ExistsSubqueryPos(usize),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn is_equality(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AggFunc {
    /// `COUNT(*)` — carries no argument.
    CountStar,
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CaseBranch {
    pub condition: Expr,
    pub value: Expr,
}

/// A column or projection reference. `symbol` is attached by the binder;
/// canonicalized expressions carry neither qualifier nor symbol.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FieldIdent {
    pub qualifier: Option<String>,
    pub name: String,
    pub symbol: Option<Symbol>,
}

impl FieldIdent {
    pub fn new(qualifier: Option<&str>, name: &str) -> Self {
        FieldIdent {
            qualifier: qualifier.map(str::to_string),
            name: name.to_string(),
            symbol: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumAsInner)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(String),
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SelectStmt {
    pub projections: Vec<Projection>,
    pub relations: Vec<RelationDecl>,
    pub filter: Option<Expr>,
    pub group_by: Option<GroupBy>,
    pub order_by: Vec<ColumnSort<Expr>>,
    pub limit: Option<u64>,

    /// Scope of this statement; attached by the binder.
    pub ctx: Option<ScopeId>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumAsInner)]
pub enum Projection {
    Expr { expr: Expr, name: Option<String> },
    Star,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RelationDecl {
    pub alias: String,
    pub kind: RelationKind,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, EnumAsInner)]
pub enum RelationKind {
    Table(String),
    Subquery(Box<SelectStmt>),
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct GroupBy {
    pub keys: Vec<Expr>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSort<T> {
    pub direction: SortDirection,
    pub column: T,
}

#[derive(Debug, Clone, Copy, Serialize, Default, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl Expr {
    /// True iff the tree contains an aggregate node (not descending into
    /// subselects, whose aggregates belong to their own scope).
    pub fn contains_aggregate(&self) -> bool {
        match &self.kind {
            ExprKind::Agg { .. } => true,
            ExprKind::Subselect(_) | ExprKind::Exists(_) => false,
            _ => {
                let mut found = false;
                for_each_child(self, &mut |c| {
                    found = found || c.contains_aggregate();
                });
                found
            }
        }
    }
}
