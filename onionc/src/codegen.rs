//! SQL text generation for server-side expressions and statements.
//!
//! Output is deterministic (single-space separated clauses, minimal
//! parenthesization by binding strength) so snapshot tests are stable.

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ast::{CaseBranch, Expr, ExprKind, Literal, SortDirection};

pub static VALID_IDENT: Lazy<Regex> = Lazy::new(|| {
    // An ident starting with `a-z_$` and containing other characters
    // `a-z0-9_$`. Encrypted column names (`l_shipdate$OPE`) stay unquoted,
    // so the onion suffix chars are included.
    Regex::new(r"^[a-zA-Z_\$][a-zA-Z0-9_\$]*$").unwrap()
});

pub fn write_ident(name: &str) -> String {
    if VALID_IDENT.is_match(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// A rewritten server-side SELECT. This is what `RemoteSql` leaves carry;
/// the encrypted store executes its text form.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct SqlSelect {
    /// Projections with optional output aliases.
    pub projections: Vec<(Expr, Option<String>)>,
    pub from: Vec<SqlFrom>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<(Expr, SortDirection)>,
    pub limit: Option<u64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum SqlFrom {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        stmt: Box<SqlSelect>,
        alias: String,
    },
}

impl std::fmt::Display for SqlSelect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&write_select(self))
    }
}

pub fn write_select(stmt: &SqlSelect) -> String {
    let mut sql = String::from("SELECT ");
    sql += &stmt
        .projections
        .iter()
        .map(|(e, alias)| match alias {
            Some(a) => format!("{} AS {}", write_expr(e), write_ident(a)),
            None => write_expr(e),
        })
        .join(", ");

    if !stmt.from.is_empty() {
        sql += " FROM ";
        sql += &stmt
            .from
            .iter()
            .map(|rel| match rel {
                SqlFrom::Table { name, alias } => match alias {
                    Some(a) => format!("{} AS {}", write_ident(name), write_ident(a)),
                    None => write_ident(name),
                },
                SqlFrom::Subquery { stmt, alias } => {
                    format!("({}) AS {}", write_select(stmt), write_ident(alias))
                }
            })
            .join(", ");
    }

    if let Some(selection) = &stmt.selection {
        sql += " WHERE ";
        sql += &write_expr(selection);
    }
    if !stmt.group_by.is_empty() {
        sql += " GROUP BY ";
        sql += &stmt.group_by.iter().map(write_expr).join(", ");
    }
    if let Some(having) = &stmt.having {
        sql += " HAVING ";
        sql += &write_expr(having);
    }
    if !stmt.order_by.is_empty() {
        sql += " ORDER BY ";
        sql += &stmt
            .order_by
            .iter()
            .map(|(e, dir)| match dir {
                SortDirection::Asc => write_expr(e),
                SortDirection::Desc => format!("{} DESC", write_expr(e)),
            })
            .join(", ");
    }
    if let Some(limit) = stmt.limit {
        sql += &format!(" LIMIT {limit}");
    }
    sql
}

/// Binding strength of an expression root; children with strictly lower
/// strength than their slot require parentheses.
fn binding_strength(kind: &ExprKind) -> u8 {
    use ExprKind::*;
    match kind {
        Or(..) => 1,
        And(..) => 2,
        Not(..) => 3,
        Cmp { .. } | In { .. } | Like { .. } => 4,
        Binary {
            op: crate::ast::BinOp::Add | crate::ast::BinOp::Sub,
            ..
        } => 5,
        Binary { .. } => 6,
        _ => 10,
    }
}

fn write_child(child: &Expr, parent_strength: u8) -> String {
    let s = write_expr(child);
    if binding_strength(&child.kind) < parent_strength {
        format!("({s})")
    } else {
        s
    }
}

pub fn write_expr(expr: &Expr) -> String {
    use ExprKind::*;
    let strength = binding_strength(&expr.kind);
    match &expr.kind {
        And(l, r) => format!(
            "{} AND {}",
            write_child(l, strength),
            write_child(r, strength)
        ),
        Or(l, r) => format!(
            "{} OR {}",
            write_child(l, strength),
            write_child(r, strength)
        ),
        Not(e) => format!("NOT {}", write_child(e, strength)),
        Cmp { op, left, right } => format!(
            "{} {} {}",
            write_child(left, strength + 1),
            op.as_sql(),
            write_child(right, strength + 1)
        ),
        In { expr, list } => match list.as_slice() {
            // an inlined subselect brings its own parens; don't double up
            [Expr {
                kind: SqlSubselect(stmt),
            }] => format!(
                "{} IN ({})",
                write_child(expr, strength + 1),
                write_select(stmt)
            ),
            _ => format!(
                "{} IN ({})",
                write_child(expr, strength + 1),
                list.iter().map(write_expr).join(", ")
            ),
        },
        Like { expr, pattern } => format!(
            "{} LIKE {}",
            write_child(expr, strength + 1),
            write_child(pattern, strength + 1)
        ),
        Binary { op, left, right } => format!(
            "{} {} {}",
            write_child(left, strength),
            op.as_sql(),
            // right side binds tighter: `a - (b - c)` must keep its parens
            write_child(right, strength + 1)
        ),
        Case { branches, default } => {
            let mut s = String::from("CASE");
            for CaseBranch { condition, value } in branches {
                s += &format!(" WHEN {} THEN {}", write_expr(condition), write_expr(value));
            }
            if let Some(d) = default {
                s += &format!(" ELSE {}", write_expr(d));
            }
            s + " END"
        }
        Agg { func, arg } => match arg {
            None => "COUNT(*)".to_string(),
            Some(a) => format!("{func}({})", write_expr(a)),
        },
        FuncCall { name, args } => {
            format!("{name}({})", args.iter().map(write_expr).join(", "))
        }
        // unplanned subselects only show up when rendering original
        // expressions for explain output
        Subselect(_) => "(<subselect>)".to_string(),
        Exists(_) => "EXISTS (<subselect>)".to_string(),
        SqlSubselect(stmt) => format!("({})", write_select(stmt)),
        SqlExists(stmt) => format!("EXISTS ({})", write_select(stmt)),
        Field(f) => match &f.qualifier {
            Some(q) => format!("{}.{}", write_ident(q), write_ident(&f.name)),
            None => write_ident(&f.name),
        },
        Literal(lit) => write_literal(lit),
        DependentPlaceholder(i) => format!(":p{i}"),
        Encrypt { expr, onion } => format!("encrypt({}, {onion})", write_expr(expr)),
        HomAgg { arg, table, group } => {
            format!("hom_agg({}, '{table}', {group})", write_expr(arg))
        }
        GroupConcat(e) => format!("GROUP_CONCAT({}, ',')", write_expr(e)),
        TuplePos(i) => format!("col{i}"),
        HomGetPos { arg, pos } => format!("hom_get_pos({}, {pos})", write_expr(arg)),
        SubqueryPos(i) => format!("sq{i}"),
        ExistsSubqueryPos(i) => format!("exists_sq{i}"),
    }
}

pub fn write_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{f:?}"),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
        Literal::Date(d) => format!("date '{d}'"),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::ast::{BinOp, CmpOp, FieldIdent};

    fn field(name: &str) -> Expr {
        ExprKind::Field(FieldIdent::new(None, name)).into()
    }

    fn int(i: i64) -> Expr {
        ExprKind::Literal(Literal::Integer(i)).into()
    }

    #[test]
    fn precedence() {
        let e: Expr = ExprKind::Binary {
            op: BinOp::Mul,
            left: Box::new(field("a")),
            right: Box::new(
                ExprKind::Binary {
                    op: BinOp::Sub,
                    left: Box::new(int(1)),
                    right: Box::new(field("b")),
                }
                .into(),
            ),
        }
        .into();
        assert_snapshot!(write_expr(&e), @"a * (1 - b)");
    }

    #[test]
    fn filters() {
        let e: Expr = ExprKind::And(
            Box::new(
                ExprKind::Cmp {
                    op: CmpOp::Lt,
                    left: Box::new(field("l_shipdate$OPE")),
                    right: Box::new(
                        ExprKind::Encrypt {
                            expr: Box::new(
                                ExprKind::Literal(Literal::Date("1998-09-01".into())).into(),
                            ),
                            onion: crate::onion::Onion::Ope,
                        }
                        .into(),
                    ),
                }
                .into(),
            ),
            Box::new(
                ExprKind::Cmp {
                    op: CmpOp::Eq,
                    left: Box::new(field("a$DET")),
                    right: Box::new(int(5)),
                }
                .into(),
            ),
        )
        .into();
        assert_snapshot!(
            write_expr(&e),
            @"l_shipdate$OPE < encrypt(date '1998-09-01', OPE) AND a$DET = 5"
        );
    }

    #[test]
    fn select_statement() {
        let stmt = SqlSelect {
            projections: vec![
                (field("a$DET"), None),
                (
                    ExprKind::HomAgg {
                        arg: Box::new(field("rowid")),
                        table: "lineitem".into(),
                        group: 0,
                    }
                    .into(),
                    Some("h0".into()),
                ),
            ],
            from: vec![SqlFrom::Table {
                name: "lineitem$enc".into(),
                alias: None,
            }],
            selection: None,
            group_by: vec![field("k$DET")],
            having: None,
            order_by: vec![(field("a$OPE"), SortDirection::Asc)],
            limit: Some(10),
        };
        assert_snapshot!(
            write_select(&stmt),
            @"SELECT a$DET, hom_agg(rowid, 'lineitem', 0) AS h0 FROM lineitem$enc GROUP BY k$DET ORDER BY a$OPE LIMIT 10"
        );
    }
}
