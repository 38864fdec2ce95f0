use itertools::Itertools;

use super::*;
use crate::Result;

// Fold pattern:
// - https://rust-unofficial.github.io/patterns/patterns/creational/fold.html
//
// For some functions, we want to call a default impl, because copying &
// pasting everything apart from a specific match is lots of repetition. So
// we define a function outside the trait, by default call it, and let
// implementors override the default while calling the function directly for
// some cases.
pub trait AstFold {
    fn fold_expr(&mut self, mut expr: Expr) -> Result<Expr> {
        expr.kind = self.fold_expr_kind(expr.kind)?;
        Ok(expr)
    }
    fn fold_expr_kind(&mut self, kind: ExprKind) -> Result<ExprKind> {
        fold_expr_kind(self, kind)
    }
    fn fold_exprs(&mut self, exprs: Vec<Expr>) -> Result<Vec<Expr>> {
        exprs.into_iter().map(|e| self.fold_expr(e)).try_collect()
    }
    fn fold_field(&mut self, field: FieldIdent) -> Result<FieldIdent> {
        Ok(field)
    }
    fn fold_select_stmt(&mut self, stmt: SelectStmt) -> Result<SelectStmt> {
        fold_select_stmt(self, stmt)
    }
}

pub fn fold_expr_kind<F: ?Sized + AstFold>(fold: &mut F, kind: ExprKind) -> Result<ExprKind> {
    use ExprKind::*;
    Ok(match kind {
        And(l, r) => And(fold_box(fold, l)?, fold_box(fold, r)?),
        Or(l, r) => Or(fold_box(fold, l)?, fold_box(fold, r)?),
        Not(e) => Not(fold_box(fold, e)?),
        Cmp { op, left, right } => Cmp {
            op,
            left: fold_box(fold, left)?,
            right: fold_box(fold, right)?,
        },
        In { expr, list } => In {
            expr: fold_box(fold, expr)?,
            list: fold.fold_exprs(list)?,
        },
        Like { expr, pattern } => Like {
            expr: fold_box(fold, expr)?,
            pattern: fold_box(fold, pattern)?,
        },
        Binary { op, left, right } => Binary {
            op,
            left: fold_box(fold, left)?,
            right: fold_box(fold, right)?,
        },
        Case { branches, default } => Case {
            branches: branches
                .into_iter()
                .map(|b| {
                    Ok(CaseBranch {
                        condition: fold.fold_expr(b.condition)?,
                        value: fold.fold_expr(b.value)?,
                    })
                })
                .try_collect()?,
            default: default.map(|d| fold_box(fold, d)).transpose()?,
        },
        Agg { func, arg } => Agg {
            func,
            arg: arg.map(|a| fold_box(fold, a)).transpose()?,
        },
        FuncCall { name, args } => FuncCall {
            name,
            args: fold.fold_exprs(args)?,
        },
        Subselect(stmt) => Subselect(Box::new(fold.fold_select_stmt(*stmt)?)),
        Exists(stmt) => Exists(Box::new(fold.fold_select_stmt(*stmt)?)),
        Field(field) => Field(fold.fold_field(field)?),
        Encrypt { expr, onion } => Encrypt {
            expr: fold_box(fold, expr)?,
            onion,
        },
        HomAgg { arg, table, group } => HomAgg {
            arg: fold_box(fold, arg)?,
            table,
            group,
        },
        GroupConcat(e) => GroupConcat(fold_box(fold, e)?),
        HomGetPos { arg, pos } => HomGetPos {
            arg: fold_box(fold, arg)?,
            pos,
        },
        kind @ (Literal(_) | DependentPlaceholder(_) | TuplePos(_) | SubqueryPos(_)
        | ExistsSubqueryPos(_) | SqlSubselect(_) | SqlExists(_)) => kind,
    })
}

fn fold_box<F: ?Sized + AstFold>(fold: &mut F, e: Box<Expr>) -> Result<Box<Expr>> {
    Ok(Box::new(fold.fold_expr(*e)?))
}

pub fn fold_select_stmt<F: ?Sized + AstFold>(fold: &mut F, stmt: SelectStmt) -> Result<SelectStmt> {
    Ok(SelectStmt {
        projections: stmt
            .projections
            .into_iter()
            .map(|p| {
                Ok(match p {
                    Projection::Expr { expr, name } => Projection::Expr {
                        expr: fold.fold_expr(expr)?,
                        name,
                    },
                    Projection::Star => Projection::Star,
                })
            })
            .try_collect()?,
        relations: stmt
            .relations
            .into_iter()
            .map(|r| {
                Ok(RelationDecl {
                    alias: r.alias,
                    kind: match r.kind {
                        RelationKind::Table(t) => RelationKind::Table(t),
                        RelationKind::Subquery(s) => {
                            RelationKind::Subquery(Box::new(fold.fold_select_stmt(*s)?))
                        }
                    },
                })
            })
            .try_collect()?,
        filter: stmt.filter.map(|f| fold.fold_expr(f)).transpose()?,
        group_by: stmt
            .group_by
            .map(|g| {
                Ok::<_, crate::Error>(GroupBy {
                    keys: fold.fold_exprs(g.keys)?,
                    having: g.having.map(|h| fold.fold_expr(h)).transpose()?,
                })
            })
            .transpose()?,
        order_by: stmt
            .order_by
            .into_iter()
            .map(|s| {
                Ok(ColumnSort {
                    direction: s.direction,
                    column: fold.fold_expr(s.column)?,
                })
            })
            .try_collect()?,
        limit: stmt.limit,
        ctx: stmt.ctx,
    })
}

/// Apply `f` top-down; when it returns `Some`, the subtree is replaced and
/// not descended into further.
pub fn top_down_transform<F>(expr: Expr, f: &mut F) -> Result<Expr>
where
    F: FnMut(&Expr) -> Result<Option<Expr>>,
{
    struct Transformer<'a, F> {
        f: &'a mut F,
    }
    impl<F> AstFold for Transformer<'_, F>
    where
        F: FnMut(&Expr) -> Result<Option<Expr>>,
    {
        fn fold_expr(&mut self, expr: Expr) -> Result<Expr> {
            if let Some(replacement) = (self.f)(&expr)? {
                return Ok(replacement);
            }
            Ok(Expr {
                kind: self.fold_expr_kind(expr.kind)?,
            })
        }
    }
    Transformer { f }.fold_expr(expr)
}

/// Visit every direct child expression of `e`. Subselects count as leaves.
pub fn for_each_child<'a>(e: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    use ExprKind::*;
    match &e.kind {
        And(l, r) | Or(l, r) => {
            f(l);
            f(r);
        }
        Cmp { left, right, .. } | Binary { left, right, .. } => {
            f(left);
            f(right);
        }
        Like { expr, pattern } => {
            f(expr);
            f(pattern);
        }
        In { expr, list } => {
            f(expr);
            list.iter().for_each(&mut *f);
        }
        Not(e) | GroupConcat(e) => f(e),
        Case { branches, default } => {
            for b in branches {
                f(&b.condition);
                f(&b.value);
            }
            if let Some(d) = default {
                f(d);
            }
        }
        Agg { arg, .. } => {
            if let Some(a) = arg {
                f(a);
            }
        }
        FuncCall { args, .. } => args.iter().for_each(&mut *f),
        Encrypt { expr, .. } => f(expr),
        HomAgg { arg, .. } | HomGetPos { arg, .. } => f(arg),
        Subselect(_) | Exists(_) | SqlSubselect(_) | SqlExists(_) | Field(_) | Literal(_)
        | DependentPlaceholder(_) | TuplePos(_) | SubqueryPos(_) | ExistsSubqueryPos(_) => {}
    }
}

/// Collect all field references in `e`, depth-first, not descending into
/// subselects.
pub fn collect_fields(e: &Expr) -> Vec<&FieldIdent> {
    fn collect<'a>(e: &'a Expr, out: &mut Vec<&'a FieldIdent>) {
        if let ExprKind::Field(f) = &e.kind {
            out.push(f);
        }
        for_each_child(e, &mut |c| collect(c, out));
    }
    let mut out = Vec::new();
    collect(e, &mut out);
    out
}

/// Collect all embedded subselect statements (both `Subselect` and `Exists`),
/// depth-first.
pub fn collect_subselects(e: &Expr) -> Vec<(&SelectStmt, bool)> {
    fn collect<'a>(e: &'a Expr, out: &mut Vec<(&'a SelectStmt, bool)>) {
        match &e.kind {
            ExprKind::Subselect(s) => out.push((s, false)),
            ExprKind::Exists(s) => out.push((s, true)),
            _ => {}
        }
        for_each_child(e, &mut |c| collect(c, out));
    }
    let mut out = Vec::new();
    collect(e, &mut out);
    out
}
