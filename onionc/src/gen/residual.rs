//! Residual client computations.
//!
//! When the server rewrite bails out, the expression is split into server
//! projections of whatever the client will need, plus a client expression
//! over those tuple positions. Embedded subselects are planned
//! independently, with outer references turned into positional placeholders.

use super::server::RewriteCtx;
use super::{EncContext, Generator, StmtCtx};
use crate::ast::{
    AggFunc, AstFold, BinOp, CaseBranch, Expr, ExprKind, FieldIdent, Literal, SelectStmt,
    fold_expr_kind, top_down_transform,
};
use crate::codegen::write_expr;
use crate::onion::{HomDesc, Onion, OnionMask};
use crate::plan::{PlanNode, PosDesc, PosOnion};
use crate::scope::Symbol;
use crate::{Error, Reason, Result};

/// One server-side projection a client computation reads.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResidualProj {
    pub orig: Expr,
    pub server: Expr,
    pub desc: PosDesc,
    /// Whether the client needs the value decrypted before use. False for
    /// placeholder feeds that pass ciphertext straight into a subquery.
    pub decrypt: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResidualSubquery {
    pub plan: PlanNode,
    /// `(placeholder index, subquery-projection slot)`.
    pub bindings: Vec<(usize, usize)>,
}

/// A residual expression the client evaluates on projected values. The
/// expression references only tuple positions, dependent placeholders, and
/// positions into the subqueries sequence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClientComputation {
    pub expr: Expr,
    pub orig_expr: Expr,
    pub projections: Vec<ResidualProj>,
    pub subquery_projections: Vec<ResidualProj>,
    pub subqueries: Vec<ResidualSubquery>,
    next_placeholder: usize,
}

impl ClientComputation {
    fn new(orig_expr: Expr) -> Self {
        ClientComputation {
            expr: ExprKind::Literal(Literal::Null).into(),
            orig_expr,
            projections: Vec::new(),
            subquery_projections: Vec::new(),
            subqueries: Vec::new(),
            next_placeholder: 0,
        }
    }

    /// Content-addressed insert; returns the canonical slot.
    fn add_projection(&mut self, orig: Expr, server: Expr, desc: PosDesc) -> usize {
        let key = write_expr(&server);
        if let Some(i) = self
            .projections
            .iter()
            .position(|p| write_expr(&p.server) == key)
        {
            return i;
        }
        self.projections.push(ResidualProj {
            orig,
            server,
            desc,
            decrypt: true,
        });
        self.projections.len() - 1
    }

    fn add_subquery_projection(
        &mut self,
        orig: Expr,
        server: Expr,
        desc: PosDesc,
        decrypt: bool,
    ) -> usize {
        let key = write_expr(&server);
        if let Some(i) = self
            .subquery_projections
            .iter()
            .position(|p| write_expr(&p.server) == key)
        {
            self.subquery_projections[i].decrypt |= decrypt;
            return i;
        }
        self.subquery_projections.push(ResidualProj {
            orig,
            server,
            desc,
            decrypt,
        });
        self.subquery_projections.len() - 1
    }
}

/// Merge two conjunct computations into one. Associative.
pub(crate) fn merge_conjunctions(
    mut a: ClientComputation,
    b: ClientComputation,
) -> ClientComputation {
    let main_map: Vec<usize> = b
        .projections
        .into_iter()
        .map(|p| a.add_projection(p.orig, p.server, p.desc))
        .collect();
    let sub_map: Vec<usize> = b
        .subquery_projections
        .into_iter()
        .map(|p| a.add_subquery_projection(p.orig, p.server, p.desc, p.decrypt))
        .collect();
    let subq_offset = a.subqueries.len();
    for sq in b.subqueries {
        a.subqueries.push(ResidualSubquery {
            plan: sq.plan,
            bindings: sq
                .bindings
                .into_iter()
                .map(|(ph, slot)| (ph, sub_map[slot]))
                .collect(),
        });
    }

    let b_expr = top_down_transform(b.expr, &mut |e| {
        Ok(match &e.kind {
            ExprKind::TuplePos(i) => Some(ExprKind::TuplePos(main_map[*i]).into()),
            ExprKind::SubqueryPos(k) => Some(ExprKind::SubqueryPos(k + subq_offset).into()),
            ExprKind::ExistsSubqueryPos(k) => {
                Some(ExprKind::ExistsSubqueryPos(k + subq_offset).into())
            }
            _ => None,
        })
    })
    .expect("slot remapping is infallible");

    a.expr = ExprKind::And(Box::new(a.expr), Box::new(b_expr)).into();
    a.orig_expr = ExprKind::And(Box::new(a.orig_expr), Box::new(b.orig_expr)).into();
    a.next_placeholder = a.next_placeholder.max(b.next_placeholder);
    a
}

impl Generator<'_> {
    /// Construct the client computation for an expression the server cannot
    /// answer. `vector_scope` is true when the computation runs per group of
    /// a GROUP BY, so non-key fields project as packed vectors.
    pub(crate) fn build_residual(
        &mut self,
        st: &mut StmtCtx,
        e: &Expr,
        vector_scope: bool,
    ) -> Result<ClientComputation> {
        let resolved = self.arena.resolve_aliases(e.clone());
        let mut comp = ClientComputation::new(e.clone());
        let expr = ResidualFolder {
            generator: self,
            st,
            comp: &mut comp,
            vector_scope,
        }
        .fold_expr(resolved)?;
        comp.expr = expr;
        Ok(comp)
    }

    /// Replace every field whose symbol's context is a parent of the
    /// subquery's own context with a positional placeholder, remembering
    /// `(placeholder, original field)` pairs. Correlated references to outer
    /// projections are a hard error.
    pub(crate) fn rewrite_outer_references(
        &self,
        sub: &SelectStmt,
        first_placeholder: usize,
    ) -> Result<(SelectStmt, Vec<(usize, Expr)>)> {
        struct OuterRewriter<'a> {
            arena: &'a crate::scope::ScopeArena,
            sub_ctx: crate::scope::ScopeId,
            next: usize,
            pairs: Vec<(usize, Expr)>,
        }
        impl AstFold for OuterRewriter<'_> {
            fn fold_expr(&mut self, expr: Expr) -> Result<Expr> {
                if let ExprKind::Field(FieldIdent {
                    symbol: Some(symbol),
                    ..
                }) = &expr.kind
                {
                    match symbol {
                        Symbol::Projection { ctx, .. }
                            if self.arena.is_parent_of(*ctx, self.sub_ctx) =>
                        {
                            return Err(Error::new(Reason::Bug {
                                details: Some(
                                    "correlated reference to an outer projection".to_string(),
                                ),
                            }));
                        }
                        Symbol::Column { ctx, .. }
                            if self.arena.is_parent_of(*ctx, self.sub_ctx) =>
                        {
                            if let Some((i, _)) =
                                self.pairs.iter().find(|(_, f)| *f == expr)
                            {
                                return Ok(ExprKind::DependentPlaceholder(*i).into());
                            }
                            let i = self.next;
                            self.next += 1;
                            self.pairs.push((i, expr.clone()));
                            return Ok(ExprKind::DependentPlaceholder(i).into());
                        }
                        _ => {}
                    }
                }
                Ok(Expr {
                    kind: self.fold_expr_kind(expr.kind)?,
                })
            }
        }

        let sub_ctx = sub
            .ctx
            .ok_or_else(|| Error::new_assert("rewriting an unbound subquery"))?;
        let mut rewriter = OuterRewriter {
            arena: self.arena,
            sub_ctx,
            next: first_placeholder,
            pairs: Vec::new(),
        };
        let rewritten = rewriter.fold_select_stmt(sub.clone())?;
        Ok((rewritten, rewriter.pairs))
    }

    /// The packed-HOM optimization for `SUM`/`AVG`: one server projection
    /// `hom_agg(arg, table, group)`, client extracts the position within the
    /// group. Walks through CASE branches, which must agree on a single
    /// group.
    fn try_hom_group_sum(
        &mut self,
        st: &mut StmtCtx,
        comp: &mut ClientComputation,
        func: AggFunc,
        arg: &Expr,
        orig: &Expr,
    ) -> Result<Option<Expr>> {
        let (value_expr, case_shape) = match &arg.kind {
            ExprKind::Case { branches, default } => {
                let mut value: Option<&Expr> = None;
                for b in branches {
                    if is_zero_or_null(&b.value) {
                        continue;
                    }
                    match value {
                        None => value = Some(&b.value),
                        Some(v) if *v == b.value => {}
                        Some(_) => return Ok(None),
                    }
                }
                if let Some(d) = default {
                    if !is_zero_or_null(d) {
                        match value {
                            Some(v) if *v == **d => {}
                            None => value = Some(d.as_ref()),
                            Some(_) => return Ok(None),
                        }
                    }
                }
                let Some(value) = value else {
                    return Ok(None);
                };
                (value.clone(), Some(branches.clone()))
            }
            _ => (arg.clone(), None),
        };

        let Some((rowid, descs)) = self.get_supported_hom_row_desc_expr(st, &value_expr) else {
            return Ok(None);
        };
        let desc = self.pick_hom_desc(st, descs);

        let server_arg = match case_shape {
            None => rowid,
            Some(branches) => {
                let mut server_branches = Vec::new();
                for b in &branches {
                    let Some((condition, _)) = self.do_transform_server(
                        st,
                        &b.condition,
                        &RewriteCtx {
                            onions: vec![Onion::Plain.mask()],
                            agg: false,
                        },
                    )?
                    else {
                        return Ok(None);
                    };
                    let value = if is_zero_or_null(&b.value) {
                        ExprKind::Literal(Literal::Null).into()
                    } else {
                        rowid.clone()
                    };
                    server_branches.push(CaseBranch { condition, value });
                }
                ExprKind::Case {
                    branches: server_branches,
                    default: None,
                }
                .into()
            }
        };

        log::debug!(
            "packed-HOM sum over ({}, group {}, pos {})",
            desc.table,
            desc.group,
            desc.pos
        );
        let slot = comp.add_projection(
            orig.clone(),
            ExprKind::HomAgg {
                arg: Box::new(server_arg),
                table: desc.table.clone(),
                group: desc.group,
            }
            .into(),
            PosDesc::hom_group(&desc.table, desc.group),
        );
        let get: Expr = ExprKind::HomGetPos {
            arg: Box::new(ExprKind::TuplePos(slot).into()),
            pos: desc.pos,
        }
        .into();

        Ok(Some(match func {
            AggFunc::Avg => {
                let count_expr: Expr = ExprKind::Agg {
                    func: AggFunc::CountStar,
                    arg: None,
                }
                .into();
                let count_slot =
                    comp.add_projection(count_expr.clone(), count_expr, PosDesc::plain());
                ExprKind::Binary {
                    op: BinOp::Div,
                    left: Box::new(get),
                    right: Box::new(ExprKind::TuplePos(count_slot).into()),
                }
                .into()
            }
            _ => get,
        }))
    }

    /// Tie-break between candidate groups: the least-used group per the
    /// preference ordering wins, so heavily-used groups stay available for
    /// other uses in the query.
    fn pick_hom_desc(&self, st: &StmtCtx, mut descs: Vec<HomDesc>) -> HomDesc {
        descs.sort_by_key(|d| {
            let rank = st
                .hom_prefs
                .get(&d.table)
                .and_then(|prefs| prefs.iter().position(|g| *g == d.group))
                .unwrap_or(usize::MAX);
            (rank, d.group)
        });
        descs.remove(0)
    }
}

struct ResidualFolder<'a, 'b> {
    generator: &'a mut Generator<'b>,
    st: &'a mut StmtCtx,
    comp: &'a mut ClientComputation,
    vector_scope: bool,
}

impl ResidualFolder<'_, '_> {
    fn project_field(&mut self, expr: &Expr) -> Result<Expr> {
        let (server, onion_ty) = self
            .generator
            .get_supported_expr_constraint_aware(self.st, expr, OnionMask::comparable())
            .ok_or_else(|| {
                Error::new_simple(format!(
                    "no supported onion to project `{}` for client evaluation",
                    write_expr(expr)
                ))
            })?;

        let is_group_key = self
            .generator
            .canonical_key(expr)
            .is_some_and(|(_, key)| self.st.group_key_onions.contains_key(&key));

        let (server, desc) = if self.vector_scope && !is_group_key {
            (
                ExprKind::GroupConcat(Box::new(server)).into(),
                PosDesc {
                    onion: PosOnion::Onion(onion_ty.onion),
                    vector_ctx: true,
                },
            )
        } else {
            (
                server,
                PosDesc {
                    onion: PosOnion::Onion(onion_ty.onion),
                    vector_ctx: onion_ty.vector_ctx,
                },
            )
        };
        let slot = self.comp.add_projection(expr.clone(), server, desc);
        Ok(ExprKind::TuplePos(slot).into())
    }

    /// Prefer a wholly-server form of a subtree over field-by-field
    /// projection.
    fn project_whole(&mut self, expr: &Expr, mask: OnionMask) -> Result<Option<Expr>> {
        let rctx = RewriteCtx {
            onions: vec![mask],
            agg: true,
        };
        let Some((server, onion_ty)) = self.generator.do_transform_server(self.st, expr, &rctx)?
        else {
            return Ok(None);
        };
        let desc = PosDesc {
            onion: PosOnion::Onion(onion_ty.onion),
            vector_ctx: onion_ty.vector_ctx,
        };
        let slot = self.comp.add_projection(expr.clone(), server, desc);
        Ok(Some(ExprKind::TuplePos(slot).into()))
    }

    fn fold_subquery(&mut self, sub: SelectStmt, exists: bool) -> Result<ExprKind> {
        let (rewritten, pairs) = self
            .generator
            .rewrite_outer_references(&sub, self.comp.next_placeholder)?;
        self.comp.next_placeholder += pairs.len();

        let enc = if exists {
            EncContext::PreserveCardinality
        } else {
            EncContext::PreserveOriginal
        };
        let (plan, ph_onions) = self.generator.plan_stmt(&rewritten, &enc)?;

        let mut bindings = Vec::new();
        for (ph, field) in pairs {
            let onion = ph_onions.get(&ph).copied().unwrap_or(Onion::Det);
            // a plain binding means the subquery consumes the value
            // client-side, so project decryptable and decrypt before use
            let (mask, decrypt) = if onion == Onion::Plain {
                (OnionMask::comparable(), true)
            } else {
                (onion.mask(), false)
            };
            let (server, onion_ty) = self
                .generator
                .get_supported_expr_constraint_aware(self.st, &field, mask)
                .ok_or_else(|| {
                    Error::new_simple(format!(
                        "no supported onion to bind `{}` into a correlated subquery",
                        write_expr(&field)
                    ))
                })?;
            let slot = self.comp.add_subquery_projection(
                field,
                server,
                PosDesc::new(onion_ty.onion),
                decrypt,
            );
            bindings.push((ph, slot));
        }

        self.comp.subqueries.push(ResidualSubquery { plan, bindings });
        let k = self.comp.subqueries.len() - 1;
        Ok(if exists {
            ExprKind::ExistsSubqueryPos(k)
        } else {
            ExprKind::SubqueryPos(k)
        })
    }
}

impl AstFold for ResidualFolder<'_, '_> {
    fn fold_expr(&mut self, expr: Expr) -> Result<Expr> {
        match &expr.kind {
            ExprKind::Field(_) => return self.project_field(&expr),
            ExprKind::DependentPlaceholder(i) => {
                // consumed client-side unless the server already claimed it
                self.st
                    .placeholder_onions
                    .entry(*i)
                    .or_insert(Onion::Plain);
                return Ok(expr);
            }
            ExprKind::Agg {
                func: func @ (AggFunc::Sum | AggFunc::Avg),
                arg: Some(arg),
            } => {
                let (func, arg) = (*func, arg.clone());
                if let Some(repl) =
                    self.generator
                        .try_hom_group_sum(self.st, self.comp, func, &arg, &expr)?
                {
                    return Ok(repl);
                }
                if let Some(repl) = self.project_whole(&expr, OnionMask::all())? {
                    return Ok(repl);
                }
            }
            ExprKind::Agg { .. } => {
                if let Some(repl) = self.project_whole(&expr, OnionMask::all())? {
                    return Ok(repl);
                }
            }
            ExprKind::Binary { .. } => {
                if let Some(repl) = self.project_whole(&expr, OnionMask::all())? {
                    return Ok(repl);
                }
            }
            ExprKind::Subselect(sub) => {
                let sub = (**sub).clone();
                return Ok(Expr {
                    kind: self.fold_subquery(sub, false)?,
                });
            }
            ExprKind::Exists(sub) => {
                let sub = (**sub).clone();
                return Ok(Expr {
                    kind: self.fold_subquery(sub, true)?,
                });
            }
            _ => {}
        }
        Ok(Expr {
            kind: fold_expr_kind(self, expr.kind)?,
        })
    }
}

fn is_zero_or_null(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Literal(Literal::Null) => true,
        ExprKind::Literal(Literal::Integer(i)) => *i == 0,
        ExprKind::Literal(Literal::Float(f)) => *f == 0.0,
        _ => false,
    }
}
