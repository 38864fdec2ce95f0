//! Bottom-up rewrite of expressions into server SQL under an onion
//! constraint.
//!
//! A shape failure anywhere in a subtree bails the whole conjunct out to the
//! residual path; bailout is an explicit `None` rather than an ambient
//! validity flag, so nothing runs past a failure.

use itertools::Itertools;

use super::residual::merge_conjunctions;
use super::{ClientComputation, EncContext, Generator, StmtCtx};
use crate::ast::{AggFunc, CaseBranch, CmpOp, Expr, ExprKind, Literal};
use crate::onion::{Onion, OnionMask, OnionType};
use crate::plan::PlanNode;
use crate::{Result, codegen};

/// Onion constraints a rewrite runs under: a ranked sequence of masks plus
/// whether aggregates are legal here. Passed by value, never ambient.
#[derive(Debug, Clone)]
pub(crate) struct RewriteCtx {
    pub onions: Vec<OnionMask>,
    pub agg: bool,
}

impl RewriteCtx {
    pub fn in_clear(&self) -> bool {
        self.has(Onion::Plain)
    }

    pub fn has(&self, onion: Onion) -> bool {
        self.onions.iter().any(|m| m.contains(onion))
    }

    fn single(&self, onion: Onion) -> RewriteCtx {
        RewriteCtx {
            onions: vec![onion.mask()],
            agg: self.agg,
        }
    }

    fn first_onion(&self) -> Option<Onion> {
        self.onions.iter().find_map(|m| m.pick_one())
    }

    /// Candidate onions in ranked order.
    fn onion_seq(&self) -> Vec<Onion> {
        self.onions
            .iter()
            .flat_map(|m| m.to_seq())
            .dedup()
            .collect()
    }
}

pub(crate) enum Rewritten {
    /// Fully answerable server-side.
    Server { expr: Expr, onion: OnionType },
    /// Partially or wholly client-side: the server-answerable conjuncts stay
    /// as a residual filter, the rest merges into one client computation.
    Client {
        server: Option<Expr>,
        comp: ClientComputation,
    },
}

impl Generator<'_> {
    /// Split top-level conjunctions and rewrite each conjunct
    /// independently; refold what the server can answer.
    pub(crate) fn rewrite_filter(
        &mut self,
        st: &mut StmtCtx,
        e: &Expr,
        agg: bool,
    ) -> Result<Rewritten> {
        let rctx = RewriteCtx {
            onions: vec![Onion::Plain.mask()],
            agg,
        };
        let mut server_parts = Vec::new();
        let mut client_parts: Vec<ClientComputation> = Vec::new();
        for conjunct in flatten_and(e) {
            match self.do_transform_server(st, conjunct, &rctx)? {
                Some((expr, _)) => server_parts.push(expr),
                None => {
                    log::debug!(
                        "conjunct `{}` not answerable server-side; going residual",
                        codegen::write_expr(conjunct)
                    );
                    client_parts.push(self.build_residual(st, conjunct, agg)?);
                }
            }
        }

        let server = fold_and(server_parts);
        match client_parts.into_iter().reduce(merge_conjunctions) {
            None => Ok(Rewritten::Server {
                expr: server.expect("conjunction cannot be empty"),
                onion: OnionType::new(Onion::Plain),
            }),
            Some(comp) => Ok(Rewritten::Client { server, comp }),
        }
    }

    /// Per-conjunct top-down transform against the table of supported node
    /// shapes. `None` is a recoverable bailout; `Err` is a hard invariant
    /// violation.
    pub(crate) fn do_transform_server(
        &mut self,
        st: &mut StmtCtx,
        e: &Expr,
        rctx: &RewriteCtx,
    ) -> Result<Option<(Expr, OnionType)>> {
        use ExprKind::*;
        let plain = OnionType::new(Onion::Plain);
        Ok(match &e.kind {
            And(l, r) | Or(l, r) if rctx.in_clear() => {
                let l = self.do_transform_server(st, l, &rctx.single(Onion::Plain))?;
                let r = self.do_transform_server(st, r, &rctx.single(Onion::Plain))?;
                match (l, r) {
                    (Some((l, _)), Some((r, _))) => {
                        let kind = match &e.kind {
                            And(..) => And(Box::new(l), Box::new(r)),
                            _ => Or(Box::new(l), Box::new(r)),
                        };
                        Some((kind.into(), plain))
                    }
                    _ => None,
                }
            }
            Not(x) => match rctx.in_clear() {
                true => self
                    .do_transform_server(st, x, &rctx.single(Onion::Plain))?
                    .map(|(x, _)| (Not(Box::new(x)).into(), plain)),
                false => None,
            },
            Cmp { op, left, right } if rctx.in_clear() => {
                // the try-order is load-bearing: first onion that succeeds
                // on both sides wins, so plans stay deterministic
                let order: &[Onion] = if op.is_equality() {
                    &[Onion::Plain, Onion::Det, Onion::Ope]
                } else {
                    &[Onion::Plain, Onion::Ope]
                };
                let mut result = None;
                for onion in order {
                    let l = self.rewrite_operand(st, left, *onion, rctx.agg)?;
                    let r = self.rewrite_operand(st, right, *onion, rctx.agg)?;
                    if let (Some(l), Some(r)) = (l, r) {
                        result = Some((
                            Cmp {
                                op: *op,
                                left: Box::new(l),
                                right: Box::new(r),
                            }
                            .into(),
                            plain,
                        ));
                        break;
                    }
                }
                result
            }
            Like { expr, pattern } if rctx.in_clear() => {
                let l = self.rewrite_operand(st, expr, Onion::Swp, rctx.agg)?;
                let r = self.rewrite_operand(st, pattern, Onion::Swp, rctx.agg)?;
                match (l, r) {
                    (Some(l), Some(r)) => Some((
                        FuncCall {
                            name: "searchSWP".to_string(),
                            args: vec![l, r, Literal(crate::ast::Literal::Null).into()],
                        }
                        .into(),
                        plain,
                    )),
                    _ => None,
                }
            }
            In { expr, list } if rctx.in_clear() => {
                let mut result = None;
                for onion in [Onion::Det, Onion::Ope] {
                    let lhs = self.rewrite_operand(st, expr, onion, rctx.agg)?;
                    let items: Option<Vec<Expr>> = list
                        .iter()
                        .map(|item| self.rewrite_operand(st, item, onion, rctx.agg))
                        .try_collect::<_, Vec<_>, crate::Error>()?
                        .into_iter()
                        .collect();
                    if let (Some(lhs), Some(items)) = (lhs, items) {
                        result = Some((
                            In {
                                expr: Box::new(lhs),
                                list: items,
                            }
                            .into(),
                            plain,
                        ));
                        break;
                    }
                }
                result
            }
            Exists(sub) if rctx.in_clear() => {
                match self.plan_pure_subselect(st, sub, &EncContext::PreserveCardinality) {
                    Some(stmt) => Some((SqlExists(Box::new(stmt)).into(), plain)),
                    None => None,
                }
            }
            Agg {
                func: AggFunc::CountStar,
                ..
            } if rctx.in_clear() && rctx.agg => Some((e.clone(), plain)),
            Agg {
                func: AggFunc::Count,
                arg: Some(arg),
            } if rctx.in_clear() && rctx.agg => {
                let mut result = None;
                for onion in OnionMask::countable().to_seq() {
                    if let Some((arg, _)) =
                        self.do_transform_server(st, arg, &rctx.single(onion))?
                    {
                        result = Some((
                            Agg {
                                func: AggFunc::Count,
                                arg: Some(Box::new(arg)),
                            }
                            .into(),
                            plain,
                        ));
                        break;
                    }
                }
                result
            }
            Agg {
                func: func @ (AggFunc::Min | AggFunc::Max),
                arg: Some(arg),
            } if rctx.has(Onion::Ope) && rctx.agg => self
                .do_transform_server(st, arg, &rctx.single(Onion::Ope))?
                .map(|(arg, _)| {
                    (
                        Agg {
                            func: *func,
                            arg: Some(Box::new(arg)),
                        }
                        .into(),
                        OnionType::new(Onion::Ope),
                    )
                }),
            Agg {
                func: AggFunc::Sum,
                arg: Some(arg),
            } if rctx.agg => {
                let mut result = None;
                if rctx.in_clear() {
                    result = self
                        .do_transform_server(st, arg, &rctx.single(Onion::Plain))?
                        .map(|(arg, _)| {
                            (
                                Agg {
                                    func: AggFunc::Sum,
                                    arg: Some(Box::new(arg)),
                                }
                                .into(),
                                plain,
                            )
                        });
                }
                if result.is_none() && rctx.has(Onion::Hom) {
                    result = self
                        .do_transform_server(st, arg, &rctx.single(Onion::Hom))?
                        .map(|(arg, _)| {
                            (
                                FuncCall {
                                    name: "hom_agg".to_string(),
                                    args: vec![arg],
                                }
                                .into(),
                                OnionType::new(Onion::Hom),
                            )
                        });
                }
                result
            }
            Agg {
                func: AggFunc::Avg,
                arg: Some(arg),
            } if rctx.in_clear() && rctx.agg => self
                .do_transform_server(st, arg, &rctx.single(Onion::Plain))?
                .map(|(arg, _)| {
                    (
                        Agg {
                            func: AggFunc::Avg,
                            arg: Some(Box::new(arg)),
                        }
                        .into(),
                        plain,
                    )
                }),
            Case { branches, default } => {
                let mut conditions = Vec::new();
                for b in branches {
                    match self.do_transform_server(st, &b.condition, &rctx.single(Onion::Plain))? {
                        Some((c, _)) => conditions.push(c),
                        None => return Ok(None),
                    }
                }
                // all branches must come back under one onion; the first
                // onion in the context that fits every branch wins
                let mut result = None;
                'onions: for onion in rctx.onion_seq() {
                    let mut values = Vec::new();
                    for b in branches {
                        match self.do_transform_server(st, &b.value, &rctx.single(onion))? {
                            Some((v, _)) => values.push(v),
                            None => continue 'onions,
                        }
                    }
                    let default = match default {
                        Some(d) => {
                            match self.do_transform_server(st, d, &rctx.single(onion))? {
                                Some((d, _)) => Some(Box::new(d)),
                                None => continue 'onions,
                            }
                        }
                        None => None,
                    };
                    result = Some((
                        Case {
                            branches: conditions
                                .iter()
                                .zip(values)
                                .map(|(condition, value)| CaseBranch {
                                    condition: condition.clone(),
                                    value,
                                })
                                .collect(),
                            default,
                        }
                        .into(),
                        OnionType::new(onion),
                    ));
                    break;
                }
                result
            }
            Literal(_) => {
                let onion = match rctx.first_onion() {
                    Some(o) => o,
                    None => return Ok(None),
                };
                self.get_supported_expr(st, e, onion.mask())
            }
            DependentPlaceholder(i) => {
                let onion = match rctx.first_onion() {
                    Some(o) => o,
                    None => return Ok(None),
                };
                st.placeholder_onions.insert(*i, onion);
                Some((e.clone(), OnionType::new(onion)))
            }
            // other field idents and opaque expressions: first onion in the
            // context with a stored representation
            _ => {
                let mut result = None;
                for onion in rctx.onion_seq() {
                    if onion == Onion::HomRowDesc {
                        if let Some((expr, _)) = self.get_supported_hom_row_desc_expr(st, e) {
                            result = Some((expr, OnionType::new(Onion::HomRowDesc)));
                            break;
                        }
                    } else if let Some(hit) =
                        self.get_supported_expr_constraint_aware(st, e, onion.mask())
                    {
                        result = Some(hit);
                        break;
                    }
                }
                result
            }
        })
    }

    /// An operand of a comparison: subselects are planned under a
    /// single-onion EncProj and accepted only as pure `RemoteSql`; anything
    /// else goes through the regular transform.
    fn rewrite_operand(
        &mut self,
        st: &mut StmtCtx,
        e: &Expr,
        onion: Onion,
        agg: bool,
    ) -> Result<Option<Expr>> {
        if let ExprKind::Subselect(sub) = &e.kind {
            let enc = EncContext::EncProj {
                onions: sub.projections.iter().map(|_| onion.mask()).collect(),
                require: true,
            };
            return Ok(self
                .plan_pure_subselect(st, sub, &enc)
                .map(|stmt| ExprKind::SqlSubselect(Box::new(stmt)).into()));
        }
        let rctx = RewriteCtx {
            onions: vec![onion.mask()],
            agg,
        };
        Ok(self
            .do_transform_server(st, e, &rctx)?
            .map(|(expr, _)| expr))
    }

    /// Recursively plan a subselect; inline only a pure `RemoteSql`,
    /// adopting its sub-plans as siblings. A planning error means the
    /// candidate onion set cannot answer the subselect under this
    /// requirement, which is a bailout here, not a hard failure.
    fn plan_pure_subselect(
        &mut self,
        st: &mut StmtCtx,
        sub: &crate::ast::SelectStmt,
        enc: &EncContext,
    ) -> Option<crate::codegen::SqlSelect> {
        let (plan, placeholders) = self.plan_stmt(sub, enc).ok()?;
        match plan {
            PlanNode::RemoteSql { stmt, subplans, .. } => {
                st.placeholder_onions.extend(placeholders);
                st.subplans.extend(subplans);
                Some(stmt)
            }
            _ => None,
        }
    }
}

pub(super) fn flatten_and(e: &Expr) -> Vec<&Expr> {
    match &e.kind {
        ExprKind::And(l, r) => {
            let mut parts = flatten_and(l);
            parts.extend(flatten_and(r));
            parts
        }
        _ => vec![e],
    }
}

pub(super) fn fold_and(parts: Vec<Expr>) -> Option<Expr> {
    parts
        .into_iter()
        .reduce(|a, b| ExprKind::And(Box::new(a), Box::new(b)).into())
}
