//! Onion-set generation: walk a statement with the same traversal table as
//! the server rewriter, but collect the onion requirements a candidate set
//! must satisfy instead of rewriting.

use std::collections::BTreeMap;

use itertools::Itertools;

use super::{EncContext, Generator, generate_plan};
use crate::ast::{
    AggFunc, Expr, ExprKind, Projection, RelationKind, SelectStmt, collect_subselects,
};
use crate::onion::{Onion, OnionMask, OnionSet};
use crate::plan::PlanNode;
use crate::scope::ScopeArena;
use crate::utils::NameGenerator;
use crate::Result;

/// One onion requirement: store `canonical` of `table` under `onion`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OnionReq {
    pub table: String,
    pub canonical: Expr,
    pub onion: Onion,
}

/// Inputs for the external cost ranker, carried alongside each candidate
/// plan.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateContext {
    pub onion_set: OnionSet,
    pub row_counts: BTreeMap<String, u64>,
}

impl Generator<'_> {
    /// The minimal sets of `(subexpr, onion)` constraints sufficient to
    /// answer `e` server-side. Multiple alternative sets propagate through
    /// the comparison forms (equality can go DET or OPE); an empty result
    /// means no server-side option exists for this subtree.
    pub(crate) fn get_potential_crypto_opts(
        &self,
        e: &Expr,
        allowed: OnionMask,
    ) -> Vec<Vec<OnionReq>> {
        use ExprKind::*;
        let unit = || vec![Vec::new()];
        match &e.kind {
            Literal(_) | DependentPlaceholder(_) | Subselect(_) | Exists(_) => unit(),
            And(l, r) => {
                // conjuncts split server/client independently, so a dead
                // side doesn't kill the other side's requirements
                cross(
                    or_unit(self.get_potential_crypto_opts(l, allowed)),
                    or_unit(self.get_potential_crypto_opts(r, allowed)),
                )
            }
            Or(l, r) => cross(
                self.get_potential_crypto_opts(l, allowed),
                self.get_potential_crypto_opts(r, allowed),
            ),
            Not(x) => self.get_potential_crypto_opts(x, Onion::Plain.mask()),
            Cmp { op, left, right } => {
                let onions: &[Onion] = if op.is_equality() {
                    &[Onion::Det, Onion::Ope]
                } else {
                    &[Onion::Ope]
                };
                let mut alternatives = Vec::new();
                for onion in onions {
                    alternatives.extend(cross(
                        self.get_potential_crypto_opts(left, onion.mask()),
                        self.get_potential_crypto_opts(right, onion.mask()),
                    ));
                }
                alternatives
            }
            Like { expr, pattern } => cross(
                self.get_potential_crypto_opts(expr, Onion::Swp.mask()),
                self.get_potential_crypto_opts(pattern, Onion::Swp.mask()),
            ),
            In { expr, list } => {
                let mut alternatives = Vec::new();
                for onion in [Onion::Det, Onion::Ope] {
                    let mut acc = self.get_potential_crypto_opts(expr, onion.mask());
                    for item in list {
                        acc = cross(acc, self.get_potential_crypto_opts(item, onion.mask()));
                    }
                    alternatives.extend(acc);
                }
                alternatives
            }
            Case { branches, default } => {
                let mut acc = unit();
                for b in branches {
                    acc = cross(
                        acc,
                        self.get_potential_crypto_opts(&b.condition, Onion::Plain.mask()),
                    );
                    acc = cross(acc, self.get_potential_crypto_opts(&b.value, allowed));
                }
                if let Some(d) = default {
                    acc = cross(acc, self.get_potential_crypto_opts(d, allowed));
                }
                acc
            }
            Agg {
                func: AggFunc::CountStar,
                ..
            } => unit(),
            Agg {
                func: AggFunc::Sum | AggFunc::Avg,
                arg: Some(arg),
            } => match self.find_onionable_expr(arg) {
                Some(target) => vec![vec![OnionReq {
                    table: target.table,
                    canonical: target.canonical,
                    onion: Onion::HomRowDesc,
                }]],
                None => Vec::new(),
            },
            Agg {
                func: AggFunc::Min | AggFunc::Max,
                arg: Some(arg),
            } => self.get_potential_crypto_opts(arg, Onion::Ope.mask()),
            Agg {
                func: AggFunc::Count,
                arg: Some(arg),
            } => OnionMask::countable()
                .to_seq()
                .into_iter()
                .flat_map(|onion| self.get_potential_crypto_opts(arg, onion.mask()))
                .collect(),
            // opaque: request the expression itself under each usable onion
            _ => match self.find_onionable_expr(e) {
                Some(target) => allowed
                    .to_seq()
                    .into_iter()
                    .filter(|o| *o != Onion::Plain)
                    .map(|onion| {
                        vec![OnionReq {
                            table: target.table.clone(),
                            canonical: target.canonical.clone(),
                            onion,
                        }]
                    })
                    .collect(),
                None => Vec::new(),
            },
        }
    }
}

/// Cross product of two alternative lists; either side empty means no
/// option.
fn cross(a: Vec<Vec<OnionReq>>, b: Vec<Vec<OnionReq>>) -> Vec<Vec<OnionReq>> {
    let mut out = Vec::new();
    for x in &a {
        for y in &b {
            out.push([x.clone(), y.clone()].concat());
        }
    }
    out
}

fn or_unit(alternatives: Vec<Vec<OnionReq>>) -> Vec<Vec<OnionReq>> {
    if alternatives.is_empty() {
        vec![Vec::new()]
    } else {
        alternatives
    }
}

fn set_of_reqs(reqs: &[OnionReq]) -> OnionSet {
    let mut set = OnionSet::new();
    for req in reqs {
        match req.onion {
            Onion::HomRowDesc => set.add_packed_hom_to_last_group(&req.table, &req.canonical),
            onion => set.add(&req.table, &req.canonical, onion),
        }
    }
    set
}

/// Enumerate the onion requirements of every clause of `stmt` (and its
/// subqueries); the output is the union of all candidate sets from all
/// clauses.
pub fn generate_onion_sets(arena: &ScopeArena, stmt: &SelectStmt) -> Result<Vec<OnionSet>> {
    let empty = OnionSet::new();
    let generator = Generator {
        arena,
        oset: &empty,
        mat_names: NameGenerator::new("mat"),
    };
    let mut sets = Vec::new();
    collect_sets(&generator, stmt, &mut sets);
    Ok(sets.into_iter().unique_by(|s| s.to_string()).collect())
}

fn collect_sets(generator: &Generator, stmt: &SelectStmt, sets: &mut Vec<OnionSet>) {
    let mut clause = |e: &Expr, allowed: OnionMask| {
        for alternative in generator.get_potential_crypto_opts(e, allowed) {
            if !alternative.is_empty() {
                sets.push(set_of_reqs(&alternative));
            }
        }
    };

    let mut exprs = Vec::new();
    for p in &stmt.projections {
        if let Projection::Expr { expr, .. } = p {
            clause(expr, OnionMask::all());
            exprs.push(expr);
        }
    }
    if let Some(f) = &stmt.filter {
        clause(f, Onion::Plain.mask());
        exprs.push(f);
    }
    if let Some(g) = &stmt.group_by {
        for k in &g.keys {
            clause(k, OnionMask::comparable());
            exprs.push(k);
        }
        if let Some(h) = &g.having {
            clause(h, Onion::Plain.mask());
            exprs.push(h);
        }
    }
    for s in &stmt.order_by {
        clause(&s.column, OnionMask::inequal_comparable());
        exprs.push(&s.column);
    }
    drop(clause);

    // subquery relations and embedded subselects contribute their own
    // clauses
    for rel in &stmt.relations {
        if let RelationKind::Subquery(sub) = &rel.kind {
            collect_sets(generator, sub, sets);
        }
    }
    for e in exprs {
        for (sub, _) in collect_subselects(e) {
            collect_sets(generator, sub, sets);
        }
    }
}

/// Candidate enumeration: power set of the generated onion sets (minus the
/// empty subset), merged, deduplicated, completed against the schema, and
/// planned. Plans are deduplicated structurally; infeasible candidates are
/// skipped.
pub fn generate_candidate_plans(
    arena: &ScopeArena,
    stmt: &SelectStmt,
) -> Result<Vec<(PlanNode, EstimateContext)>> {
    let mut sets = generate_onion_sets(arena, stmt)?;
    log::debug!("enumerating {} onion sets", sets.len());
    if sets.len() > 16 {
        log::warn!("truncating candidate enumeration to the first 16 onion sets");
        sets.truncate(16);
    }

    let mut merged: Vec<OnionSet> = Vec::new();
    for bits in 1u64..(1u64 << sets.len()) {
        let subset = sets
            .iter()
            .enumerate()
            .filter(|(i, _)| bits & (1 << i) != 0)
            .map(|(_, s)| s)
            .fold(OnionSet::new(), |acc, s| acc.merge(s));
        if !merged.contains(&subset) {
            merged.push(subset);
        }
    }
    if merged.is_empty() {
        // a bare statement still plans against DET-completed storage
        merged.push(OnionSet::new());
    }

    let mut row_counts = BTreeMap::new();
    collect_row_counts(arena, stmt, &mut row_counts);

    let mut plans: Vec<(PlanNode, EstimateContext)> = Vec::new();
    for mut set in merged {
        set.complete(&arena.defns);
        let plan = match generate_plan(arena, stmt, &set, &EncContext::PreserveOriginal) {
            Ok(plan) => plan,
            Err(e) => {
                log::debug!("candidate onion set infeasible: {e}");
                continue;
            }
        };
        if plans.iter().any(|(p, _)| *p == plan) {
            continue;
        }
        plans.push((
            plan,
            EstimateContext {
                onion_set: set,
                row_counts: row_counts.clone(),
            },
        ));
    }
    Ok(plans)
}

fn collect_row_counts(arena: &ScopeArena, stmt: &SelectStmt, out: &mut BTreeMap<String, u64>) {
    for rel in &stmt.relations {
        match &rel.kind {
            RelationKind::Table(t) => {
                if let Some(n) = arena.stats.row_count(t) {
                    out.insert(t.clone(), n);
                }
            }
            RelationKind::Subquery(sub) => collect_row_counts(arena, sub, out),
        }
    }
}
