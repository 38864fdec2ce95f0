//! Plan generation.
//!
//! The generator takes a resolved statement, a candidate onion set and an
//! output-encryption requirement, and synthesizes a plan tree: a rewritten
//! server-side statement at the leaves, wrapped by the client-side operators
//! that finish whatever the server cannot do under the chosen onions.

mod classify;
mod onion_sets;
mod residual;
mod server;

use std::collections::{BTreeMap, HashMap};

pub use onion_sets::{EstimateContext, generate_candidate_plans, generate_onion_sets};
pub(crate) use residual::{ClientComputation, ResidualProj, ResidualSubquery};
pub(crate) use server::{RewriteCtx, Rewritten};

use itertools::Itertools;

use crate::ast::{
    ColumnSort, Expr, ExprKind, FieldIdent, Projection, RelationKind, SelectStmt, SortDirection,
    top_down_transform,
};
use crate::codegen::{SqlFrom, SqlSelect, write_expr};
use crate::onion::{Onion, OnionMask, OnionSet};
use crate::plan::{PlanNode, PlanSubquery, PosDesc, PosOnion, SortKey, TransformItem};
use crate::scope::{ScopeArena, ScopeId, Symbol};
use crate::utils::NameGenerator;
use crate::{Error, Result};

/// Output-encryption requirement for one plan generation.
#[derive(Debug, Clone, PartialEq)]
pub enum EncContext {
    /// The output tuple descriptor must be fully PLAIN.
    PreserveOriginal,
    /// The descriptor may stay encrypted; only the row count must match.
    PreserveCardinality,
    /// Descriptor length must equal the statement's projection count; each
    /// output must (`require`) or should be in one of the bits of
    /// `onions[i]`.
    EncProj { onions: Vec<OnionMask>, require: bool },
}

/// Generate an executable plan for `stmt` against `onion_set`.
pub fn generate_plan(
    arena: &ScopeArena,
    stmt: &SelectStmt,
    onion_set: &OnionSet,
    enc: &EncContext,
) -> Result<PlanNode> {
    let mut generator = Generator {
        arena,
        oset: onion_set,
        mat_names: NameGenerator::new("mat"),
    };
    let (plan, _) = generator.plan_stmt(stmt, enc)?;
    plan.validate()?;
    Ok(plan)
}

pub(crate) fn enc_tbl_name(table: &str) -> String {
    format!("{table}$enc")
}

pub(crate) struct Generator<'a> {
    pub arena: &'a ScopeArena,
    pub oset: &'a OnionSet,
    mat_names: NameGenerator,
}

/// One inlined or materialized subquery relation, as seen by the enclosing
/// statement.
pub(crate) struct SubqueryRel {
    pub columns: Vec<SubqueryCol>,
}

pub(crate) struct SubqueryCol {
    pub logical: String,
    pub server_name: String,
    pub desc: PosDesc,
}

/// Mutable scratch for one statement; lives for the duration of one
/// `plan_stmt` call and is discarded.
pub(crate) struct StmtCtx {
    pub ctx: ScopeId,
    pub agg: bool,
    /// GROUP BY present; residuals over projections and HAVING then run
    /// once per group.
    pub grouped: bool,
    pub rel_count: usize,
    pub subquery_rels: BTreeMap<String, SubqueryRel>,
    /// Chosen onion per group-by key, keyed by canonical text; consulted by
    /// constraint-aware projection of fields inside an aggregate context.
    pub group_key_onions: HashMap<String, Onion>,
    /// Per table, group ids ordered by ascending total usage count.
    pub hom_prefs: HashMap<String, Vec<usize>>,
    pub placeholder_onions: BTreeMap<usize, Onion>,
    pub final_projs: FinalProjs,
    pub subplans: Vec<PlanNode>,
    alias_names: NameGenerator,
}

impl StmtCtx {
    fn new(ctx: ScopeId) -> Self {
        StmtCtx {
            ctx,
            agg: false,
            grouped: false,
            rel_count: 0,
            subquery_rels: BTreeMap::new(),
            group_key_onions: HashMap::new(),
            hom_prefs: HashMap::new(),
            placeholder_onions: BTreeMap::new(),
            final_projs: FinalProjs::default(),
            subplans: Vec::new(),
            alias_names: NameGenerator::new("h"),
        }
    }
}

/// The deduplicated sequence of server-side projections; content-addressed
/// inserts return the canonical index.
#[derive(Default)]
pub(crate) struct FinalProjs {
    items: Vec<FinalProj>,
    cache: HashMap<String, usize>,
}

pub(crate) struct FinalProj {
    pub server: Expr,
    pub alias: Option<String>,
    pub desc: PosDesc,
}

impl FinalProjs {
    fn insert(&mut self, server: Expr, desc: PosDesc, names: &mut NameGenerator) -> usize {
        let key = write_expr(&server);
        if let Some(i) = self.cache.get(&key) {
            return *i;
        }
        let alias = match &server.kind {
            ExprKind::Field(_) => None,
            _ => Some(names.gen()),
        };
        self.items.push(FinalProj {
            server,
            alias,
            desc,
        });
        self.cache.insert(key, self.items.len() - 1);
        self.items.len() - 1
    }
}

/// A registered client computation: its slots remapped into `final_projs`
/// indices.
struct MappedCc {
    cc: ClientComputation,
    main: Vec<usize>,
    sub: Vec<usize>,
}

enum ProjOut {
    Pass(usize),
    Compute(MappedCc),
}

enum OrderKey {
    /// Pushed to the server; the expr also gets projected.
    Server(Expr),
    /// Sorts on an original output position.
    OutputPos(usize),
    /// Sorts on a projected server column passed through as an auxiliary
    /// position.
    AuxPass(usize),
    /// Needs a client-computed auxiliary column.
    Computed(MappedCc),
}

impl Generator<'_> {
    pub(crate) fn plan_stmt(
        &mut self,
        stmt: &SelectStmt,
        enc: &EncContext,
    ) -> Result<(PlanNode, BTreeMap<usize, Onion>)> {
        let ctx = stmt
            .ctx
            .ok_or_else(|| Error::new_assert("planning an unbound statement"))?;

        if stmt.projections.iter().any(|p| p.is_star()) {
            return Err(Error::new_simple(
                "wildcard projections are not supported in plan output",
            ));
        }
        if let EncContext::EncProj { onions, .. } = enc {
            if onions.len() != stmt.projections.len() {
                return Err(Error::new_assert(
                    "EncProj width differs from projection count",
                ));
            }
        }

        let mut st = StmtCtx::new(ctx);
        st.rel_count = stmt.relations.len();
        st.grouped = stmt.group_by.is_some();
        st.agg = stmt.group_by.is_some()
            || stmt.projections.iter().any(|p| match p {
                Projection::Expr { expr, .. } => expr.contains_aggregate(),
                Projection::Star => false,
            });

        // (1) plan every subquery relation recursively, then (2) rewrite the
        // FROM clause to encrypted table names
        let mut from = Vec::new();
        for rel in &stmt.relations {
            match &rel.kind {
                RelationKind::Table(t) => {
                    from.push(SqlFrom::Table {
                        name: enc_tbl_name(t),
                        alias: (rel.alias != *t).then(|| rel.alias.clone()),
                    });
                }
                RelationKind::Subquery(sub) => {
                    self.plan_subquery_relation(&mut st, stmt, &rel.alias, sub, &mut from)?;
                }
            }
        }

        // (3) HOM-group preferences from SUM/AVG arguments
        self.scan_hom_preferences(&mut st, stmt);

        // (4) clause rewriting: WHERE, GROUP BY + HAVING, ORDER BY, LIMIT,
        // projections
        let mut server_where = None;
        let mut local_filters = Vec::new();
        if let Some(filter) = &stmt.filter {
            match self.rewrite_filter(&mut st, filter, false)? {
                Rewritten::Server { expr, .. } => server_where = Some(expr),
                Rewritten::Client { server, comp } => {
                    server_where = server;
                    local_filters.push(comp);
                }
            }
        }

        let mut server_group_by = Vec::new();
        let mut server_having = None;
        let mut local_group_filters = Vec::new();
        if let Some(group_by) = &stmt.group_by {
            for key in &group_by.keys {
                let resolved = self.arena.resolve_aliases(key.clone());
                let Some((server, onion_ty)) =
                    self.get_supported_expr(&st, &resolved, OnionMask::comparable())
                else {
                    return Err(Error::new_simple(format!(
                        "no supported onion for GROUP BY key `{}`",
                        write_expr(key)
                    )));
                };
                if let Some((_, key_str)) = self.canonical_key(&resolved) {
                    st.group_key_onions.insert(key_str, onion_ty.onion);
                }
                server_group_by.push(server);
            }
            if let Some(having) = &group_by.having {
                match self.rewrite_filter(&mut st, having, true)? {
                    Rewritten::Server { expr, .. } => server_having = Some(expr),
                    Rewritten::Client { server, comp } => {
                        server_having = server;
                        local_group_filters.push(comp);
                    }
                }
            }
        }

        // projections before order keys, so order keys can reference output
        // positions by name
        let allowed_per_proj: Vec<OnionMask> = match enc {
            EncContext::EncProj { onions, .. } => onions.clone(),
            _ => stmt.projections.iter().map(|_| OnionMask::all()).collect(),
        };
        let mut outputs = Vec::new();
        for (proj, allowed) in stmt.projections.iter().zip(&allowed_per_proj) {
            let (expr, _) = proj.as_expr().expect("no wildcards past the check above");
            let rctx = RewriteCtx {
                onions: vec![*allowed],
                agg: st.agg,
            };
            match self.do_transform_server(&mut st, expr, &rctx)? {
                Some((server, onion_ty)) => {
                    let desc = PosDesc {
                        onion: PosOnion::Onion(onion_ty.onion),
                        vector_ctx: onion_ty.vector_ctx,
                    };
                    let slot = st.final_projs.insert(server, desc, &mut st.alias_names);
                    outputs.push(ProjOut::Pass(slot));
                }
                None => {
                    log::debug!(
                        "projection `{}` not answerable server-side; going residual",
                        write_expr(expr)
                    );
                    let grouped = st.grouped;
                    let cc = self.build_residual(&mut st, expr, grouped)?;
                    let mapped = register_cc(&mut st, cc);
                    outputs.push(ProjOut::Compute(mapped));
                }
            }
        }

        let mut server_order = Vec::new();
        let mut local_order: Vec<(OrderKey, SortDirection)> = Vec::new();
        let mut any_local_key = false;
        let mut keys = Vec::new();
        for sort in &stmt.order_by {
            keys.push(self.resolve_order_key(&mut st, stmt, sort)?);
        }
        for (key, _) in &keys {
            if !matches!(key, OrderKey::Server(_)) {
                any_local_key = true;
            }
        }
        if any_local_key {
            // a partially-local sort is useless; evaluate the whole order
            // client-side
            for (key, dir) in keys {
                let key = match key {
                    OrderKey::Server(expr) => {
                        // demote: sort on the projected column instead
                        let slot = st
                            .final_projs
                            .items
                            .iter()
                            .position(|p| p.server == expr)
                            .expect("server order keys are always projected");
                        order_key_for_slot(slot, &outputs)
                    }
                    key => key,
                };
                local_order.push((key, dir));
            }
        } else {
            for (key, dir) in keys {
                if let OrderKey::Server(expr) = key {
                    server_order.push((expr, dir));
                }
            }
        }

        let local_limit_needed =
            !local_filters.is_empty() || !local_group_filters.is_empty() || !local_order.is_empty();
        let (server_limit, local_limit) = match stmt.limit {
            Some(n) if local_limit_needed => (None, Some(n)),
            Some(n) => (Some(n), None),
            None => (None, None),
        };

        // (5) stage-wise assembly
        let filters = local_filters
            .into_iter()
            .map(|cc| register_cc(&mut st, cc))
            .collect_vec();
        let group_filters = local_group_filters
            .into_iter()
            .map(|cc| register_cc(&mut st, cc))
            .collect_vec();

        let base = SqlSelect {
            projections: st
                .final_projs
                .items
                .iter()
                .map(|p| (p.server.clone(), p.alias.clone()))
                .collect(),
            from,
            selection: server_where,
            group_by: server_group_by,
            having: server_having,
            order_by: server_order,
            limit: server_limit,
        };
        let tuple_desc = st.final_projs.items.iter().map(|p| p.desc.clone()).collect();
        let mut cur = PlanNode::RemoteSql {
            stmt: base,
            tuple_desc,
            subplans: std::mem::take(&mut st.subplans),
        };

        cur = self.assemble_stages(cur, outputs, filters, group_filters, local_order, enc)?;

        if let Some(n) = local_limit {
            cur = PlanNode::LocalLimit {
                n,
                child: Box::new(cur),
            };
        }

        cur = finalize_enc(cur, enc)?;

        Ok((cur, st.placeholder_onions))
    }

    /// Plan a FROM-clause subquery with a demand-computed EncProj vector and
    /// inline it (pure `RemoteSql`) or materialize it under a synthetic
    /// name.
    fn plan_subquery_relation(
        &mut self,
        st: &mut StmtCtx,
        outer: &SelectStmt,
        alias: &str,
        sub: &SelectStmt,
        from: &mut Vec<SqlFrom>,
    ) -> Result<()> {
        let demands = self.collect_enc_demands(outer, sub)?;
        let (plan, placeholders) = self.plan_stmt(
            sub,
            &EncContext::EncProj {
                onions: demands,
                require: false,
            },
        )?;
        st.placeholder_onions.extend(placeholders);

        let logical_names: Vec<String> = sub
            .ctx
            .map(|c| {
                self.arena
                    .get(c)
                    .projections
                    .iter()
                    .filter_map(|d| d.as_named().map(|(name, ..)| name.clone()))
                    .collect()
            })
            .unwrap_or_default();

        match plan {
            PlanNode::RemoteSql {
                mut stmt,
                tuple_desc,
                subplans,
            } => {
                // make every inner projection addressable from the outer
                // statement
                let mut columns = Vec::new();
                for (i, (proj, proj_alias)) in stmt.projections.iter_mut().enumerate() {
                    let server_name = if let Some(a) = proj_alias {
                        a.clone()
                    } else if let ExprKind::Field(f) = &proj.kind {
                        f.name.clone()
                    } else {
                        let name = format!("c{i}");
                        *proj_alias = Some(name.clone());
                        name
                    };
                    columns.push(SubqueryCol {
                        logical: logical_names.get(i).cloned().unwrap_or_else(|| server_name.clone()),
                        server_name,
                        desc: tuple_desc[i].clone(),
                    });
                }
                log::debug!("inlining subquery relation `{alias}` as nested server SQL");
                from.push(SqlFrom::Subquery {
                    stmt: Box::new(stmt),
                    alias: alias.to_string(),
                });
                st.subplans.extend(subplans);
                st.subquery_rels
                    .insert(alias.to_string(), SubqueryRel { columns });
            }
            plan => {
                let name = self.mat_names.gen();
                log::debug!("materializing subquery relation `{alias}` as `{name}`");
                let columns = plan
                    .tuple_desc()
                    .into_iter()
                    .enumerate()
                    .map(|(i, desc)| SubqueryCol {
                        logical: logical_names.get(i).cloned().unwrap_or_else(|| format!("c{i}")),
                        server_name: format!("c{i}"),
                        desc,
                    })
                    .collect();
                st.subplans.push(PlanNode::RemoteMaterialize {
                    name: name.clone(),
                    child: Box::new(plan),
                });
                from.push(SqlFrom::Table {
                    name,
                    alias: Some(alias.to_string()),
                });
                st.subquery_rels
                    .insert(alias.to_string(), SubqueryRel { columns });
            }
        }
        Ok(())
    }

    /// The OR of all onions the enclosing statement will request from each
    /// of the subquery's projections, via the same potential-crypto-opts
    /// traversal. Positions with no observed demand default to DET.
    fn collect_enc_demands(&mut self, outer: &SelectStmt, sub: &SelectStmt) -> Result<Vec<OnionMask>> {
        let mut reqs = Vec::new();
        let mut add = |gen: &mut Generator, e: &Expr, allowed: OnionMask| {
            for alternative in gen.get_potential_crypto_opts(e, allowed) {
                reqs.extend(alternative);
            }
        };

        for p in &outer.projections {
            if let Projection::Expr { expr, .. } = p {
                add(self, expr, OnionMask::all());
            }
        }
        if let Some(f) = &outer.filter {
            add(self, f, Onion::Plain.mask());
        }
        if let Some(g) = &outer.group_by {
            for k in &g.keys {
                add(self, k, OnionMask::comparable());
            }
            if let Some(h) = &g.having {
                add(self, h, Onion::Plain.mask());
            }
        }
        for s in &outer.order_by {
            add(self, &s.column, OnionMask::inequal_comparable());
        }

        let mut demands = Vec::new();
        for p in &sub.projections {
            let mut mask = OnionMask::EMPTY;
            if let Projection::Expr { expr, .. } = p {
                if let Some(target) = self.find_onionable_expr(expr) {
                    let key = write_expr(&target.canonical);
                    for req in &reqs {
                        if req.table == target.table && write_expr(&req.canonical) == key {
                            mask = mask | req.onion;
                        }
                    }
                }
            }
            if mask.is_empty() {
                mask = Onion::Det.mask();
            }
            demands.push(mask);
        }
        Ok(demands)
    }

    /// Walk SUM/AVG arguments and build, per table, an ordering over packed
    /// HOM group ids by ascending total usage count. `pick_one` tie-breaks
    /// consult it so the least-used group is preferred.
    fn scan_hom_preferences(&mut self, st: &mut StmtCtx, stmt: &SelectStmt) {
        let mut counts: HashMap<(String, usize), usize> = HashMap::new();
        let mut scan = |gen: &Generator, st: &StmtCtx, e: &Expr| {
            let mut stack = vec![e];
            while let Some(e) = stack.pop() {
                if let ExprKind::Agg {
                    func: crate::ast::AggFunc::Sum | crate::ast::AggFunc::Avg,
                    arg: Some(arg),
                } = &e.kind
                {
                    if let Some((_, descs)) = gen.get_supported_hom_row_desc_expr(st, arg) {
                        for d in descs {
                            *counts.entry((d.table, d.group)).or_default() += 1;
                        }
                    }
                }
                crate::ast::for_each_child(e, &mut |c| stack.push(c));
            }
        };

        for p in &stmt.projections {
            if let Projection::Expr { expr, .. } = p {
                scan(self, st, expr);
            }
        }
        if let Some(f) = &stmt.filter {
            scan(self, st, f);
        }
        if let Some(h) = stmt.group_by.as_ref().and_then(|g| g.having.as_ref()) {
            scan(self, st, h);
        }

        let mut by_table: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
        for ((table, group), count) in counts {
            by_table.entry(table).or_default().push((group, count));
        }
        for (table, mut groups) in by_table {
            groups.sort_by_key(|(group, count)| (*count, *group));
            st.hom_prefs
                .insert(table, groups.into_iter().map(|(g, _)| g).collect());
        }
    }

    fn resolve_order_key(
        &mut self,
        st: &mut StmtCtx,
        stmt: &SelectStmt,
        sort: &ColumnSort<Expr>,
    ) -> Result<(OrderKey, SortDirection)> {
        // a key naming a projection sorts that output position when it
        // cannot go server-side
        let projection_pos = match &sort.column.kind {
            ExprKind::Field(FieldIdent {
                symbol: Some(Symbol::Projection { name, ctx, .. }),
                ..
            }) => {
                let pos = self.arena.projection_pos(*ctx, name);
                if pos.is_none() {
                    return Err(Error::new_assert(format!(
                        "order-by projection `{name}` missing from projection list"
                    )));
                }
                pos
            }
            _ => None,
        };

        let resolved = self.arena.resolve_aliases(sort.column.clone());
        if let Some((server, onion_ty)) =
            self.get_supported_expr_constraint_aware(st, &resolved, OnionMask::inequal_comparable())
        {
            // project the key so downstream stages can still see it
            let desc = PosDesc::new(onion_ty.onion);
            st.final_projs
                .insert(server.clone(), desc, &mut st.alias_names);
            return Ok((OrderKey::Server(server), sort.direction));
        }

        if let Some(pos) = projection_pos {
            return Ok((OrderKey::OutputPos(pos), sort.direction));
        }
        // equal to some projected output expression?
        for (i, p) in stmt.projections.iter().enumerate() {
            if let Projection::Expr { expr, .. } = p {
                if *expr == sort.column {
                    return Ok((OrderKey::OutputPos(i), sort.direction));
                }
            }
        }

        log::debug!(
            "order-by key `{}` needs client evaluation",
            write_expr(&sort.column)
        );
        let cc = self.build_residual(st, &sort.column, st.grouped)?;
        let mapped = register_cc(st, cc);
        Ok((OrderKey::Computed(mapped), sort.direction))
    }

    /// Wrap the base plan in the local-operator stages: filters, group
    /// filters, transform (with decrypt), order-by, auxiliary projection.
    fn assemble_stages(
        &mut self,
        mut cur: PlanNode,
        outputs: Vec<ProjOut>,
        filters: Vec<MappedCc>,
        group_filters: Vec<MappedCc>,
        local_order: Vec<(OrderKey, SortDirection)>,
        enc: &EncContext,
    ) -> Result<PlanNode> {
        for mapped in filters {
            cur = wrap_decrypt(cur, decrypt_positions(&mapped));
            cur = PlanNode::LocalFilter {
                expr: mapped_expr(&mapped),
                orig_expr: mapped.cc.orig_expr.clone(),
                subqueries: mapped_subqueries(&mapped),
                child: Box::new(cur),
            };
        }
        for mapped in group_filters {
            cur = wrap_decrypt(cur, decrypt_positions(&mapped));
            cur = PlanNode::LocalGroupFilter {
                expr: mapped_expr(&mapped),
                orig_expr: mapped.cc.orig_expr.clone(),
                subqueries: mapped_subqueries(&mapped),
                child: Box::new(cur),
            };
        }

        let main_len = outputs.len();
        let mut ops: Vec<TransformItem> = Vec::new();
        let mut decrypt_for_transform: Vec<usize> = Vec::new();
        for out in &outputs {
            match out {
                ProjOut::Pass(slot) => {
                    if matches!(enc, EncContext::PreserveOriginal) {
                        decrypt_for_transform.push(*slot);
                    }
                    ops.push(TransformItem::Pass(*slot));
                }
                ProjOut::Compute(mapped) => {
                    decrypt_for_transform.extend(decrypt_positions(mapped));
                    ops.push(TransformItem::Compute(mapped_expr(mapped)));
                }
            }
        }

        // auxiliary columns for client order-by keys
        let mut sort_keys: Vec<SortKey> = Vec::new();
        for (key, direction) in &local_order {
            let pos = match key {
                OrderKey::OutputPos(p) => *p,
                OrderKey::AuxPass(slot) => {
                    ops.push(TransformItem::Pass(*slot));
                    ops.len() - 1
                }
                OrderKey::Computed(mapped) => {
                    let expr = mapped_expr(mapped);
                    match &expr.kind {
                        // a bare projected field only needs a pass-through
                        ExprKind::TuplePos(slot) => {
                            ops.push(TransformItem::Pass(*slot));
                        }
                        _ => {
                            decrypt_for_transform.extend(mapped.main.iter().copied());
                            ops.push(TransformItem::Compute(expr));
                        }
                    }
                    ops.len() - 1
                }
                OrderKey::Server(_) => unreachable!("server keys never reach local ordering"),
            };
            sort_keys.push(SortKey {
                pos,
                direction: *direction,
            });
        }

        let identity = ops.len() == cur.width()
            && ops
                .iter()
                .enumerate()
                .all(|(i, op)| matches!(op, TransformItem::Pass(p) if *p == i));
        let transformed = !identity;
        if transformed {
            cur = wrap_decrypt(cur, decrypt_for_transform);
            cur = PlanNode::LocalTransform {
                ops,
                child: Box::new(cur),
            };
        }

        if !sort_keys.is_empty() {
            // OPE-projected keys compare directly on ciphertext; everything
            // else must be decrypted before the sort
            let desc = cur.tuple_desc();
            let decrypt_keys = sort_keys
                .iter()
                .map(|k| k.pos)
                .filter(|p| !desc[*p].is_plain() && desc[*p].onion != PosOnion::Onion(Onion::Ope))
                .collect_vec();
            cur = wrap_decrypt(cur, decrypt_keys);
            cur = PlanNode::LocalOrderBy {
                keys: sort_keys,
                child: Box::new(cur),
            };
            if cur.width() > main_len {
                // project away the auxiliary sort columns
                cur = PlanNode::LocalTransform {
                    ops: (0..main_len).map(TransformItem::Pass).collect(),
                    child: Box::new(cur),
                };
            }
        }

        Ok(cur)
    }
}

fn order_key_for_slot(slot: usize, outputs: &[ProjOut]) -> OrderKey {
    outputs
        .iter()
        .position(|o| matches!(o, ProjOut::Pass(s) if *s == slot))
        .map(OrderKey::OutputPos)
        .unwrap_or(OrderKey::AuxPass(slot))
}

/// Insert a computation's server projections into the statement's final
/// projection sequence, remembering the slot remapping.
fn register_cc(st: &mut StmtCtx, cc: ClientComputation) -> MappedCc {
    let main = cc
        .projections
        .iter()
        .map(|p| {
            st.final_projs
                .insert(p.server.clone(), p.desc.clone(), &mut st.alias_names)
        })
        .collect();
    let sub = cc
        .subquery_projections
        .iter()
        .map(|p| {
            st.final_projs
                .insert(p.server.clone(), p.desc.clone(), &mut st.alias_names)
        })
        .collect();
    MappedCc { cc, main, sub }
}

/// The positions a computation needs decrypted before it runs: all of its
/// own projections, plus the subquery feeds it consumes client-side
/// (ciphertext placeholder feeds stay encrypted).
fn decrypt_positions(mapped: &MappedCc) -> Vec<usize> {
    let mut positions = mapped.main.clone();
    positions.extend(
        mapped
            .sub
            .iter()
            .zip(&mapped.cc.subquery_projections)
            .filter(|(_, p)| p.decrypt)
            .map(|(slot, _)| *slot),
    );
    positions
}

/// The executable client expression of a computation, with slot references
/// remapped to final tuple positions.
fn mapped_expr(mapped: &MappedCc) -> Expr {
    top_down_transform(mapped.cc.expr.clone(), &mut |e| {
        Ok(match &e.kind {
            ExprKind::TuplePos(i) => Some(ExprKind::TuplePos(mapped.main[*i]).into()),
            _ => None,
        })
    })
    .expect("slot remapping is infallible")
}

fn mapped_subqueries(mapped: &MappedCc) -> Vec<PlanSubquery> {
    mapped
        .cc
        .subqueries
        .iter()
        .map(|sq| PlanSubquery {
            plan: sq.plan.clone(),
            bindings: sq
                .bindings
                .iter()
                .map(|(ph, slot)| (*ph, mapped.sub[*slot]))
                .collect(),
        })
        .collect()
}

/// `LocalDecrypt` over exactly the non-PLAIN positions of `positions`.
fn wrap_decrypt(cur: PlanNode, positions: Vec<usize>) -> PlanNode {
    let desc = cur.tuple_desc();
    let positions = positions
        .into_iter()
        .filter(|p| !desc[*p].is_plain())
        .sorted()
        .dedup()
        .collect_vec();
    if positions.is_empty() {
        return cur;
    }
    PlanNode::LocalDecrypt {
        positions,
        child: Box::new(cur),
    }
}

fn satisfies_enc_proj(desc: &[PosDesc], onions: &[OnionMask]) -> bool {
    desc.len() == onions.len()
        && desc.iter().zip(onions).all(|(d, mask)| match &d.onion {
            PosOnion::Onion(o) => mask.contains(*o),
            PosOnion::HomGroup { .. } => false,
        })
}

/// Finalize the plan against the caller's output-encryption requirement.
fn finalize_enc(mut cur: PlanNode, enc: &EncContext) -> Result<PlanNode> {
    match enc {
        EncContext::PreserveCardinality => Ok(cur),
        EncContext::PreserveOriginal => {
            let remaining = cur
                .tuple_desc()
                .iter()
                .positions(|d| !d.is_plain())
                .collect_vec();
            if !remaining.is_empty() {
                cur = PlanNode::LocalDecrypt {
                    positions: remaining,
                    child: Box::new(cur),
                };
            }
            debug_assert!(cur.tuple_desc().iter().all(|d| d.is_plain()));
            Ok(cur)
        }
        EncContext::EncProj { onions, require } => {
            // a trailing decrypt that the requirement doesn't need is wasted
            // client work
            if let PlanNode::LocalDecrypt { child, .. } = &cur {
                if satisfies_enc_proj(&child.tuple_desc(), onions) {
                    cur = *child.clone();
                }
            }
            let desc = cur.tuple_desc();
            if !require || satisfies_enc_proj(&desc, onions) {
                return Ok(cur);
            }
            let mismatched = desc
                .iter()
                .zip(onions)
                .positions(|(d, mask)| match &d.onion {
                    PosOnion::Onion(o) => !mask.contains(*o),
                    PosOnion::HomGroup { .. } => true,
                })
                .collect_vec();
            let decrypt = mismatched
                .iter()
                .copied()
                .filter(|p| !desc[*p].is_plain())
                .collect_vec();
            if !decrypt.is_empty() {
                cur = PlanNode::LocalDecrypt {
                    positions: decrypt,
                    child: Box::new(cur),
                };
            }
            let encrypt = mismatched
                .iter()
                .map(|p| {
                    let target = onions[*p]
                        .pick_one()
                        .ok_or_else(|| Error::new_assert("empty EncProj onion mask"))?;
                    Ok((*p, target))
                })
                .filter_ok(|(_, target)| *target != Onion::Plain)
                .try_collect::<_, Vec<_>, Error>()?;
            if !encrypt.is_empty() {
                cur = PlanNode::LocalEncrypt {
                    positions: encrypt,
                    child: Box::new(cur),
                };
            }
            Ok(cur)
        }
    }
}
