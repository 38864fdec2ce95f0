//! Expression classification: which server-side encrypted representation,
//! if any, can answer a given expression.

use std::collections::HashMap;

use super::{Generator, StmtCtx, enc_tbl_name};
use crate::ast::{Expr, ExprKind, FieldIdent, collect_fields, top_down_transform};
use crate::onion::{HomDesc, OnionMask, OnionType};
use crate::scope::{ContextRelation, Symbol};

/// The canonical precomputable form of an expression: it depends on columns
/// of exactly one base table (after following subquery relations one level).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OnionableExpr {
    /// The relation name seen in the current scope (possibly a subquery
    /// alias).
    pub scope_alias: String,
    /// The underlying base table whose onion set keys the lookup.
    pub table: String,
    /// Alias-resolved, qualifier-stripped, context-free expression.
    pub canonical: Expr,
}

impl Generator<'_> {
    /// `Some` iff the resolved expression depends on columns of exactly one
    /// base table. Canonicalization: resolve aliases, strip all field
    /// qualifiers, drop symbols.
    pub(crate) fn find_onionable_expr(&self, e: &Expr) -> Option<OnionableExpr> {
        let resolved = self.arena.resolve_aliases(e.clone());
        let fields = collect_fields(&resolved);
        if fields.is_empty() {
            return None;
        }

        // (alias, column) -> (scope alias, base table, canonical replacement)
        let mut targets: HashMap<(String, String), (String, String, Expr)> = HashMap::new();
        let mut origin: Option<(String, String)> = None;
        for field in fields {
            let Some(Symbol::Column {
                relation, column, ctx, ..
            }) = &field.symbol
            else {
                return None;
            };
            let key = (relation.clone(), column.clone());
            if targets.contains_key(&key) {
                continue;
            }

            let context = self.arena.get(*ctx);
            let (_, rel) = context.relations.iter().find(|(a, _)| a == relation)?;
            let target = match rel {
                ContextRelation::Table(t) => (
                    relation.clone(),
                    t.clone(),
                    Expr::from(ExprKind::Field(FieldIdent::new(None, column))),
                ),
                ContextRelation::Subquery(sub) => {
                    // recurse through the projection, one level, preserving
                    // the outer relation alias
                    match self.arena.projection_expr(*sub, column) {
                        Some(def) => {
                            let inner = self.find_onionable_expr(def)?;
                            (relation.clone(), inner.table, inner.canonical)
                        }
                        None => {
                            // the column came in through a wildcard
                            let syms = self.arena.lookup_column(*sub, None, column, false);
                            let sym = syms.first()?;
                            let (inner_rel, inner_ctx) = match sym {
                                Symbol::Column { relation, ctx, .. } => (relation.clone(), *ctx),
                                Symbol::Projection { .. } => return None,
                            };
                            let inner_context = self.arena.get(inner_ctx);
                            let (_, rel) =
                                inner_context.relations.iter().find(|(a, _)| *a == inner_rel)?;
                            let t = rel.as_table()?;
                            (
                                relation.clone(),
                                t.clone(),
                                Expr::from(ExprKind::Field(FieldIdent::new(None, column))),
                            )
                        }
                    }
                }
            };

            match &origin {
                None => origin = Some((target.0.clone(), target.1.clone())),
                Some((alias, table)) => {
                    if *alias != target.0 || *table != target.1 {
                        return None;
                    }
                }
            }
            targets.insert(key, target);
        }

        let (scope_alias, table) = origin?;
        let canonical = top_down_transform(resolved, &mut |expr| {
            Ok(match &expr.kind {
                ExprKind::Field(FieldIdent {
                    symbol: Some(Symbol::Column {
                        relation, column, ..
                    }),
                    ..
                }) => targets
                    .get(&(relation.clone(), column.clone()))
                    .map(|(_, _, repl)| repl.clone()),
                _ => None,
            })
        })
        .expect("canonicalization is infallible");

        Some(OnionableExpr {
            scope_alias,
            table,
            canonical,
        })
    }

    /// `(base table, canonical text)` cache key of an expression.
    pub(crate) fn canonical_key(&self, e: &Expr) -> Option<(String, String)> {
        let target = self.find_onionable_expr(e)?;
        Some((target.table, crate::codegen::write_expr(&target.canonical)))
    }

    /// `Some((server_expr, onion_type))` iff some bit of `mask` matches a
    /// stored onion (or, for subquery-column references, the subplan's
    /// descriptor onion at the corresponding projection). Literals always
    /// succeed, plain or encrypted.
    pub(crate) fn get_supported_expr(
        &self,
        st: &StmtCtx,
        e: &Expr,
        mask: OnionMask,
    ) -> Option<(Expr, OnionType)> {
        use crate::onion::Onion;
        if mask.is_empty() {
            return None;
        }

        if let ExprKind::Literal(_) = &e.kind {
            if mask.contains(Onion::Plain) {
                return Some((e.clone(), OnionType::new(Onion::Plain)));
            }
            let onion = mask.pick_one()?;
            return Some((
                ExprKind::Encrypt {
                    expr: Box::new(e.clone()),
                    onion,
                }
                .into(),
                OnionType::new(onion),
            ));
        }

        // columns of a planned subquery relation expose exactly the onion
        // their projection was planned under
        if let ExprKind::Field(FieldIdent {
            symbol: Some(Symbol::Column {
                relation, column, ctx, ..
            }),
            ..
        }) = &e.kind
        {
            if *ctx == st.ctx {
                if let Some(rel) = st.subquery_rels.get(relation) {
                    let col = rel.columns.iter().find(|c| c.logical == *column)?;
                    let onion = *col.desc.onion.as_onion()?;
                    if !mask.contains(onion) {
                        return None;
                    }
                    return Some((
                        ExprKind::Field(FieldIdent::new(Some(relation), &col.server_name)).into(),
                        OnionType {
                            onion,
                            vector_ctx: col.desc.vector_ctx,
                        },
                    ));
                }
            }
        }

        let target = self.find_onionable_expr(e)?;
        let (base, avail) = self.oset.lookup(&target.table, &target.canonical)?;
        let onion = mask.to_seq().into_iter().find(|o| avail.contains(*o))?;
        let column = format!("{base}${onion}");
        let qualifier = self.qualifier_for(st, &target);
        Some((
            ExprKind::Field(FieldIdent::new(qualifier.as_deref(), &column)).into(),
            OnionType::new(onion),
        ))
    }

    /// Like [Self::get_supported_expr], but inside an aggregate context a
    /// field that is a group-by key is forced to the key's chosen onion —
    /// else the field is unprojectable.
    pub(crate) fn get_supported_expr_constraint_aware(
        &self,
        st: &StmtCtx,
        e: &Expr,
        mask: OnionMask,
    ) -> Option<(Expr, OnionType)> {
        if st.agg && !st.group_key_onions.is_empty() {
            if let ExprKind::Field(_) = &e.kind {
                if let Some((_, key)) = self.canonical_key(e) {
                    if let Some(forced) = st.group_key_onions.get(&key) {
                        if !mask.contains(*forced) {
                            return None;
                        }
                        return self.get_supported_expr(st, e, forced.mask());
                    }
                }
            }
        }
        self.get_supported_expr(st, e, mask)
    }

    /// The HOM_ROW_DESC path: a server expression yielding the packed HOM
    /// row id, plus every candidate group/position of the expression.
    pub(crate) fn get_supported_hom_row_desc_expr(
        &self,
        st: &StmtCtx,
        e: &Expr,
    ) -> Option<(Expr, Vec<HomDesc>)> {
        let target = self.find_onionable_expr(e)?;
        let descs = self.oset.lookup_packed_hom(&target.table, &target.canonical);
        if descs.is_empty() {
            return None;
        }
        let qualifier = self.qualifier_for(st, &target);
        Some((
            ExprKind::Field(FieldIdent::new(qualifier.as_deref(), "rowid")).into(),
            descs,
        ))
    }

    /// Physical qualification: only needed when the statement joins more
    /// than one relation. The encrypted table name stands in when the alias
    /// equals the base table, else the original alias survives.
    fn qualifier_for(&self, st: &StmtCtx, target: &OnionableExpr) -> Option<String> {
        if st.rel_count <= 1 {
            return None;
        }
        Some(if target.scope_alias == target.table {
            enc_tbl_name(&target.table)
        } else {
            target.scope_alias.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Projection, RelationDecl, RelationKind, SelectStmt};
    use crate::codegen::write_expr;
    use crate::onion::OnionSet;
    use crate::schema::{DataType, Schema, Statistics, table};
    use crate::scope::{ScopeArena, bind_stmt};
    use crate::utils::NameGenerator;

    fn setup() -> (ScopeArena, SelectStmt) {
        let mut arena = ScopeArena::new(
            Schema::new([table(
                "t",
                &[("a", DataType::Int), ("b", DataType::Int)],
            )]),
            Statistics::default(),
        );
        // SELECT t.a + b AS s FROM t GROUP BY s
        let stmt = SelectStmt {
            projections: vec![Projection::Expr {
                expr: ExprKind::Binary {
                    op: BinOp::Add,
                    left: Box::new(ExprKind::Field(FieldIdent::new(Some("t"), "a")).into()),
                    right: Box::new(ExprKind::Field(FieldIdent::new(None, "b")).into()),
                }
                .into(),
                name: Some("s".to_string()),
            }],
            relations: vec![RelationDecl {
                alias: "t".to_string(),
                kind: RelationKind::Table("t".to_string()),
            }],
            filter: None,
            group_by: Some(crate::ast::GroupBy {
                keys: vec![ExprKind::Field(FieldIdent::new(None, "s")).into()],
                having: None,
            }),
            order_by: vec![],
            limit: None,
            ctx: None,
        };
        let stmt = bind_stmt(&mut arena, stmt).unwrap();
        (arena, stmt)
    }

    #[test]
    fn canonical_form_is_qualifier_and_symbol_free() {
        let (arena, stmt) = setup();
        let empty = OnionSet::new();
        let generator = Generator {
            arena: &arena,
            oset: &empty,
            mat_names: NameGenerator::new("mat"),
        };

        let (expr, _) = stmt.projections[0].as_expr().unwrap();
        let target = generator.find_onionable_expr(expr).unwrap();
        assert_eq!(target.scope_alias, "t");
        assert_eq!(target.table, "t");
        assert_eq!(write_expr(&target.canonical), "a + b");
        for f in collect_fields(&target.canonical) {
            assert!(f.qualifier.is_none());
            assert!(f.symbol.is_none());
        }
    }

    #[test]
    fn alias_and_direct_forms_share_one_canonical_key() {
        let (arena, stmt) = setup();
        let empty = OnionSet::new();
        let generator = Generator {
            arena: &arena,
            oset: &empty,
            mat_names: NameGenerator::new("mat"),
        };

        // the group-by key is the projection alias; after alias resolution
        // it canonicalizes identically to the projection expression
        let (expr, _) = stmt.projections[0].as_expr().unwrap();
        let key = &stmt.group_by.as_ref().unwrap().keys[0];
        let via_alias = generator
            .canonical_key(&generator.arena.resolve_aliases(key.clone()))
            .unwrap();
        let direct = generator.canonical_key(expr).unwrap();
        assert_eq!(via_alias, direct);
    }
}
