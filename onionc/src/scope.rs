//! Scope resolution and alias handling.
//!
//! Contexts form a tree: each SELECT owns one, with relations (tables or
//! subqueries), projection descriptors, and a parent for correlated lookup.
//! Parents are non-owning handles into a scope arena; contexts are owned by
//! the arena that bound the statement.

use enum_as_inner::EnumAsInner;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ast::{
    AstFold, ColumnSort, Expr, ExprKind, FieldIdent, GroupBy, Projection, RelationDecl,
    RelationKind, SelectStmt, fold_expr_kind, top_down_transform,
};
use crate::schema::{DataType, Schema, Statistics};
use crate::{Error, Reason, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(usize);

impl From<usize> for ScopeId {
    fn from(id: usize) -> Self {
        ScopeId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Relations visible in this scope, in declaration order. Aliases are
    /// unique within one context.
    pub relations: Vec<(String, ContextRelation)>,
    /// Projection descriptors of the owning SELECT, position-contiguous.
    pub projections: Vec<ProjDesc>,
    pub parent: Option<ScopeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ContextRelation {
    Table(String),
    Subquery(ScopeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ProjDesc {
    Named {
        name: String,
        expr: Expr,
        pos: usize,
        ty: DataType,
    },
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Symbol {
    Column {
        relation: String,
        column: String,
        ctx: ScopeId,
        ty: DataType,
    },
    Projection {
        name: String,
        ctx: ScopeId,
        ty: DataType,
    },
}

impl Symbol {
    pub fn ctx(&self) -> ScopeId {
        match self {
            Symbol::Column { ctx, .. } | Symbol::Projection { ctx, .. } => *ctx,
        }
    }

    pub fn ty(&self) -> DataType {
        match self {
            Symbol::Column { ty, .. } | Symbol::Projection { ty, .. } => *ty,
        }
    }
}

/// Owns every context bound for one statement tree, plus read-only access to
/// the schema definitions and statistics at the root.
#[derive(Debug, Clone, Default)]
pub struct ScopeArena {
    contexts: Vec<Context>,
    pub defns: Schema,
    pub stats: Statistics,
}

impl ScopeArena {
    pub fn new(defns: Schema, stats: Statistics) -> Self {
        ScopeArena {
            contexts: Vec::new(),
            defns,
            stats,
        }
    }

    pub fn get(&self, id: ScopeId) -> &Context {
        &self.contexts[id.0]
    }

    fn get_mut(&mut self, id: ScopeId) -> &mut Context {
        &mut self.contexts[id.0]
    }

    fn push(&mut self, ctx: Context) -> ScopeId {
        self.contexts.push(ctx);
        ScopeId(self.contexts.len() - 1)
    }

    /// The transitive parent relation: is `a` a proper ancestor of `b`?
    pub fn is_parent_of(&self, a: ScopeId, b: ScopeId) -> bool {
        let mut cur = self.get(b).parent;
        while let Some(p) = cur {
            if p == a {
                return true;
            }
            cur = self.get(p).parent;
        }
        false
    }

    /// Resolve a column reference in `ctx`. Searches relations first (table
    /// columns in the schema, subquery columns in the subquery's projection
    /// list, recursing through wildcards), then named projections of the
    /// enclosing SELECT when `in_projection_scope`, then the parent chain
    /// (with projection lookup disabled — SQL has no correlated references
    /// to outer projections).
    ///
    /// Multiple matches are allowed in the return, with undefined tie-break.
    pub fn lookup_column(
        &self,
        ctx: ScopeId,
        qualifier: Option<&str>,
        name: &str,
        in_projection_scope: bool,
    ) -> Vec<Symbol> {
        let context = self.get(ctx);
        let mut found = Vec::new();

        for (alias, rel) in &context.relations {
            if qualifier.is_some_and(|q| q != alias) {
                continue;
            }
            match rel {
                ContextRelation::Table(t) => {
                    if let Some(col) = self.defns.table(t).and_then(|t| t.column(name)) {
                        found.push(Symbol::Column {
                            relation: alias.clone(),
                            column: name.to_string(),
                            ctx,
                            ty: col.ty,
                        });
                    }
                }
                ContextRelation::Subquery(sub) => {
                    if let Some(ty) = self.lookup_subquery_projection(*sub, name) {
                        found.push(Symbol::Column {
                            relation: alias.clone(),
                            column: name.to_string(),
                            ctx,
                            ty,
                        });
                    }
                }
            }
        }

        if found.is_empty() && qualifier.is_none() && in_projection_scope {
            for desc in &context.projections {
                if let ProjDesc::Named { name: n, ty, .. } = desc {
                    if n == name {
                        found.push(Symbol::Projection {
                            name: name.to_string(),
                            ctx,
                            ty: *ty,
                        });
                    }
                }
            }
        }

        if found.is_empty() {
            if let Some(parent) = context.parent {
                return self.lookup_column(parent, qualifier, name, false);
            }
        }
        found
    }

    /// Look `name` up in a subquery's projection list, recursing through
    /// wildcards into the subquery's own relations.
    fn lookup_subquery_projection(&self, sub: ScopeId, name: &str) -> Option<DataType> {
        let context = self.get(sub);
        for desc in &context.projections {
            match desc {
                ProjDesc::Named { name: n, ty, .. } if n == name => return Some(*ty),
                ProjDesc::Named { .. } => {}
                ProjDesc::Wildcard => {
                    // wildcard position matches are not addressable by name;
                    // resolve through the subquery's relations instead
                    let inner = self.lookup_column(sub, None, name, false);
                    if let Some(sym) = inner.first() {
                        return Some(sym.ty());
                    }
                }
            }
        }
        None
    }

    /// The defining expression of a named projection of `ctx`.
    pub fn projection_expr(&self, ctx: ScopeId, name: &str) -> Option<&Expr> {
        self.get(ctx).projections.iter().find_map(|d| match d {
            ProjDesc::Named { name: n, expr, .. } if n == name => Some(expr),
            _ => None,
        })
    }

    /// The position of a named projection of `ctx`.
    pub fn projection_pos(&self, ctx: ScopeId, name: &str) -> Option<usize> {
        self.get(ctx).projections.iter().find_map(|d| match d {
            ProjDesc::Named { name: n, pos, .. } if n == name => Some(*pos),
            _ => None,
        })
    }

    /// Rewrite field references bound to projection symbols by substituting
    /// their defining expression, recursively. Idempotent. Required before
    /// onionability checks, which are defined on underlying column
    /// expressions rather than aliases.
    pub fn resolve_aliases(&self, e: Expr) -> Expr {
        top_down_transform(e, &mut |expr| {
            if let ExprKind::Field(FieldIdent {
                symbol: Some(Symbol::Projection { name, ctx, .. }),
                ..
            }) = &expr.kind
            {
                if let Some(def) = self.projection_expr(*ctx, name) {
                    return Ok(Some(self.resolve_aliases(def.clone())));
                }
            }
            Ok(None)
        })
        .expect("alias resolution is infallible")
    }

    pub fn infer_type(&self, e: &Expr) -> DataType {
        use crate::ast::AggFunc;
        match &e.kind {
            ExprKind::Literal(lit) => match lit {
                crate::ast::Literal::Boolean(_) => DataType::Bool,
                crate::ast::Literal::Integer(_) => DataType::Int,
                crate::ast::Literal::Float(_) => DataType::Decimal,
                crate::ast::Literal::Date(_) => DataType::Date,
                _ => DataType::Text,
            },
            ExprKind::Field(f) => f.symbol.as_ref().map(|s| s.ty()).unwrap_or(DataType::Text),
            ExprKind::Agg { func, arg } => match func {
                AggFunc::CountStar | AggFunc::Count => DataType::Int,
                AggFunc::Avg => DataType::Decimal,
                _ => arg
                    .as_ref()
                    .map(|a| self.infer_type(a))
                    .unwrap_or(DataType::Int),
            },
            ExprKind::Binary { left, right, .. } => {
                if self.infer_type(left) == DataType::Decimal
                    || self.infer_type(right) == DataType::Decimal
                {
                    DataType::Decimal
                } else {
                    DataType::Int
                }
            }
            ExprKind::Case { branches, .. } => branches
                .first()
                .map(|b| self.infer_type(&b.value))
                .unwrap_or(DataType::Text),
            ExprKind::And(..)
            | ExprKind::Or(..)
            | ExprKind::Not(..)
            | ExprKind::Cmp { .. }
            | ExprKind::In { .. }
            | ExprKind::Like { .. }
            | ExprKind::Exists(_) => DataType::Bool,
            ExprKind::Subselect(stmt) => stmt
                .ctx
                .and_then(|c| {
                    self.get(c).projections.first().and_then(|d| match d {
                        ProjDesc::Named { ty, .. } => Some(*ty),
                        ProjDesc::Wildcard => None,
                    })
                })
                .unwrap_or(DataType::Int),
            ExprKind::FuncCall { args, .. } => args
                .first()
                .map(|a| self.infer_type(a))
                .unwrap_or(DataType::Text),
            _ => DataType::Int,
        }
    }
}

/// Builds the scope graph for a statement and attaches symbols to every
/// field reference. The planner requires its input statement to have gone
/// through here (or an equivalent external resolver).
pub fn bind_stmt(arena: &mut ScopeArena, stmt: SelectStmt) -> Result<SelectStmt> {
    Binder { arena, stack: Vec::new() }.bind(stmt, None)
}

struct Binder<'a> {
    arena: &'a mut ScopeArena,
    stack: Vec<ScopeId>,
}

impl Binder<'_> {
    fn bind(&mut self, stmt: SelectStmt, parent: Option<ScopeId>) -> Result<SelectStmt> {
        let ctx = self.arena.push(Context {
            relations: Vec::new(),
            projections: Vec::new(),
            parent,
        });

        // relations first, so projections can reference them
        let relations = stmt
            .relations
            .into_iter()
            .map(|r| {
                let kind = match r.kind {
                    RelationKind::Table(t) => {
                        if self.arena.defns.table(&t).is_none() {
                            return Err(Error::new(Reason::NotFound {
                                name: t,
                                namespace: "table".to_string(),
                            }));
                        }
                        self.arena
                            .get_mut(ctx)
                            .relations
                            .push((r.alias.clone(), ContextRelation::Table(t.clone())));
                        RelationKind::Table(t)
                    }
                    RelationKind::Subquery(s) => {
                        let bound = self.bind(*s, Some(ctx))?;
                        let sub_ctx = bound.ctx.expect("just bound");
                        self.arena
                            .get_mut(ctx)
                            .relations
                            .push((r.alias.clone(), ContextRelation::Subquery(sub_ctx)));
                        RelationKind::Subquery(Box::new(bound))
                    }
                };
                Ok(RelationDecl {
                    alias: r.alias,
                    kind,
                })
            })
            .try_collect()?;

        self.stack.push(ctx);

        let projections: Vec<Projection> = stmt
            .projections
            .into_iter()
            .map(|p| {
                Ok(match p {
                    Projection::Expr { expr, name } => Projection::Expr {
                        expr: self.bind_expr(expr, false)?,
                        name,
                    },
                    Projection::Star => Projection::Star,
                })
            })
            .try_collect::<_, Vec<_>, Error>()?;

        // register projection descriptors before group/order keys, which may
        // reference projections by name
        for (pos, p) in projections.iter().enumerate() {
            let desc = match p {
                Projection::Expr { expr, name } => {
                    let name = name.clone().unwrap_or_else(|| match &expr.kind {
                        ExprKind::Field(f) => f.name.clone(),
                        _ => crate::codegen::write_expr(expr),
                    });
                    ProjDesc::Named {
                        name,
                        ty: self.arena.infer_type(expr),
                        expr: expr.clone(),
                        pos,
                    }
                }
                Projection::Star => ProjDesc::Wildcard,
            };
            self.arena.get_mut(ctx).projections.push(desc);
        }

        let filter = stmt
            .filter
            .map(|f| self.bind_expr(f, false))
            .transpose()?;
        let group_by = stmt
            .group_by
            .map(|g| {
                Ok::<_, Error>(GroupBy {
                    keys: g
                        .keys
                        .into_iter()
                        .map(|k| self.bind_expr(k, true))
                        .try_collect()?,
                    having: g.having.map(|h| self.bind_expr(h, false)).transpose()?,
                })
            })
            .transpose()?;
        let order_by = stmt
            .order_by
            .into_iter()
            .map(|s| {
                Ok(ColumnSort {
                    direction: s.direction,
                    column: self.bind_expr(s.column, true)?,
                })
            })
            .try_collect::<_, Vec<_>, Error>()?;

        self.stack.pop();

        Ok(SelectStmt {
            projections,
            relations,
            filter,
            group_by,
            order_by,
            limit: stmt.limit,
            ctx: Some(ctx),
        })
    }

    fn bind_expr(&mut self, e: Expr, in_projection_scope: bool) -> Result<Expr> {
        struct ExprBinder<'a, 'b> {
            binder: &'a mut Binder<'b>,
            in_projection_scope: bool,
        }
        impl AstFold for ExprBinder<'_, '_> {
            fn fold_expr_kind(&mut self, kind: ExprKind) -> Result<ExprKind> {
                match kind {
                    ExprKind::Subselect(s) => {
                        let parent = self.binder.stack.last().copied();
                        Ok(ExprKind::Subselect(Box::new(self.binder.bind(*s, parent)?)))
                    }
                    ExprKind::Exists(s) => {
                        let parent = self.binder.stack.last().copied();
                        Ok(ExprKind::Exists(Box::new(self.binder.bind(*s, parent)?)))
                    }
                    kind => fold_expr_kind(self, kind),
                }
            }

            fn fold_field(&mut self, field: FieldIdent) -> Result<FieldIdent> {
                let ctx = *self.binder.stack.last().expect("binder scope stack");
                let symbols = self.binder.arena.lookup_column(
                    ctx,
                    field.qualifier.as_deref(),
                    &field.name,
                    self.in_projection_scope,
                );
                let Some(symbol) = symbols.into_iter().next() else {
                    return Err(Error::new(Reason::NotFound {
                        name: match &field.qualifier {
                            Some(q) => format!("{q}.{}", field.name),
                            None => field.name.clone(),
                        },
                        namespace: "column".to_string(),
                    }));
                };
                Ok(FieldIdent {
                    symbol: Some(symbol),
                    ..field
                })
            }
        }
        ExprBinder {
            binder: self,
            in_projection_scope,
        }
        .fold_expr(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExprKind;
    use crate::schema::{DataType, table};

    fn arena() -> ScopeArena {
        ScopeArena::new(
            Schema::new([
                table("t", &[("a", DataType::Int), ("b", DataType::Text)]),
                table("u", &[("b", DataType::Int)]),
            ]),
            Statistics::default(),
        )
    }

    fn field(q: Option<&str>, n: &str) -> Expr {
        ExprKind::Field(FieldIdent::new(q, n)).into()
    }

    fn select(projections: Vec<Projection>, relations: Vec<RelationDecl>) -> SelectStmt {
        SelectStmt {
            projections,
            relations,
            filter: None,
            group_by: None,
            order_by: vec![],
            limit: None,
            ctx: None,
        }
    }

    #[test]
    fn binds_table_columns() {
        let mut arena = arena();
        let stmt = select(
            vec![Projection::Expr {
                expr: field(None, "a"),
                name: None,
            }],
            vec![RelationDecl {
                alias: "t".into(),
                kind: RelationKind::Table("t".into()),
            }],
        );
        let bound = bind_stmt(&mut arena, stmt).unwrap();
        let ctx = bound.ctx.unwrap();

        let expr = bound.projections[0].as_expr().unwrap().0;
        let sym = expr.kind.as_field().unwrap().symbol.as_ref().unwrap();
        assert_eq!(
            sym,
            &Symbol::Column {
                relation: "t".into(),
                column: "a".into(),
                ctx,
                ty: DataType::Int,
            }
        );
    }

    #[test]
    fn returned_symbols_are_in_scope_chain() {
        let mut arena = arena();
        let inner = select(
            vec![Projection::Star],
            vec![RelationDecl {
                alias: "u".into(),
                kind: RelationKind::Table("u".into()),
            }],
        );
        let stmt = select(
            vec![Projection::Expr {
                expr: field(Some("s"), "b"),
                name: None,
            }],
            vec![RelationDecl {
                alias: "s".into(),
                kind: RelationKind::Subquery(Box::new(inner)),
            }],
        );
        let bound = bind_stmt(&mut arena, stmt).unwrap();
        let ctx = bound.ctx.unwrap();

        // wildcard recursion resolves s.b through u
        let syms = arena.lookup_column(ctx, Some("s"), "b", false);
        assert_eq!(syms.len(), 1);
        assert_eq!(syms[0].ctx(), ctx);
        assert_eq!(syms[0].ty(), DataType::Int);

        // no projection symbols when in_projection_scope is false
        assert!(
            arena
                .lookup_column(ctx, None, "b", false)
                .iter()
                .all(|s| s.as_projection().is_none())
        );
    }

    #[test]
    fn alias_resolution_is_idempotent() {
        let mut arena = arena();
        let stmt = SelectStmt {
            projections: vec![Projection::Expr {
                expr: field(None, "a"),
                name: Some("x".into()),
            }],
            relations: vec![RelationDecl {
                alias: "t".into(),
                kind: RelationKind::Table("t".into()),
            }],
            filter: None,
            group_by: Some(GroupBy {
                keys: vec![field(None, "x")],
                having: None,
            }),
            order_by: vec![],
            limit: None,
            ctx: None,
        };
        let bound = bind_stmt(&mut arena, stmt).unwrap();

        let key = bound.group_by.as_ref().unwrap().keys[0].clone();
        assert!(
            key.kind
                .as_field()
                .unwrap()
                .symbol
                .as_ref()
                .unwrap()
                .as_projection()
                .is_some()
        );

        let once = arena.resolve_aliases(key.clone());
        let twice = arena.resolve_aliases(once.clone());
        assert_eq!(once, twice);
        // resolved to the underlying column symbol
        assert!(
            once.kind
                .as_field()
                .unwrap()
                .symbol
                .as_ref()
                .unwrap()
                .as_column()
                .is_some()
        );
    }
}
