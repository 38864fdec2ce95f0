//! End-to-end planner scenarios: statements are bound against a schema,
//! planned against a candidate onion set, and the resulting plan trees are
//! snapshotted.

use insta::assert_snapshot;
use onionc::ast::*;
use onionc::onion::{Onion, OnionSet};
use onionc::plan::{PlanNode, PosOnion};
use onionc::schema::{DataType, Schema, Statistics, table};
use onionc::scope::{ScopeArena, bind_stmt};
use onionc::{EncContext, generate_candidate_plans, generate_plan};

fn schema() -> Schema {
    Schema::new([
        table(
            "lineitem",
            &[
                ("l_extendedprice", DataType::Decimal),
                ("l_discount", DataType::Decimal),
                ("l_shipdate", DataType::Date),
                ("l_quantity", DataType::Decimal),
            ],
        ),
        table(
            "t",
            &[
                ("a", DataType::Int),
                ("b", DataType::Text),
                ("k", DataType::Int),
                ("x", DataType::Int),
            ],
        ),
        table("u", &[("b", DataType::Int)]),
    ])
}

fn arena() -> ScopeArena {
    ScopeArena::new(schema(), Statistics::default())
}

fn field(name: &str) -> Expr {
    ExprKind::Field(FieldIdent::new(None, name)).into()
}

fn qfield(qualifier: &str, name: &str) -> Expr {
    ExprKind::Field(FieldIdent::new(Some(qualifier), name)).into()
}

fn int(i: i64) -> Expr {
    ExprKind::Literal(Literal::Integer(i)).into()
}

fn string(s: &str) -> Expr {
    ExprKind::Literal(Literal::String(s.to_string())).into()
}

fn date(d: &str) -> Expr {
    ExprKind::Literal(Literal::Date(d.to_string())).into()
}

fn cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
    ExprKind::Cmp {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
    .into()
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    ExprKind::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
    .into()
}

fn agg(func: AggFunc, arg: Expr) -> Expr {
    ExprKind::Agg {
        func,
        arg: Some(Box::new(arg)),
    }
    .into()
}

fn func(name: &str, args: Vec<Expr>) -> Expr {
    ExprKind::FuncCall {
        name: name.to_string(),
        args,
    }
    .into()
}

fn proj(expr: Expr) -> Projection {
    Projection::Expr { expr, name: None }
}

fn from_table(name: &str) -> Vec<RelationDecl> {
    vec![RelationDecl {
        alias: name.to_string(),
        kind: RelationKind::Table(name.to_string()),
    }]
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

/// `l_extendedprice * (1 - l_discount)`
fn discount_expr() -> Expr {
    binary(
        BinOp::Mul,
        field("l_extendedprice"),
        binary(BinOp::Sub, int(1), field("l_discount")),
    )
}

fn plan(
    arena: &mut ScopeArena,
    stmt: SelectStmt,
    set: &OnionSet,
    enc: &EncContext,
) -> PlanNode {
    let bound = bind_stmt(arena, stmt).unwrap();
    generate_plan(arena, &bound, set, enc).unwrap()
}

fn collect_decrypt_positions(plan: &PlanNode, out: &mut Vec<Vec<usize>>) {
    if let PlanNode::LocalDecrypt { positions, .. } = plan {
        out.push(positions.clone());
    }
    if let Some(child) = plan.child() {
        collect_decrypt_positions(child, out);
    }
}

#[test]
fn packed_hom_sum_with_ope_filter() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add_packed_hom_to_last_group("lineitem", &field("l_quantity"));
    set.add_packed_hom_to_last_group("lineitem", &discount_expr());
    set.add("lineitem", &field("l_shipdate"), Onion::Ope);
    set.complete(&schema());

    let mut stmt = select(
        vec![proj(agg(AggFunc::Sum, discount_expr()))],
        from_table("lineitem"),
    );
    stmt.filter = Some(cmp(CmpOp::Lt, field("l_shipdate"), date("1998-09-01")));

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [(hom_get_pos(col0, 1))]
      LocalDecrypt [0]
        RemoteSql [HOM_GROUP(lineitem, 0)]
          SELECT hom_agg(rowid, 'lineitem', 0) AS h0 FROM lineitem$enc WHERE l_shipdate$OPE < encrypt(date '1998-09-01', OPE)
    ");
}

#[test]
fn order_by_under_ope() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("t", &field("a"), Onion::Ope);
    set.complete(&schema());

    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.order_by = vec![ColumnSort {
        direction: SortDirection::Asc,
        column: field("a"),
    }];

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [0]
      LocalDecrypt [0]
        RemoteSql [DET, OPE]
          SELECT a$DET, a$OPE FROM t$enc ORDER BY a$OPE
    ");
}

#[test]
fn precomputed_expression_filter_stays_server_side() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("t", &func("substr", vec![field("b"), int(1), int(2)]), Onion::Det);
    set.complete(&schema());

    let mut stmt = select(
        vec![proj(ExprKind::Agg {
            func: AggFunc::CountStar,
            arg: None,
        }
        .into())],
        from_table("t"),
    );
    stmt.filter = Some(
        ExprKind::And(
            Box::new(cmp(CmpOp::Eq, field("a"), int(5))),
            Box::new(cmp(
                CmpOp::Eq,
                func("substr", vec![field("b"), int(1), int(2)]),
                string("AB"),
            )),
        )
        .into(),
    );

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    RemoteSql [PLAIN]
      SELECT COUNT(*) FROM t$enc WHERE a$DET = encrypt(5, DET) AND virt0$DET = encrypt('AB', DET)
    ");
}

#[test]
fn in_subselect_inlines_as_server_sql() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("t", &field("a"), Onion::Ope);
    set.add("u", &field("b"), Onion::Ope);
    set.complete(&schema());

    let inner = select(vec![proj(agg(AggFunc::Min, field("b")))], from_table("u"));
    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.filter = Some(
        ExprKind::In {
            expr: Box::new(field("a")),
            list: vec![ExprKind::Subselect(Box::new(inner)).into()],
        }
        .into(),
    );

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalDecrypt [0]
      RemoteSql [DET]
        SELECT a$DET FROM t$enc WHERE a$OPE IN (SELECT MIN(b$OPE) FROM u$enc)
    ");
}

#[test]
fn unsupported_filter_goes_residual() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.filter = Some(cmp(CmpOp::Gt, func("f", vec![field("a")]), int(3)));

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalFilter f(col0) > 3
      LocalDecrypt [0]
        RemoteSql [DET]
          SELECT a$DET FROM t$enc
    ");
}

#[test]
fn binary_residual_prefers_precomputed_column() {
    let mut arena = arena();
    // the compound expression is stored only under SWP; the whole-subtree
    // form must still win over field-by-field projection
    let mut set = OnionSet::new();
    set.add("t", &binary(BinOp::Add, field("a"), field("x")), Onion::Swp);
    set.complete(&schema());

    let stmt = select(
        vec![proj(func(
            "f",
            vec![binary(BinOp::Add, field("a"), field("x"))],
        ))],
        from_table("t"),
    );

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [(f(col0))]
      LocalDecrypt [0]
        RemoteSql [SWP]
          SELECT virt0$SWP FROM t$enc
    ");
}

#[test]
fn grouped_avg_over_packed_hom() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add_packed_hom_to_last_group("t", &field("x"));
    set.complete(&schema());

    let mut stmt = select(vec![proj(agg(AggFunc::Avg, field("x")))], from_table("t"));
    stmt.group_by = Some(GroupBy {
        keys: vec![field("k")],
        having: None,
    });

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [(hom_get_pos(col0, 0) / col1)]
      LocalDecrypt [0]
        RemoteSql [HOM_GROUP(t, 0), PLAIN]
          SELECT hom_agg(rowid, 't', 0) AS h0, COUNT(*) AS h1 FROM t$enc GROUP BY k$DET
    ");
}

#[test]
fn grouped_residual_projects_group_vectors() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let mut stmt = select(
        vec![
            proj(field("k")),
            proj(agg(AggFunc::Sum, func("f", vec![field("x")]))),
        ],
        from_table("t"),
    );
    stmt.group_by = Some(GroupBy {
        keys: vec![field("k")],
        having: None,
    });

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [0, (SUM(f(col1)))]
      LocalDecrypt [0, 1]
        RemoteSql [DET, DET*]
          SELECT k$DET, GROUP_CONCAT(x$DET, ',') AS h0 FROM t$enc GROUP BY k$DET
    ");
}

#[test]
fn having_residual_becomes_group_filter() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add_packed_hom_to_last_group("t", &field("x"));
    set.complete(&schema());

    let mut stmt = select(
        vec![proj(field("k")), proj(agg(AggFunc::Sum, field("x")))],
        from_table("t"),
    );
    stmt.group_by = Some(GroupBy {
        keys: vec![field("k")],
        having: Some(cmp(CmpOp::Gt, agg(AggFunc::Sum, field("x")), int(100))),
    });

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalTransform [0, (hom_get_pos(col1, 0))]
      LocalDecrypt [0]
        LocalGroupFilter hom_get_pos(col1, 0) > 100
          LocalDecrypt [1]
            RemoteSql [DET, HOM_GROUP(t, 0)]
              SELECT k$DET, hom_agg(rowid, 't', 0) AS h0 FROM t$enc GROUP BY k$DET
    ");
}

#[test]
fn limit_after_local_filter_stays_local() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.filter = Some(cmp(CmpOp::Gt, func("f", vec![field("a")]), int(3)));
    stmt.limit = Some(5);

    let p = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert!(matches!(p, PlanNode::LocalLimit { n: 5, .. }));
    assert!(
        p.as_pure_remote_sql().is_none(),
        "limit must not be pushed under a local filter"
    );
    let mut leaf = &p;
    while let Some(child) = leaf.child() {
        leaf = child;
    }
    assert_eq!(leaf.as_pure_remote_sql().unwrap().limit, None);
}

#[test]
fn correlated_exists_becomes_dependent_subquery() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let mut inner = select(vec![proj(field("b"))], from_table("u"));
    inner.filter = Some(cmp(
        CmpOp::Eq,
        func("g", vec![field("b")]),
        qfield("t", "a"),
    ));
    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.filter = Some(ExprKind::Exists(Box::new(inner)).into());

    let plan = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert_snapshot!(plan.explain(), @r"
    LocalFilter exists_sq0
      subquery (bindings [(0, 0)]):
        LocalFilter g(col0) = :p0
          LocalDecrypt [0]
            RemoteSql [DET]
              SELECT b$DET FROM u$enc
      LocalDecrypt [0]
        RemoteSql [DET]
          SELECT a$DET FROM t$enc
    ");
}

#[test]
fn enc_proj_contract_is_honored() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let stmt = select(vec![proj(field("a"))], from_table("t"));
    let enc = EncContext::EncProj {
        onions: vec![Onion::Det.mask()],
        require: true,
    };
    let p = plan(&mut arena, stmt, &set, &enc);
    let desc = p.tuple_desc();
    assert_eq!(desc.len(), 1);
    assert_eq!(desc[0].onion, PosOnion::Onion(Onion::Det));
    assert!(p.as_pure_remote_sql().is_some());

    // an onion the server cannot deliver forces a decrypt/re-encrypt
    // boundary
    let stmt = select(vec![proj(field("a"))], from_table("t"));
    let enc = EncContext::EncProj {
        onions: vec![Onion::Swp.mask()],
        require: true,
    };
    let p = plan(&mut arena, stmt, &set, &enc);
    assert_eq!(p.tuple_desc()[0].onion, PosOnion::Onion(Onion::Swp));
    assert!(matches!(p, PlanNode::LocalEncrypt { .. }));
}

#[test]
fn preserve_original_is_fully_plain() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("t", &field("a"), Onion::Ope);
    set.complete(&schema());

    let mut stmt = select(vec![proj(field("a")), proj(field("b"))], from_table("t"));
    stmt.filter = Some(cmp(CmpOp::Lt, field("a"), int(10)));
    stmt.limit = Some(7);

    let p = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    assert!(p.tuple_desc().iter().all(|d| d.is_plain()));

    // no local stages, so the limit stayed server-side
    let mut leaf = &p;
    while let Some(child) = leaf.child() {
        leaf = child;
    }
    similar_asserts::assert_eq!(
        leaf.as_pure_remote_sql().unwrap().to_string(),
        "SELECT a$DET, b$DET FROM t$enc WHERE a$OPE < encrypt(10, OPE) LIMIT 7"
    );
}

#[test]
fn larger_onion_set_decrypts_no_less() {
    let mut a_set = OnionSet::new();
    a_set.complete(&schema());
    let mut b_set = OnionSet::new();
    b_set.add("t", &field("a"), Onion::Ope);
    b_set.complete(&schema());

    let make = || {
        let mut stmt = select(vec![proj(field("a"))], from_table("t"));
        stmt.filter = Some(cmp(CmpOp::Gt, func("f", vec![field("a")]), int(3)));
        stmt
    };

    let mut arena_a = arena();
    let plan_a = plan(&mut arena_a, make(), &a_set, &EncContext::PreserveOriginal);
    let mut arena_b = arena();
    let plan_b = plan(&mut arena_b, make(), &b_set, &EncContext::PreserveOriginal);

    let (mut decrypts_a, mut decrypts_b) = (Vec::new(), Vec::new());
    collect_decrypt_positions(&plan_a, &mut decrypts_a);
    collect_decrypt_positions(&plan_b, &mut decrypts_b);
    let flat_a: Vec<usize> = decrypts_a.concat();
    let flat_b: Vec<usize> = decrypts_b.concat();
    assert!(flat_a.iter().all(|p| flat_b.contains(p)));
}

#[test]
fn plans_serialize_structurally() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("t", &field("a"), Onion::Ope);
    set.complete(&schema());

    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.order_by = vec![ColumnSort {
        direction: SortDirection::Asc,
        column: field("a"),
    }];
    let p = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);

    // callers persist candidate plans; the serialized tree keeps the stage
    // structure and per-position onions intact
    let json = serde_json::to_value(&p).unwrap();
    let transform = &json["LocalTransform"];
    assert_eq!(transform["ops"], serde_json::json!([{ "Pass": 0 }]));
    let decrypt = &transform["child"]["LocalDecrypt"];
    assert_eq!(decrypt["positions"], serde_json::json!([0]));
    let remote = &decrypt["child"]["RemoteSql"];
    assert_eq!(
        remote["tuple_desc"],
        serde_json::json!([
            { "onion": { "Onion": "Det" }, "vector_ctx": false },
            { "onion": { "Onion": "Ope" }, "vector_ctx": false },
        ])
    );
}

#[test]
fn candidate_enumeration_produces_distinct_plans() {
    let mut arena = arena();
    let mut stmt = select(vec![proj(field("a"))], from_table("t"));
    stmt.filter = Some(cmp(CmpOp::Eq, field("a"), int(5)));
    let bound = bind_stmt(&mut arena, stmt).unwrap();

    let candidates = generate_candidate_plans(&arena, &bound).unwrap();
    assert!(!candidates.is_empty());
    for (i, (p, ctx)) in candidates.iter().enumerate() {
        p.validate().unwrap();
        assert!(
            ctx.onion_set
                .lookup("t", &field("a"))
                .unwrap()
                .1
                .contains(Onion::Det)
        );
        for (other, _) in &candidates[i + 1..] {
            assert_ne!(p, other);
        }
    }
}

#[test]
fn wildcard_projection_is_rejected() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.complete(&schema());

    let stmt = select(vec![Projection::Star], from_table("t"));
    let bound = bind_stmt(&mut arena, stmt).unwrap();
    assert!(generate_plan(&arena, &bound, &set, &EncContext::PreserveOriginal).is_err());
}

#[test]
fn group_key_without_comparable_onion_fails_loudly() {
    let mut arena = arena();
    // an onion set that stores k only under HOM row descriptors
    let mut set = OnionSet::new();
    set.add_packed_hom_to_last_group("t", &field("k"));

    let mut stmt = select(vec![proj(agg(AggFunc::Sum, field("x")))], from_table("t"));
    stmt.group_by = Some(GroupBy {
        keys: vec![field("k")],
        having: None,
    });
    let bound = bind_stmt(&mut arena, stmt).unwrap();
    assert!(generate_plan(&arena, &bound, &set, &EncContext::PreserveOriginal).is_err());
}

#[test]
fn subquery_relation_inlines_when_pure() {
    let mut arena = arena();
    let mut set = OnionSet::new();
    set.add("u", &field("b"), Onion::Ope);
    set.complete(&schema());

    let inner = select(
        vec![Projection::Expr {
            expr: field("b"),
            name: Some("m".to_string()),
        }],
        from_table("u"),
    );
    let mut stmt = select(
        vec![proj(qfield("s", "m"))],
        vec![RelationDecl {
            alias: "s".to_string(),
            kind: RelationKind::Subquery(Box::new(inner)),
        }],
    );
    stmt.filter = Some(cmp(CmpOp::Lt, qfield("s", "m"), int(100)));

    let p = plan(&mut arena, stmt, &set, &EncContext::PreserveOriginal);
    // the inner select is nested server SQL, not a materialization
    let sql = p
        .as_pure_remote_sql()
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            let mut cur = &p;
            while let Some(child) = cur.child() {
                cur = child;
            }
            cur.as_pure_remote_sql().unwrap().to_string()
        });
    assert!(sql.contains("FROM (SELECT"), "got: {sql}");
    assert!(sql.contains(") AS s"), "got: {sql}");
}
