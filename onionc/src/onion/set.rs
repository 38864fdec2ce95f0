//! Onion sets: the catalog of which encrypted representations exist for
//! each base column and precomputed expression, plus packed HOM groups.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{Onion, OnionMask};
use crate::ast::Expr;
use crate::codegen::{VALID_IDENT, write_expr};
use crate::schema::Schema;

/// One candidate location of an expression inside a packed HOM group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomDesc {
    pub table: String,
    pub group: usize,
    /// Position of the expression within the group's ciphertext row.
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OnionEntry {
    /// Physical base name; the server column is `<base>$<onion>`.
    base: String,
    mask: OnionMask,
}

/// Mapping from (table, canonical expression) to onion bitmask, plus per
/// table the ordered packed HOM groups. Keys are canonical SQL text, so any
/// two syntactically identical expressions collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionSet {
    entries: BTreeMap<String, BTreeMap<String, OnionEntry>>,
    packed_homs: BTreeMap<String, Vec<Vec<String>>>,
}

impl OnionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `onion` for a canonical expression of `table`. Physical base
    /// names are owned by the set: bare columns keep their name, compound
    /// expressions get `virt{n}` in insertion order.
    pub fn add(&mut self, table: &str, canonical: &Expr, onion: Onion) {
        self.add_key(table, write_expr(canonical), onion);
    }

    fn add_key(&mut self, table: &str, key: String, onion: Onion) {
        let table_entries = self.entries.entry(table.to_string()).or_default();
        if let Some(entry) = table_entries.get_mut(&key) {
            entry.mask |= onion.mask();
            return;
        }
        let base = if VALID_IDENT.is_match(&key) && !key.contains('$') {
            key.clone()
        } else {
            let virts = table_entries
                .values()
                .filter(|e| e.base.starts_with("virt"))
                .count();
            format!("virt{virts}")
        };
        table_entries.insert(
            key,
            OnionEntry {
                base,
                mask: onion.mask(),
            },
        );
    }

    /// `Some((base_name, mask))` when the canonical expression is stored for
    /// `table`.
    pub fn lookup(&self, table: &str, canonical: &Expr) -> Option<(String, OnionMask)> {
        let entry = self.entries.get(table)?.get(&write_expr(canonical))?;
        Some((entry.base.clone(), entry.mask))
    }

    /// All `(group, position)` pairs where the canonical expression occurs
    /// in a packed HOM group of `table`.
    pub fn lookup_packed_hom(&self, table: &str, canonical: &Expr) -> Vec<HomDesc> {
        let key = write_expr(canonical);
        let Some(groups) = self.packed_homs.get(table) else {
            return Vec::new();
        };
        groups
            .iter()
            .enumerate()
            .filter_map(|(group, exprs)| {
                exprs.iter().position(|e| *e == key).map(|pos| HomDesc {
                    table: table.to_string(),
                    group,
                    pos,
                })
            })
            .collect()
    }

    /// Append the canonical expression to the last packed HOM group of
    /// `table`, starting a first group if none exists. No-op when the
    /// expression is already packed somewhere.
    pub fn add_packed_hom_to_last_group(&mut self, table: &str, canonical: &Expr) {
        if !self.lookup_packed_hom(table, canonical).is_empty() {
            return;
        }
        let key = write_expr(canonical);
        let groups = self.packed_homs.entry(table.to_string()).or_default();
        if groups.is_empty() {
            groups.push(Vec::new());
        }
        groups.last_mut().unwrap().push(key);
    }

    pub fn packed_groups(&self, table: &str) -> &[Vec<String>] {
        self.packed_homs
            .get(table)
            .map(|g| g.as_slice())
            .unwrap_or(&[])
    }

    /// Fill in DET so every base column of every table has at least DET.
    pub fn complete(&mut self, defns: &Schema) {
        for table in defns.tables.values() {
            for col in &table.columns {
                self.add_key(&table.name, col.name.clone(), Onion::Det);
            }
        }
    }

    /// Union of two sets; masks are or-ed, packed groups concatenated
    /// (identical groups deduplicated), base names reassigned in
    /// deterministic order.
    pub fn merge(&self, other: &OnionSet) -> OnionSet {
        let mut merged = OnionSet::new();
        for (table, entries) in self.entries.iter().chain(other.entries.iter()) {
            for (key, entry) in entries {
                for onion in entry.mask.to_seq() {
                    merged.add_key(table, key.clone(), onion);
                }
            }
        }
        for (table, groups) in self.packed_homs.iter().chain(other.packed_homs.iter()) {
            let into = merged.packed_homs.entry(table.clone()).or_default();
            for group in groups {
                if !into.contains(group) {
                    into.push(group.clone());
                }
            }
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.packed_homs.is_empty()
    }
}

impl std::fmt::Display for OnionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (table, entries) in &self.entries {
            for (key, entry) in entries {
                writeln!(
                    f,
                    "{table}.{key} -> {} [{}]",
                    entry.base,
                    entry.mask.to_seq().iter().join("|")
                )?;
            }
        }
        for (table, groups) in &self.packed_homs {
            for (i, group) in groups.iter().enumerate() {
                writeln!(f, "{table} hom group {i}: {}", group.iter().join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, ExprKind, FieldIdent, Literal};
    use crate::schema::{DataType, table};

    fn field(name: &str) -> Expr {
        ExprKind::Field(FieldIdent::new(None, name)).into()
    }

    fn discount_expr() -> Expr {
        // l_extendedprice * (1 - l_discount)
        ExprKind::Binary {
            op: BinOp::Mul,
            left: Box::new(field("l_extendedprice")),
            right: Box::new(
                ExprKind::Binary {
                    op: BinOp::Sub,
                    left: Box::new(ExprKind::Literal(Literal::Integer(1)).into()),
                    right: Box::new(field("l_discount")),
                }
                .into(),
            ),
        }
        .into()
    }

    #[test]
    fn column_entries_keep_their_name() {
        let mut set = OnionSet::new();
        set.add("t", &field("a"), Onion::Ope);
        set.add("t", &field("a"), Onion::Det);
        let (base, mask) = set.lookup("t", &field("a")).unwrap();
        assert_eq!(base, "a");
        assert_eq!(mask.to_seq(), vec![Onion::Det, Onion::Ope]);
    }

    #[test]
    fn compound_entries_get_virtual_names() {
        let mut set = OnionSet::new();
        set.add("lineitem", &discount_expr(), Onion::Det);
        let (base, _) = set.lookup("lineitem", &discount_expr()).unwrap();
        assert_eq!(base, "virt0");
    }

    #[test]
    fn packed_hom_groups() {
        let mut set = OnionSet::new();
        set.add_packed_hom_to_last_group("lineitem", &field("l_quantity"));
        set.add_packed_hom_to_last_group("lineitem", &discount_expr());
        let descs = set.lookup_packed_hom("lineitem", &discount_expr());
        assert_eq!(
            descs,
            vec![HomDesc {
                table: "lineitem".into(),
                group: 0,
                pos: 1,
            }]
        );
        // re-adding is a no-op
        set.add_packed_hom_to_last_group("lineitem", &discount_expr());
        assert_eq!(set.packed_groups("lineitem")[0].len(), 2);
    }

    #[test]
    fn complete_gives_every_column_det() {
        let defns = Schema::new([table("t", &[("a", DataType::Int), ("b", DataType::Text)])]);
        let mut set = OnionSet::new();
        set.add("t", &field("a"), Onion::Ope);
        set.complete(&defns);
        assert!(set.lookup("t", &field("a")).unwrap().1.contains(Onion::Det));
        assert!(set.lookup("t", &field("b")).unwrap().1.contains(Onion::Det));
    }

    #[test]
    fn merge_unions_masks() {
        let mut a = OnionSet::new();
        a.add("t", &field("a"), Onion::Det);
        let mut b = OnionSet::new();
        b.add("t", &field("a"), Onion::Ope);
        b.add("t", &field("b"), Onion::Swp);
        let m = a.merge(&b);
        assert_eq!(
            m.lookup("t", &field("a")).unwrap().1.to_seq(),
            vec![Onion::Det, Onion::Ope]
        );
        assert!(m.lookup("t", &field("b")).unwrap().1.contains(Onion::Swp));
    }
}
