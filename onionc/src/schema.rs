//! Logical schema definitions and table statistics.
//!
//! Loaded from a backing database by an external collaborator; the planner
//! only reads them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Decimal,
    Text,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Schema definitions table: base tables by name, in deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: BTreeMap<String, TableDef>,
}

impl Schema {
    pub fn new(tables: impl IntoIterator<Item = TableDef>) -> Self {
        Schema {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }
}

/// Per-table statistics, consumed by the external cost ranker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub row_counts: BTreeMap<String, u64>,
}

impl Statistics {
    pub fn row_count(&self, table: &str) -> Option<u64> {
        self.row_counts.get(table).copied()
    }
}

/// Convenience constructor used across tests and examples.
pub fn table(name: &str, columns: &[(&str, DataType)]) -> TableDef {
    TableDef {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|(n, ty)| ColumnDef {
                name: n.to_string(),
                ty: *ty,
            })
            .collect(),
    }
}
