//! Table column metadata and the per-table cache the Normalizer consults
//! to interpret raw row values (spec.md §4.3).
//!
//! Generalized from `akkw-mini-canal`'s `TableMeta`/`FieldMeta`
//! (`log::metadata`) and its DDL-driven `TableMetaCache`
//! (`instance::table_meta_cache`), which stored everything as
//! stringly-typed `column_type` text; here the MySQL column domain this
//! crate actually needs to interpret (spec.md §4.3) is a proper enum.

use std::collections::HashMap;

/// The subset of MySQL column kinds whose on-the-wire representation
/// needs special interpretation by the Normalizer (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    Enum(Vec<String>),
    Set(Vec<String>),
    Bit,
    DateTime,
    Timestamp,
    Json,
    /// Any column kind with no special decode rule: decoded as-is.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub kind: ColumnKind,
    pub is_primary_key: bool,
    pub nullable: bool,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_primary_key: false,
            nullable: true,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }
}

/// Column metadata for one table, in column-index order (spec.md §4.3:
/// "column name order = column index").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetadata {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn column_at(&self, index: usize) -> Option<&ColumnMetadata> {
        self.columns.get(index)
    }

    /// Ordered list of primary-key column names (spec.md §3 `primaryKey`).
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Cache of `TableMetadata` keyed by `schema.table`, refreshed whenever a
/// DDL or table-structure-change event is observed (spec.md §4.3, §4.6.1).
#[derive(Debug, Default)]
pub struct TableMetadataCache {
    tables: HashMap<String, TableMetadata>,
}

impl TableMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<&TableMetadata> {
        self.tables.get(&format!("{schema}.{table}"))
    }

    /// Prime or replace the cached metadata for one table. Used both for
    /// the initial dump-before-stream scan (SPEC_FULL.md §3) and for
    /// DDL/table-changed refresh (spec.md §4.3, §4.6.1).
    pub fn prime(&mut self, metadata: TableMetadata) {
        self.tables.insert(metadata.full_name(), metadata);
    }

    pub fn invalidate(&mut self, schema: &str, table: &str) {
        self.tables.remove(&format!("{schema}.{table}"));
    }
}
