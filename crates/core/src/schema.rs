//! Point-in-time snapshots of an external table's schema.
//!
//! Produced by connector introspection and consumed immediately by schema
//! validation. Never cached: external schemas change out-of-band.

use serde::{Deserialize, Serialize};

/// One live column of an external table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Physical type name as reported by `information_schema`.
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub max_length: Option<i64>,
}

/// A live external table and its columns in ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// Look up a column by exact name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_primary_key)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: "text".into(),
            is_nullable: !pk,
            is_primary_key: pk,
            max_length: None,
        }
    }

    #[test]
    fn column_lookup_is_exact() {
        let table = TableInfo {
            name: "leads".into(),
            columns: vec![column("id", true), column("email", false)],
        };
        assert!(table.has_column("email"));
        assert!(!table.has_column("Email"));
        let pks: Vec<_> = table.primary_key_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(pks, vec!["id"]);
    }
}
