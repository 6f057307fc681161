use serde::{Deserialize, Serialize};

/// Source-neutral semantic type tag, per the column descriptor in the data
/// model: `int16|int32|int64|float32|float64|decimal(p,s)|bool|string|text|
/// bytes|date|time|timestamp|uuid|json|array`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal { precision: u32, scale: u32 },
    Bool,
    String,
    Text,
    Bytes,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// Every variant a source adapter may emit. Used by property test P6
    /// (`map_types` totality) to iterate the full semantic type set.
    pub fn all_scalars() -> Vec<ColumnType> {
        vec![
            ColumnType::Int16,
            ColumnType::Int32,
            ColumnType::Int64,
            ColumnType::Float32,
            ColumnType::Float64,
            ColumnType::Decimal {
                precision: 18,
                scale: 4,
            },
            ColumnType::Bool,
            ColumnType::String,
            ColumnType::Text,
            ColumnType::Bytes,
            ColumnType::Date,
            ColumnType::Time,
            ColumnType::Timestamp,
            ColumnType::Uuid,
            ColumnType::Json,
            ColumnType::Array(Box::new(ColumnType::String)),
        ]
    }
}

/// `{name, semantic type, optional length/precision/scale, nullable,
/// optional default expression}`, plus an adapter-carried `full_type` for
/// round-trip fidelity (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    pub nullable: bool,
    pub length: Option<u32>,
    pub default_expr: Option<String>,
    /// Adapter-native type string, kept for round-trip fidelity (e.g.
    /// `"varchar(255)"`, `"numeric(10,2)"`). Never interpreted by the
    /// engine or by a different adapter.
    pub full_type: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
            length: None,
            default_expr: None,
            full_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Ordered list of column descriptors plus the auxiliary metadata a
/// relational source can retrieve on demand (spec.md §3 "Table schema").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_constraints: Vec<Index>,
    pub indexes: Vec<Index>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_scalars_covers_every_glossary_type() {
        let types = ColumnType::all_scalars();
        assert_eq!(types.len(), 15);
        assert!(types.contains(&ColumnType::Uuid));
        assert!(matches!(
            types.last(),
            Some(ColumnType::Array(inner)) if **inner == ColumnType::String
        ));
    }

    #[test]
    fn has_column_is_case_sensitive_exact_match() {
        let schema = TableSchema::new(vec![Column::new("id", ColumnType::Int64, false)]);
        assert!(schema.has_column("id"));
        assert!(!schema.has_column("Id"));
    }
}
