use std::sync::Arc;

use crate::catalog::DataType;
use crate::error::{VellumError, VellumResult};

pub type SchemaRef = Arc<Schema>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Column {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema { columns }
    }

    /// Index of the column named `name`.
    pub fn index_of(&self, name: &str) -> VellumResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| VellumError::Internal(format!("Column {} not found in schema", name)))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Byte width of one record under this schema. Types are fixed-width, so
    /// the sort executor can convert work-memory pages into record counts.
    pub fn fixed_size(&self) -> usize {
        self.columns.iter().map(|c| c.data_type.fixed_size()).sum()
    }

    /// Schema of the concatenation of two records (left fields then right).
    pub fn concat(left: &Schema, right: &Schema) -> Schema {
        let mut columns = left.columns.clone();
        columns.extend(right.columns.iter().cloned());
        Schema::new(columns)
    }
}
