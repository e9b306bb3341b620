use std::sync::Arc;

use crate::catalog::SchemaRef;
use crate::error::VellumResult;
use crate::execution::run::{Run, RunIterator};
use crate::execution::{records_per_page, QueryOperator, RecordStream};
use crate::storage::Tuple;

/// In-memory record source. Materialized by construction, so it can serve a
/// backtracking iterator directly; callers that know their rows are ordered
/// can declare the sort columns.
pub struct ValuesOperator {
    schema: SchemaRef,
    rows: Vec<Tuple>,
    sorted_by: Vec<String>,
}

impl ValuesOperator {
    pub fn new(schema: SchemaRef, rows: Vec<Tuple>) -> Self {
        ValuesOperator {
            schema,
            rows,
            sorted_by: Vec::new(),
        }
    }

    /// Declare that `rows` are already ordered on these columns.
    pub fn with_sorted_by(mut self, columns: Vec<String>) -> Self {
        self.sorted_by = columns;
        self
    }
}

impl QueryOperator for ValuesOperator {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn iterator(&self) -> VellumResult<RecordStream<'_>> {
        Ok(Box::new(self.rows.iter().cloned()))
    }

    fn sorted_by(&self) -> Vec<String> {
        self.sorted_by.clone()
    }

    fn materialized(&self) -> bool {
        true
    }

    fn backtracking_iterator(&self) -> VellumResult<RunIterator> {
        Ok(RunIterator::new(Arc::new(Run::from_records(
            self.schema.clone(),
            self.rows.clone(),
        ))))
    }

    fn estimate_pages(&self) -> usize {
        self.rows.len().div_ceil(records_per_page(&self.schema))
    }

    fn estimate_io_cost(&self) -> usize {
        0
    }
}
