use std::sync::Arc;

use crate::catalog::SchemaRef;
use crate::storage::Tuple;

/// A materialized sequence of records: the unit the external sort produces
/// and merges. Supports append while being built and restartable iteration
/// once frozen behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Run {
    schema: SchemaRef,
    records: Vec<Tuple>,
}

impl Run {
    pub fn new(schema: SchemaRef) -> Self {
        Run {
            schema,
            records: Vec::new(),
        }
    }

    pub fn from_records(schema: SchemaRef, records: Vec<Tuple>) -> Self {
        Run { schema, records }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn add(&mut self, record: Tuple) {
        self.records.push(record);
    }

    pub fn add_all(&mut self, records: impl IntoIterator<Item = Tuple>) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Tuple] {
        &self.records
    }
}

/// Backtracking iterator over a run. `mark_prev`/`mark_next` pin a position;
/// `reset` rewinds to it. Starting a fresh iterator always begins at the
/// first record, which is what makes runs re-iterable.
#[derive(Debug, Clone)]
pub struct RunIterator {
    run: Arc<Run>,
    cursor: usize,
    mark: usize,
}

impl RunIterator {
    pub fn new(run: Arc<Run>) -> Self {
        RunIterator {
            run,
            cursor: 0,
            mark: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.run.len()
    }

    /// Mark the record most recently returned by `next`, so `reset` replays
    /// it.
    pub fn mark_prev(&mut self) {
        self.mark = self.cursor.saturating_sub(1);
    }

    /// Mark the record `next` would return now.
    pub fn mark_next(&mut self) {
        self.mark = self.cursor;
    }

    pub fn reset(&mut self) {
        self.cursor = self.mark;
    }
}

impl Iterator for RunIterator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        let record = self.run.records().get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType, Schema};
    use crate::utils::scalar::ScalarValue;

    fn int_run(values: &[i32]) -> Arc<Run> {
        let schema = Arc::new(Schema::new(vec![Column::new("v", DataType::Int32)]));
        let records = values
            .iter()
            .map(|v| Tuple::new(schema.clone(), vec![ScalarValue::from(*v)]))
            .collect();
        Arc::new(Run::from_records(schema, records))
    }

    fn first_value(t: &Tuple) -> i32 {
        match t.value(0) {
            ScalarValue::Int32(Some(v)) => *v,
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn iterates_in_order_and_restarts() {
        let run = int_run(&[1, 2, 3]);
        let collected: Vec<i32> = RunIterator::new(run.clone()).map(|t| first_value(&t)).collect();
        assert_eq!(collected, vec![1, 2, 3]);
        // A fresh iterator starts over.
        let again: Vec<i32> = RunIterator::new(run).map(|t| first_value(&t)).collect();
        assert_eq!(again, vec![1, 2, 3]);
    }

    #[test]
    fn mark_and_reset_replay() {
        let run = int_run(&[10, 20, 30, 40]);
        let mut iter = RunIterator::new(run);
        iter.next(); // 10
        iter.next(); // 20
        iter.mark_prev(); // pin 20
        iter.next(); // 30
        iter.reset();
        assert_eq!(first_value(&iter.next().unwrap()), 20);

        iter.mark_next(); // pin 30
        iter.next(); // 30
        iter.next(); // 40
        assert!(!iter.has_next());
        iter.reset();
        assert_eq!(first_value(&iter.next().unwrap()), 30);
    }
}
