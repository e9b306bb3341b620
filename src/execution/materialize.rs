use std::cell::RefCell;
use std::sync::Arc;

use crate::catalog::SchemaRef;
use crate::error::VellumResult;
use crate::execution::run::{Run, RunIterator};
use crate::execution::{QueryOperator, RecordStream};

/// Buffers a source operator's output so it can be backtracked over; used
/// for the right side of a sort-merge join when the input is already sorted
/// but not materialized.
pub struct MaterializeOperator {
    source: Box<dyn QueryOperator>,
    buffered: RefCell<Option<Arc<Run>>>,
}

impl MaterializeOperator {
    pub fn new(source: Box<dyn QueryOperator>) -> Self {
        MaterializeOperator {
            source,
            buffered: RefCell::new(None),
        }
    }

    fn materialize(&self) -> VellumResult<Arc<Run>> {
        if let Some(run) = self.buffered.borrow().as_ref() {
            return Ok(run.clone());
        }
        let mut run = Run::new(self.source.schema());
        for record in self.source.iterator()? {
            run.add(record);
        }
        let run = Arc::new(run);
        *self.buffered.borrow_mut() = Some(run.clone());
        Ok(run)
    }
}

impl QueryOperator for MaterializeOperator {
    fn schema(&self) -> SchemaRef {
        self.source.schema()
    }

    fn iterator(&self) -> VellumResult<RecordStream<'_>> {
        Ok(Box::new(self.backtracking_iterator()?))
    }

    fn sorted_by(&self) -> Vec<String> {
        self.source.sorted_by()
    }

    fn materialized(&self) -> bool {
        true
    }

    fn backtracking_iterator(&self) -> VellumResult<RunIterator> {
        Ok(RunIterator::new(self.materialize()?))
    }

    fn estimate_pages(&self) -> usize {
        self.source.estimate_pages()
    }

    fn estimate_io_cost(&self) -> usize {
        self.source.estimate_io_cost()
    }
}
