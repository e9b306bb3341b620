//! Sort-merge join. Both inputs are sorted on their join keys (wrapped in a
//! sort if not already); the right input is materialized so its iterator can
//! mark the start of an equal-key block and rewind to it once per matching
//! left record.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::catalog::{Schema, SchemaRef};
use crate::error::VellumResult;
use crate::execution::materialize::MaterializeOperator;
use crate::execution::run::RunIterator;
use crate::execution::sort::SortOperator;
use crate::execution::{QueryOperator, RecordStream};
use crate::storage::Tuple;

pub struct SortMergeJoinOperator {
    left: Box<dyn QueryOperator>,
    right: Box<dyn QueryOperator>,
    left_key: usize,
    right_key: usize,
    left_column: String,
    right_column: String,
    schema: SchemaRef,
}

impl SortMergeJoinOperator {
    pub fn new(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        num_buffers: usize,
    ) -> VellumResult<Self> {
        // Left input only needs to be sorted.
        let left = if left.sorted_by().iter().any(|c| c == left_column) {
            left
        } else {
            Box::new(SortOperator::new(left, left_column, num_buffers)?)
        };
        // Right input must be sorted and materialized: the merge backtracks
        // over it.
        let right = if !right.sorted_by().iter().any(|c| c == right_column) {
            Box::new(SortOperator::new(right, right_column, num_buffers)?)
                as Box<dyn QueryOperator>
        } else if !right.materialized() {
            Box::new(MaterializeOperator::new(right))
        } else {
            right
        };

        let left_key = left.schema().index_of(left_column)?;
        let right_key = right.schema().index_of(right_column)?;
        let schema = Arc::new(Schema::concat(&left.schema(), &right.schema()));
        Ok(SortMergeJoinOperator {
            left,
            right,
            left_key,
            right_key,
            left_column: left_column.to_string(),
            right_column: right_column.to_string(),
            schema,
        })
    }
}

impl QueryOperator for SortMergeJoinOperator {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn iterator(&self) -> VellumResult<RecordStream<'_>> {
        Ok(Box::new(SortMergeIterator::new(
            self.left.iterator()?,
            self.right.backtracking_iterator()?,
            self.left_key,
            self.right_key,
        )))
    }

    fn sorted_by(&self) -> Vec<String> {
        vec![self.left_column.clone(), self.right_column.clone()]
    }

    fn estimate_pages(&self) -> usize {
        self.left.estimate_pages() + self.right.estimate_pages()
    }

    fn estimate_io_cost(&self) -> usize {
        0
    }
}

/// Pull iterator over the merge. State is the current pair of records plus
/// whether the right iterator's mark sits at the start of the equal-key
/// block being scanned.
struct SortMergeIterator<'a> {
    left: RecordStream<'a>,
    right: RunIterator,
    left_record: Option<Tuple>,
    right_record: Option<Tuple>,
    marked: bool,
    left_key: usize,
    right_key: usize,
}

impl<'a> SortMergeIterator<'a> {
    fn new(
        mut left: RecordStream<'a>,
        mut right: RunIterator,
        left_key: usize,
        right_key: usize,
    ) -> Self {
        right.mark_next();
        let left_record = left.next();
        let right_record = right.next();
        let left_record = if right_record.is_some() {
            left_record
        } else {
            // Either side empty: the join is empty.
            None
        };
        SortMergeIterator {
            left,
            right,
            left_record,
            right_record,
            marked: false,
            left_key,
            right_key,
        }
    }

    fn compare(&self, left: &Tuple, right: &Tuple) -> CmpOrdering {
        left.value(self.left_key).total_cmp(right.value(self.right_key))
    }

    /// Advance until one joined pair is produced or the input is exhausted.
    fn fetch_next(&mut self) -> Option<Tuple> {
        loop {
            let left = self.left_record.clone()?;
            let right = self.right_record.clone()?;
            match self.compare(&left, &right) {
                CmpOrdering::Less => {
                    if self.marked {
                        // The scan block for this left record just ended:
                        // move to the next left and rewind right to the
                        // block start.
                        self.marked = false;
                        self.left_record = self.left.next();
                        self.right.reset();
                        self.right_record = self.right.next();
                        if self.right_record.is_none() {
                            self.left_record = None;
                        }
                    } else if self.right.has_next() {
                        self.right_record = self.right.next();
                    } else {
                        self.right.reset();
                        self.right_record = self.right.next();
                        self.left_record = self.left.next();
                        if self.right_record.is_none() {
                            self.left_record = None;
                        }
                    }
                }
                CmpOrdering::Greater => {
                    // Skip right past all smaller keys; mark where the keys
                    // catch up.
                    let mut caught_up = false;
                    while self.right.has_next() {
                        let candidate = self.right.next().expect("has_next");
                        let reached = self.compare(&left, &candidate) != CmpOrdering::Greater;
                        self.right_record = Some(candidate);
                        if reached {
                            self.right.mark_prev();
                            caught_up = true;
                            break;
                        }
                    }
                    if !caught_up {
                        // Right exhausted below the left key: no more
                        // matches are possible.
                        self.left_record = None;
                        return None;
                    }
                }
                CmpOrdering::Equal => {
                    let joined = left.concat(&right);
                    self.marked = true;
                    if self.right.has_next() {
                        self.right_record = self.right.next();
                    } else {
                        // Equal-key block ends at the right input's end:
                        // rewind for the next left record.
                        self.right.reset();
                        self.right_record = self.right.next();
                        self.left_record = self.left.next();
                        if self.right_record.is_none() {
                            self.left_record = None;
                        }
                    }
                    return Some(joined);
                }
            }
        }
    }
}

impl Iterator for SortMergeIterator<'_> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.fetch_next()
    }
}
