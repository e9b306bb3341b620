//! External merge sort. Pass 0 slices the input into blocks of at most `B`
//! pages, sorts each block in memory, and materializes it as a run; later
//! passes merge up to `B - 1` runs at a time through a min-heap until one
//! run remains.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::catalog::SchemaRef;
use crate::error::{VellumError, VellumResult};
use crate::execution::run::{Run, RunIterator};
use crate::execution::{records_per_page, QueryOperator, RecordStream};
use crate::storage::Tuple;
use crate::utils::scalar::ScalarValue;

pub struct SortOperator {
    source: Box<dyn QueryOperator>,
    key_index: usize,
    key_name: String,
    /// Work-memory budget in pages (B). The merge fan-in is B - 1.
    num_buffers: usize,
    records_per_page: usize,
    sorted: RefCell<Option<Arc<Run>>>,
}

/// Heap entry for the k-way merge: ordered by key, then by run index so
/// ties drain lower-numbered runs first (stability across runs).
struct HeapEntry {
    key: ScalarValue,
    run_index: usize,
    record: Tuple,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .total_cmp(&other.key)
            .then(self.run_index.cmp(&other.run_index))
    }
}

impl SortOperator {
    pub fn new(
        source: Box<dyn QueryOperator>,
        column_name: &str,
        num_buffers: usize,
    ) -> VellumResult<Self> {
        if num_buffers < 3 {
            return Err(VellumError::Execution(format!(
                "external sort needs at least 3 work-memory pages, got {}",
                num_buffers
            )));
        }
        let schema = source.schema();
        let key_index = schema.index_of(column_name)?;
        let key_name = schema.columns[key_index].name.clone();
        let records_per_page = records_per_page(&schema);
        Ok(SortOperator {
            source,
            key_index,
            key_name,
            num_buffers,
            records_per_page,
            sorted: RefCell::new(None),
        })
    }

    /// Override the per-page record count; tests use this to pin pass-0
    /// block boundaries.
    pub fn with_records_per_page(mut self, records_per_page: usize) -> Self {
        self.records_per_page = records_per_page.max(1);
        self
    }

    fn compare(&self, a: &Tuple, b: &Tuple) -> CmpOrdering {
        a.value(self.key_index).total_cmp(b.value(self.key_index))
    }

    /// Sort everything `records` yields in memory and materialize it as one
    /// run. The sort is stable, so equal keys keep their input order.
    pub fn sort_run(&self, records: impl Iterator<Item = Tuple>) -> Run {
        let mut buffered: Vec<Tuple> = records.collect();
        buffered.sort_by(|a, b| self.compare(a, b));
        Run::from_records(self.source.schema(), buffered)
    }

    /// Merge up to `B - 1` sorted runs into one. The heap never holds more
    /// than one entry per input run.
    pub fn merge(&self, runs: Vec<Run>) -> Run {
        debug_assert!(runs.len() <= self.num_buffers - 1);
        let mut output = Run::new(self.source.schema());
        let mut positions = vec![0usize; runs.len()];
        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(runs.len());

        for (run_index, run) in runs.iter().enumerate() {
            if let Some(record) = run.records().first() {
                heap.push(Reverse(HeapEntry {
                    key: record.value(self.key_index).clone(),
                    run_index,
                    record: record.clone(),
                }));
            }
        }
        while let Some(Reverse(entry)) = heap.pop() {
            output.add(entry.record);
            positions[entry.run_index] += 1;
            if let Some(record) = runs[entry.run_index].records().get(positions[entry.run_index]) {
                heap.push(Reverse(HeapEntry {
                    key: record.value(self.key_index).clone(),
                    run_index: entry.run_index,
                    record: record.clone(),
                }));
            }
        }
        output
    }

    /// One merge pass: merge contiguous groups of `B - 1` runs (the last
    /// group may be smaller).
    pub fn merge_pass(&self, runs: Vec<Run>) -> Vec<Run> {
        let fan_in = self.num_buffers - 1;
        let mut output = Vec::new();
        let mut group: Vec<Run> = Vec::with_capacity(fan_in);
        for run in runs {
            group.push(run);
            if group.len() == fan_in {
                output.push(self.merge(std::mem::take(&mut group)));
            }
        }
        if !group.is_empty() {
            output.push(self.merge(group));
        }
        output
    }

    /// Full external sort: pass 0 builds ⌈N/B⌉ sorted runs, then merge
    /// passes run until a single run remains.
    pub fn sort(&self) -> VellumResult<Run> {
        let mut source_iter = self.source.iterator()?;
        let block_capacity = self.num_buffers * self.records_per_page;

        let mut runs: Vec<Run> = Vec::new();
        loop {
            let block: Vec<Tuple> = source_iter.by_ref().take(block_capacity).collect();
            if block.is_empty() {
                break;
            }
            runs.push(self.sort_run(block.into_iter()));
        }
        if runs.is_empty() {
            return Ok(Run::new(self.source.schema()));
        }
        while runs.len() > 1 {
            runs = self.merge_pass(runs);
        }
        Ok(runs.pop().expect("at least one run"))
    }

    fn sorted_run(&self) -> VellumResult<Arc<Run>> {
        if let Some(run) = self.sorted.borrow().as_ref() {
            return Ok(run.clone());
        }
        let run = Arc::new(self.sort()?);
        *self.sorted.borrow_mut() = Some(run.clone());
        Ok(run)
    }
}

impl QueryOperator for SortOperator {
    fn schema(&self) -> SchemaRef {
        self.source.schema()
    }

    fn iterator(&self) -> VellumResult<RecordStream<'_>> {
        Ok(Box::new(self.backtracking_iterator()?))
    }

    fn sorted_by(&self) -> Vec<String> {
        vec![self.key_name.clone()]
    }

    fn materialized(&self) -> bool {
        true
    }

    fn backtracking_iterator(&self) -> VellumResult<RunIterator> {
        Ok(RunIterator::new(self.sorted_run()?))
    }

    fn estimate_pages(&self) -> usize {
        self.source.estimate_pages()
    }

    /// 2N(1 + ⌈log_{B-1}⌈N/B⌉⌉) plus the source's own cost.
    fn estimate_io_cost(&self) -> usize {
        let n = self.source.estimate_pages();
        if n == 0 {
            return self.source.estimate_io_cost();
        }
        let b = self.num_buffers as f64;
        let pass0_runs = (n as f64 / b).ceil();
        let merge_passes = (pass0_runs.ln() / (b - 1.0).ln()).ceil().max(0.0);
        let passes = 1.0 + merge_passes;
        (2.0 * n as f64 * passes) as usize + self.source.estimate_io_cost()
    }
}
