pub mod materialize;
pub mod run;
pub mod sort;
pub mod sort_merge_join;
pub mod values;

pub use materialize::MaterializeOperator;
pub use run::{Run, RunIterator};
pub use sort::SortOperator;
pub use sort_merge_join::SortMergeJoinOperator;
pub use values::ValuesOperator;

use crate::buffer::EFFECTIVE_PAGE_SIZE;
use crate::catalog::{Schema, SchemaRef};
use crate::error::{VellumError, VellumResult};
use crate::storage::Tuple;

pub type RecordStream<'a> = Box<dyn Iterator<Item = Tuple> + 'a>;

/// A record source in the volcano style: every operator yields a stream of
/// records and reports enough metadata (sort order, materialization, page
/// estimates) for the sort family to plan around it.
pub trait QueryOperator {
    fn schema(&self) -> SchemaRef;

    /// Records in this operator's output order.
    fn iterator(&self) -> VellumResult<RecordStream<'_>>;

    /// Columns this operator's output is sorted on, if any.
    fn sorted_by(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the output is materialized and therefore backtrackable.
    fn materialized(&self) -> bool {
        false
    }

    /// A restartable, markable iterator over the materialized output. Only
    /// meaningful when `materialized()` is true.
    fn backtracking_iterator(&self) -> VellumResult<RunIterator> {
        Err(VellumError::NotSupport(
            "operator output is not materialized".to_string(),
        ))
    }

    /// Estimated size of the output in pages; used for I/O cost estimates.
    fn estimate_pages(&self) -> usize;

    /// Estimated I/O cost of producing the output, for the planner only.
    fn estimate_io_cost(&self) -> usize;
}

/// Records that fit on one effective page under `schema`. Never zero, so
/// block arithmetic stays well-defined for wide records.
pub fn records_per_page(schema: &Schema) -> usize {
    (EFFECTIVE_PAGE_SIZE / schema.fixed_size().max(1)).max(1)
}
