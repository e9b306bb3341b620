pub mod disk_manager;
pub mod tuple;

pub use disk_manager::{DiskSpaceManager, PartitionId, LOG_PARTITION};
pub use tuple::Tuple;
