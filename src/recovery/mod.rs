mod log_manager;
mod log_record;
mod recovery_manager;

pub use log_manager::{LogManager, LogScan, LOG_BASE_LSN};
pub use log_record::{LogRecord, LogRecordType};
pub use recovery_manager::{RecoveryManager, TransactionFactory, TransactionTableEntry};

/// Log sequence number: monotonically increasing position of a record in the
/// log. Zero is "no record" in back-chains.
pub type Lsn = u64;
