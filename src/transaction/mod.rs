mod transaction;

pub use transaction::{Transaction, TransactionId, TransactionStatus, INVALID_TRANSACTION_ID};
