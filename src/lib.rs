//! Transactional resource management for a small disk-based database: the
//! buffer pool, the wait-die lock table and the per-transaction lock
//! bookkeeping, with the file, log and recovery pieces they sit on.

pub mod buffermanager;
pub mod concurrencymanager;
pub mod db;
pub mod error;
pub mod filemanager;
pub mod locktable;
pub mod logmanager;
pub mod logrecord;
pub mod recoverymanager;
pub mod transaction;

/// Transaction number. Numbers are handed out in increasing order, so a
/// lower number means an older transaction.
pub type TxNum = i32;

pub use buffermanager::{Buffer, BufferManager, BufferPoolStatus, SharedBuffer};
pub use concurrencymanager::{ConcurrencyManager, LockMode};
pub use db::{DbConfig, SimpleDb};
pub use error::{AbortCause, Error, Result};
pub use filemanager::{BlockId, FileManager, Page};
pub use locktable::{LockState, LockTable};
pub use logmanager::{LogManager, Lsn};
pub use transaction::Transaction;
