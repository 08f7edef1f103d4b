use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::buffermanager::BufferManager;
use crate::error::Result;
use crate::filemanager::FileManager;
use crate::locktable::LockTable;
use crate::logmanager::{LogManager, Lsn};
use crate::logrecord::NqCheckpointRecord;
use crate::transaction::Transaction;
use crate::TxNum;

/// Engine settings. `max_wait` bounds both buffer and lock waits.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub block_size: usize,
    pub buffer_count: usize,
    pub log_file: String,
    pub max_wait: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            block_size: 400,
            buffer_count: 8,
            log_file: "simpledb.log".to_string(),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl DbConfig {
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn log_file(mut self, log_file: &str) -> Self {
        self.log_file = log_file.to_string();
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Hands out transaction numbers and tracks which transactions are running.
#[derive(Default)]
pub(crate) struct TxRegistry {
    last_txnum: AtomicI32,
    active: Mutex<BTreeSet<TxNum>>,
}

impl TxRegistry {
    pub(crate) fn begin(&self) -> TxNum {
        let txnum = self.last_txnum.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.lock().insert(txnum);
        txnum
    }

    pub(crate) fn finish(&self, txnum: TxNum) {
        self.active.lock().remove(&txnum);
    }

    fn active(&self) -> Vec<TxNum> {
        self.active.lock().iter().copied().collect()
    }
}

/// The storage engine: one file manager, log, buffer pool and lock table,
/// shared by every transaction it creates.
pub struct SimpleDb {
    file_manager: Arc<FileManager>,
    log_manager: Arc<LogManager>,
    buffer_manager: Arc<BufferManager>,
    lock_table: Arc<LockTable>,
    registry: Arc<TxRegistry>,
}

impl SimpleDb {
    /// Opens the database in `db_directory`, creating it if needed. An existing
    /// database is recovered before this returns.
    pub fn open(db_directory: impl AsRef<Path>, config: DbConfig) -> Result<SimpleDb> {
        let file_manager = Arc::new(FileManager::new(db_directory.as_ref(), config.block_size)?);
        let log_manager = Arc::new(
            LogManager::builder(&config.log_file, Arc::clone(&file_manager)).build()?,
        );
        let buffer_manager = Arc::new(
            BufferManager::builder(Arc::clone(&file_manager), Arc::clone(&log_manager))
                .num_buffers(config.buffer_count)
                .max_wait(config.max_wait)
                .build(),
        );
        let lock_table = Arc::new(LockTable::with_max_wait(config.max_wait));
        let db = SimpleDb {
            file_manager,
            log_manager,
            buffer_manager,
            lock_table,
            registry: Arc::new(TxRegistry::default()),
        };

        if db.file_manager.is_new() {
            info!("creating new database in {:?}", db_directory.as_ref());
        } else {
            info!("recovering existing database in {:?}", db_directory.as_ref());
            let mut tx = db.new_tx()?;
            tx.recover()?;
            tx.commit()?;
        }
        Ok(db)
    }

    pub fn new_tx(&self) -> Result<Transaction> {
        Transaction::new(
            Arc::clone(&self.file_manager),
            Arc::clone(&self.log_manager),
            Arc::clone(&self.buffer_manager),
            Arc::clone(&self.lock_table),
            Arc::clone(&self.registry),
        )
    }

    /// Logs a non-quiescent checkpoint naming the running transactions.
    pub fn nq_checkpoint(&self) -> Result<Lsn> {
        let active = self.registry.active();
        let lsn = NqCheckpointRecord::write_to_log(&self.log_manager, &active)?;
        self.log_manager.flush(lsn)?;
        info!("non-quiescent checkpoint with active transactions {:?}", active);
        Ok(lsn)
    }

    pub fn file_manager(&self) -> Arc<FileManager> {
        Arc::clone(&self.file_manager)
    }

    pub fn log_manager(&self) -> Arc<LogManager> {
        Arc::clone(&self.log_manager)
    }

    pub fn buffer_manager(&self) -> Arc<BufferManager> {
        Arc::clone(&self.buffer_manager)
    }

    pub fn lock_table(&self) -> Arc<LockTable> {
        Arc::clone(&self.lock_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_transaction_numbers_increase() {
        let tmp_dir = TempDir::new("test_db_txnums").unwrap();
        let db = SimpleDb::open(tmp_dir.path().join("db"), DbConfig::default()).unwrap();
        let mut tx1 = db.new_tx().unwrap();
        let mut tx2 = db.new_tx().unwrap();
        assert!(tx1.txnum() < tx2.txnum());
        assert_eq!(db.registry.active(), vec![tx1.txnum(), tx2.txnum()]);

        tx1.commit().unwrap();
        assert_eq!(db.registry.active(), vec![tx2.txnum()]);
        tx2.rollback().unwrap();
        assert!(db.registry.active().is_empty());
    }

    #[test]
    fn test_config_setters() {
        let config = DbConfig::default()
            .block_size(64)
            .buffer_count(3)
            .log_file("x.log")
            .max_wait(Duration::from_millis(5));
        assert_eq!(config.block_size, 64);
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.log_file, "x.log");
        assert_eq!(config.max_wait, Duration::from_millis(5));
    }
}
