use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::filemanager::BlockId;
use crate::locktable::LockTable;
use crate::TxNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Per-transaction view of the lock table.
///
/// Remembers the strongest lock this transaction holds on each block so that
/// repeated requests never reach the shared table, and releases everything at
/// the end of the transaction.
pub struct ConcurrencyManager {
    txnum: TxNum,
    lock_table: Arc<LockTable>,
    locks: HashMap<BlockId, LockMode>,
}

impl ConcurrencyManager {
    pub fn new(txnum: TxNum, lock_table: Arc<LockTable>) -> ConcurrencyManager {
        ConcurrencyManager {
            txnum,
            lock_table,
            locks: HashMap::new(),
        }
    }

    /// Takes a shared lock unless this transaction already holds any lock on
    /// the block.
    pub fn shared_lock(&mut self, block_id: &BlockId) -> Result<()> {
        if !self.locks.contains_key(block_id) {
            self.lock_table.shared_lock(block_id, self.txnum)?;
            self.locks.insert(block_id.clone(), LockMode::Shared);
        }
        Ok(())
    }

    /// Takes the exclusive lock, first acquiring a shared one so the request
    /// is always an upgrade.
    pub fn exclusive_lock(&mut self, block_id: &BlockId) -> Result<()> {
        if self.lock_mode(block_id) != Some(LockMode::Exclusive) {
            self.shared_lock(block_id)?;
            self.lock_table.exclusive_lock(block_id, self.txnum)?;
            self.locks.insert(block_id.clone(), LockMode::Exclusive);
        }
        Ok(())
    }

    /// Releases every lock this transaction holds.
    pub fn release_all(&mut self) {
        for block_id in self.locks.keys() {
            self.lock_table.unlock(block_id, self.txnum);
        }
        self.locks.clear();
    }

    pub fn lock_mode(&self, block_id: &BlockId) -> Option<LockMode> {
        self.locks.get(block_id).copied()
    }
}
