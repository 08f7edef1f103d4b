use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::buffermanager::{BufferManager, SharedBuffer};
use crate::concurrencymanager::ConcurrencyManager;
use crate::db::TxRegistry;
use crate::error::{Error, Result};
use crate::filemanager::{BlockId, FileManager};
use crate::locktable::LockTable;
use crate::logmanager::LogManager;
use crate::recoverymanager::RecoveryManager;
use crate::TxNum;

/// The buffers a transaction has pinned, with one entry in `pins` per pin.
struct BufferList {
    buffers: HashMap<BlockId, SharedBuffer>,
    pins: Vec<BlockId>,
    buffer_manager: Arc<BufferManager>,
}

impl BufferList {
    fn new(buffer_manager: Arc<BufferManager>) -> BufferList {
        BufferList {
            buffers: HashMap::new(),
            pins: Vec::new(),
            buffer_manager,
        }
    }

    fn get_buffer(&self, block_id: &BlockId) -> Result<&SharedBuffer> {
        self.buffers.get(block_id).ok_or_else(|| Error::BufferNotPinned(block_id.clone()))
    }

    fn pin(&mut self, block_id: &BlockId) -> Result<()> {
        let buffer = self.buffer_manager.pin(block_id)?;
        self.buffers.insert(block_id.clone(), buffer);
        self.pins.push(block_id.clone());
        Ok(())
    }

    fn unpin(&mut self, block_id: &BlockId) {
        let Some(buffer) = self.buffers.get(block_id) else {
            return;
        };
        self.buffer_manager.unpin(buffer);
        if let Some(idx) = self.pins.iter().position(|b| b == block_id) {
            self.pins.remove(idx);
        }
        if !self.pins.contains(block_id) {
            self.buffers.remove(block_id);
        }
    }

    fn unpin_all(&mut self) {
        for block_id in &self.pins {
            if let Some(buffer) = self.buffers.get(block_id) {
                self.buffer_manager.unpin(buffer);
            }
        }
        self.buffers.clear();
        self.pins.clear();
    }
}

/// A transaction: strict two-phase locking over the shared lock table plus
/// undo logging through its recovery manager.
///
/// Every lock or pin call may fail with an abort error, after which the caller
/// is expected to call [`Transaction::rollback`].
///
/// Dropping a transaction that never finished releases its pins but keeps its
/// locks, since its changes may still be in the buffers. A failed rollback
/// should be retried.
pub struct Transaction {
    txnum: TxNum,
    recovery_manager: RecoveryManager,
    concurrency_manager: ConcurrencyManager,
    buffer_list: BufferList,
    file_manager: Arc<FileManager>,
    buffer_manager: Arc<BufferManager>,
    registry: Arc<TxRegistry>,
    done: bool,
}

impl Transaction {
    pub(crate) fn new(
        file_manager: Arc<FileManager>,
        log_manager: Arc<LogManager>,
        buffer_manager: Arc<BufferManager>,
        lock_table: Arc<LockTable>,
        registry: Arc<TxRegistry>,
    ) -> Result<Self> {
        let txnum = registry.begin();
        let recovery_manager =
            match RecoveryManager::new(txnum, log_manager, Arc::clone(&buffer_manager)) {
                Ok(rm) => rm,
                Err(e) => {
                    registry.finish(txnum);
                    return Err(e);
                }
            };
        Ok(Transaction {
            txnum,
            recovery_manager,
            concurrency_manager: ConcurrencyManager::new(txnum, lock_table),
            buffer_list: BufferList::new(Arc::clone(&buffer_manager)),
            file_manager,
            buffer_manager,
            registry,
            done: false,
        })
    }

    pub fn txnum(&self) -> TxNum {
        self.txnum
    }

    /// Makes the transaction's changes durable, then releases its locks and
    /// pins.
    pub fn commit(&mut self) -> Result<()> {
        self.recovery_manager.commit()?;
        info!("transaction {} committed", self.txnum);
        self.finish();
        Ok(())
    }

    /// Undoes the transaction's changes, then releases its locks and pins.
    pub fn rollback(&mut self) -> Result<()> {
        let recovery_manager = self.recovery_manager.clone();
        recovery_manager.rollback(self)?;
        info!("transaction {} rolled back", self.txnum);
        self.finish();
        Ok(())
    }

    /// Rolls back every transaction left unfinished in the log. Run once at
    /// startup, before any other transaction begins.
    pub fn recover(&mut self) -> Result<()> {
        self.buffer_manager.flush_all(self.txnum)?;
        let recovery_manager = self.recovery_manager.clone();
        recovery_manager.recover(self)?;
        info!("recovery by transaction {} complete", self.txnum);
        Ok(())
    }

    pub fn pin(&mut self, block_id: &BlockId) -> Result<()> {
        self.buffer_list.pin(block_id)
    }

    pub fn unpin(&mut self, block_id: &BlockId) {
        self.buffer_list.unpin(block_id)
    }

    pub fn get_int(&mut self, block_id: &BlockId, offset: usize) -> Result<i32> {
        self.concurrency_manager.shared_lock(block_id)?;
        let buffer = self.buffer_list.get_buffer(block_id)?;
        let value = buffer.lock().contents().get_int(offset)?;
        Ok(value)
    }

    pub fn get_string(&mut self, block_id: &BlockId, offset: usize) -> Result<String> {
        self.concurrency_manager.shared_lock(block_id)?;
        let buffer = self.buffer_list.get_buffer(block_id)?;
        let value = buffer.lock().contents().get_string(offset)?;
        Ok(value)
    }

    /// Writes `val` at `offset`, logging the old value first when `ok_to_log`.
    pub fn set_int(
        &mut self,
        block_id: &BlockId,
        offset: usize,
        val: i32,
        ok_to_log: bool,
    ) -> Result<()> {
        self.concurrency_manager.exclusive_lock(block_id)?;
        let buffer = self.buffer_list.get_buffer(block_id)?;
        let mut buf = buffer.lock();
        let lsn = if ok_to_log {
            Some(self.recovery_manager.set_int(block_id, &buf, offset)?)
        } else {
            None
        };
        buf.contents_mut().set_int(offset, val)?;
        buf.set_modified(self.txnum, lsn);
        Ok(())
    }

    /// Writes `val` at `offset`, logging the old value first when `ok_to_log`.
    pub fn set_string(
        &mut self,
        block_id: &BlockId,
        offset: usize,
        val: &str,
        ok_to_log: bool,
    ) -> Result<()> {
        self.concurrency_manager.exclusive_lock(block_id)?;
        let buffer = self.buffer_list.get_buffer(block_id)?;
        let mut buf = buffer.lock();
        let lsn = if ok_to_log {
            Some(self.recovery_manager.set_string(block_id, &buf, offset)?)
        } else {
            None
        };
        buf.contents_mut().set_string(offset, val)?;
        buf.set_modified(self.txnum, lsn);
        Ok(())
    }

    /// Number of blocks in `file_name`. Locks the end of the file so that no
    /// other transaction can append until this one finishes.
    pub fn size(&mut self, file_name: &str) -> Result<u32> {
        self.concurrency_manager.shared_lock(&BlockId::end_of_file(file_name))?;
        Ok(self.file_manager.length(file_name)?)
    }

    pub fn append(&mut self, file_name: &str) -> Result<BlockId> {
        self.concurrency_manager.exclusive_lock(&BlockId::end_of_file(file_name))?;
        Ok(self.file_manager.append(file_name)?)
    }

    pub fn block_size(&self) -> usize {
        self.file_manager.block_size()
    }

    pub fn available_buffers(&self) -> usize {
        self.buffer_manager.available()
    }

    fn finish(&mut self) {
        self.concurrency_manager.release_all();
        self.buffer_list.unpin_all();
        self.registry.finish(self.txnum);
        self.done = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                "transaction {} dropped before commit or rollback, keeping its locks",
                self.txnum
            );
            self.buffer_list.unpin_all();
        }
    }
}
