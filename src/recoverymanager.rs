use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::buffermanager::{Buffer, BufferManager};
use crate::error::Result;
use crate::filemanager::BlockId;
use crate::logmanager::{LogManager, Lsn};
use crate::logrecord::{
    create_log_record, CheckpointRecord, CommitRecord, RollbackRecord, SetIntRecord,
    SetStringRecord, StartRecord, CHECKPOINT, COMMIT, NQCKPT, ROLLBACK, START,
};
use crate::transaction::Transaction;
use crate::TxNum;

/// Undo-only recovery for one transaction.
///
/// Update records carry the old value of the field, so a transaction is rolled
/// back by walking the log backwards and writing those values back.
#[derive(Clone)]
pub struct RecoveryManager {
    txnum: TxNum,
    log_manager: Arc<LogManager>,
    buffer_manager: Arc<BufferManager>,
}

impl RecoveryManager {
    /// Writes the start record for `txnum`.
    pub fn new(
        txnum: TxNum,
        log_manager: Arc<LogManager>,
        buffer_manager: Arc<BufferManager>,
    ) -> Result<Self> {
        StartRecord::write_to_log(&log_manager, txnum)?;
        Ok(RecoveryManager {
            txnum,
            log_manager,
            buffer_manager,
        })
    }

    /// Forces the transaction's pages, then its commit record, to disk.
    pub fn commit(&self) -> Result<()> {
        self.buffer_manager.flush_all(self.txnum)?;
        let lsn = CommitRecord::write_to_log(&self.log_manager, self.txnum)?;
        self.log_manager.flush(lsn)
    }

    /// Undoes every logged change of the transaction, then logs the rollback.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        self.do_rollback(tx)?;
        self.buffer_manager.flush_all(self.txnum)?;
        let lsn = RollbackRecord::write_to_log(&self.log_manager, self.txnum)?;
        self.log_manager.flush(lsn)
    }

    /// Undoes the changes of every unfinished transaction in the log and
    /// writes a quiescent checkpoint.
    pub fn recover(&self, tx: &mut Transaction) -> Result<()> {
        self.do_recover(tx)?;
        self.buffer_manager.flush_all(self.txnum)?;
        let lsn = CheckpointRecord::write_to_log(&self.log_manager)?;
        self.log_manager.flush(lsn)
    }

    /// Logs the int about to be overwritten at `offset` and returns the LSN.
    pub fn set_int(&self, block_id: &BlockId, buffer: &Buffer, offset: usize) -> Result<Lsn> {
        let old_val = buffer.contents().get_int(offset)?;
        SetIntRecord::write_to_log(
            &self.log_manager,
            self.txnum,
            block_id,
            offset,
            old_val,
        )
    }

    /// Logs the string about to be overwritten at `offset` and returns the LSN.
    pub fn set_string(&self, block_id: &BlockId, buffer: &Buffer, offset: usize) -> Result<Lsn> {
        let old_val = buffer.contents().get_string(offset)?;
        SetStringRecord::write_to_log(
            &self.log_manager,
            self.txnum,
            block_id,
            offset,
            &old_val,
        )
    }

    fn do_rollback(&self, tx: &mut Transaction) -> Result<()> {
        for bytes in self.log_manager.iterator()? {
            let rec = create_log_record(bytes?)?;
            if rec.tx_number() != Some(self.txnum) {
                continue;
            }
            if rec.op() == START {
                return Ok(());
            }
            debug!("tx {} undoing {}", self.txnum, rec);
            rec.undo(tx)?;
        }
        Ok(())
    }

    fn do_recover(&self, tx: &mut Transaction) -> Result<()> {
        let mut finished = HashSet::new();
        // unfinished transactions named by an NQCKPT whose START is still ahead
        let mut awaiting_start: Option<HashSet<TxNum>> = None;
        for bytes in self.log_manager.iterator()? {
            let rec = create_log_record(bytes?)?;
            match rec.op() {
                CHECKPOINT => break,
                NQCKPT => {
                    let unfinished: HashSet<TxNum> = rec
                        .checkpoint_txs()
                        .unwrap_or_default()
                        .iter()
                        .filter(|txnum| !finished.contains(*txnum))
                        .copied()
                        .collect();
                    if unfinished.is_empty() {
                        break;
                    }
                    awaiting_start = Some(unfinished);
                }
                COMMIT | ROLLBACK => {
                    finished.extend(rec.tx_number());
                }
                START => {
                    if let (Some(waiting), Some(txnum)) =
                        (awaiting_start.as_mut(), rec.tx_number())
                    {
                        waiting.remove(&txnum);
                        if waiting.is_empty() {
                            break;
                        }
                    }
                }
                _ => {
                    if rec.tx_number().map_or(false, |txnum| !finished.contains(&txnum)) {
                        debug!("recovery undoing {}", rec);
                        rec.undo(tx)?;
                    }
                }
            }
        }
        info!("recovery finished, {} transactions were complete", finished.len());
        Ok(())
    }
}
