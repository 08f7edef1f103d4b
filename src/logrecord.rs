use std::fmt::Display;

use crate::error::{Error, Result};
use crate::filemanager::{BlockId, Page};
use crate::logmanager::{LogManager, Lsn};
use crate::transaction::Transaction;
use crate::TxNum;

pub const CHECKPOINT: i32 = 0;
pub const START: i32 = 1;
pub const COMMIT: i32 = 2;
pub const ROLLBACK: i32 = 3;
pub const SETINT: i32 = 4;
pub const SETSTRING: i32 = 5;
pub const NQCKPT: i32 = 6;

const INT_BYTES: usize = std::mem::size_of::<i32>();

/// A record in the write-ahead log.
pub trait LogRecord: Display + Send {
    /// The operation tag stored in the first four bytes.
    fn op(&self) -> i32;

    /// The owning transaction, or `None` for system records such as checkpoints.
    fn tx_number(&self) -> Option<TxNum>;

    /// Reverts the change described by this record. A no-op for records that
    /// carry no undo information.
    fn undo(&self, tx: &mut Transaction) -> Result<()>;

    /// Transactions that were active when a non-quiescent checkpoint was taken.
    fn checkpoint_txs(&self) -> Option<&[TxNum]> {
        None
    }
}

/// Decodes a log record from its bytes.
pub fn create_log_record(bytes: Vec<u8>) -> Result<Box<dyn LogRecord>> {
    let page = Page::builder().log_buffer(bytes).build();
    match page.get_int(0)? {
        CHECKPOINT => Ok(Box::new(CheckpointRecord)),
        START => Ok(Box::new(StartRecord::new(&page)?)),
        COMMIT => Ok(Box::new(CommitRecord::new(&page)?)),
        ROLLBACK => Ok(Box::new(RollbackRecord::new(&page)?)),
        SETINT => Ok(Box::new(SetIntRecord::new(&page)?)),
        SETSTRING => Ok(Box::new(SetStringRecord::new(&page)?)),
        NQCKPT => Ok(Box::new(NqCheckpointRecord::new(&page)?)),
        op => Err(Error::CorruptLogRecord(format!("unknown operation {}", op))),
    }
}

/// Encodes `<op, tx>` for the start, commit and rollback records.
fn write_tx_record(log_manager: &LogManager, op: i32, tx_number: TxNum) -> Result<Lsn> {
    let mut page = Page::builder().block_size(2 * INT_BYTES).build();
    page.set_int(0, op)?;
    page.set_int(INT_BYTES, tx_number)?;
    log_manager.append(page.contents())
}

pub struct CheckpointRecord;

impl CheckpointRecord {
    pub fn write_to_log(log_manager: &LogManager) -> Result<Lsn> {
        let mut page = Page::builder().block_size(INT_BYTES).build();
        page.set_int(0, CHECKPOINT)?;
        log_manager.append(page.contents())
    }
}

impl LogRecord for CheckpointRecord {
    fn op(&self) -> i32 {
        CHECKPOINT
    }

    fn tx_number(&self) -> Option<TxNum> {
        None
    }

    fn undo(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

impl Display for CheckpointRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<CHECKPOINT>")
    }
}

/// Non-quiescent checkpoint: `<NQCKPT, count, tx1, .., txN>`.
pub struct NqCheckpointRecord {
    active_txs: Vec<TxNum>,
}

impl NqCheckpointRecord {
    pub fn new(page: &Page) -> Result<NqCheckpointRecord> {
        let count = page.get_int(INT_BYTES)?;
        if count < 0 {
            return Err(Error::CorruptLogRecord(format!(
                "negative transaction count {}",
                count
            )));
        }
        let active_txs = (0..count as usize)
            .map(|i| page.get_int(INT_BYTES * (2 + i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(NqCheckpointRecord { active_txs })
    }

    pub fn write_to_log(log_manager: &LogManager, active_txs: &[TxNum]) -> Result<Lsn> {
        log_manager.append(&Self::encode(active_txs)?)
    }

    pub fn encode(active_txs: &[TxNum]) -> Result<Vec<u8>> {
        let mut page = Page::builder()
            .block_size(INT_BYTES * (2 + active_txs.len()))
            .build();
        page.set_int(0, NQCKPT)?;
        page.set_int(INT_BYTES, active_txs.len() as i32)?;
        for (i, txnum) in active_txs.iter().enumerate() {
            page.set_int(INT_BYTES * (2 + i), *txnum)?;
        }
        Ok(page.into_bytes())
    }

    pub fn tx_list(&self) -> &[TxNum] {
        &self.active_txs
    }
}

impl LogRecord for NqCheckpointRecord {
    fn op(&self) -> i32 {
        NQCKPT
    }

    fn tx_number(&self) -> Option<TxNum> {
        None
    }

    fn undo(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }

    fn checkpoint_txs(&self) -> Option<&[TxNum]> {
        Some(&self.active_txs)
    }
}

impl Display for NqCheckpointRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<NQCKPT {} {:?}>", self.active_txs.len(), self.active_txs)
    }
}

pub struct StartRecord {
    tx_number: TxNum,
}

impl StartRecord {
    pub fn new(page: &Page) -> Result<StartRecord> {
        Ok(StartRecord {
            tx_number: page.get_int(INT_BYTES)?,
        })
    }

    pub fn write_to_log(log_manager: &LogManager, tx_number: TxNum) -> Result<Lsn> {
        write_tx_record(log_manager, START, tx_number)
    }
}

impl LogRecord for StartRecord {
    fn op(&self) -> i32 {
        START
    }

    fn tx_number(&self) -> Option<TxNum> {
        Some(self.tx_number)
    }

    fn undo(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

impl Display for StartRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<START {}>", self.tx_number)
    }
}

pub struct CommitRecord {
    tx_number: TxNum,
}

impl CommitRecord {
    pub fn new(page: &Page) -> Result<CommitRecord> {
        Ok(CommitRecord {
            tx_number: page.get_int(INT_BYTES)?,
        })
    }

    pub fn write_to_log(log_manager: &LogManager, tx_number: TxNum) -> Result<Lsn> {
        write_tx_record(log_manager, COMMIT, tx_number)
    }
}

impl LogRecord for CommitRecord {
    fn op(&self) -> i32 {
        COMMIT
    }

    fn tx_number(&self) -> Option<TxNum> {
        Some(self.tx_number)
    }

    fn undo(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

impl Display for CommitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<COMMIT {}>", self.tx_number)
    }
}

pub struct RollbackRecord {
    tx_number: TxNum,
}

impl RollbackRecord {
    pub fn new(page: &Page) -> Result<RollbackRecord> {
        Ok(RollbackRecord {
            tx_number: page.get_int(INT_BYTES)?,
        })
    }

    pub fn write_to_log(log_manager: &LogManager, tx_number: TxNum) -> Result<Lsn> {
        write_tx_record(log_manager, ROLLBACK, tx_number)
    }
}

impl LogRecord for RollbackRecord {
    fn op(&self) -> i32 {
        ROLLBACK
    }

    fn tx_number(&self) -> Option<TxNum> {
        Some(self.tx_number)
    }

    fn undo(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

impl Display for RollbackRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<ROLLBACK {}>", self.tx_number)
    }
}

/// Positions of the fields shared by the two update records:
/// `<op, tx, file name, block number, offset, value>`.
struct UpdateLayout {
    file_pos: usize,
    block_pos: usize,
    offset_pos: usize,
    value_pos: usize,
}

impl UpdateLayout {
    fn for_file_name_len(len: usize) -> UpdateLayout {
        let file_pos = 2 * INT_BYTES;
        let block_pos = file_pos + Page::max_len(len);
        let offset_pos = block_pos + INT_BYTES;
        let value_pos = offset_pos + INT_BYTES;
        UpdateLayout {
            file_pos,
            block_pos,
            offset_pos,
            value_pos,
        }
    }

    fn read_header(page: &Page) -> Result<(TxNum, BlockId, usize, UpdateLayout)> {
        let tx_number = page.get_int(INT_BYTES)?;
        let file_name = page.get_string(2 * INT_BYTES)?;
        let layout = UpdateLayout::for_file_name_len(file_name.len());
        let block_num = page.get_int(layout.block_pos)?;
        let offset = page.get_int(layout.offset_pos)?;
        let block_id = BlockId::new(&file_name, block_num as u32);
        Ok((tx_number, block_id, offset as usize, layout))
    }

    fn write_header(
        &self,
        page: &mut Page,
        op: i32,
        tx_number: TxNum,
        block_id: &BlockId,
        offset: usize,
    ) -> Result<()> {
        page.set_int(0, op)?;
        page.set_int(INT_BYTES, tx_number)?;
        page.set_string(self.file_pos, block_id.file_name())?;
        page.set_int(self.block_pos, block_id.block_num() as i32)?;
        page.set_int(self.offset_pos, offset as i32)
    }
}

/// Logs the value an int field held before it was overwritten.
pub struct SetIntRecord {
    tx_number: TxNum,
    offset: usize,
    block_id: BlockId,
    value: i32,
}

impl SetIntRecord {
    pub fn new(page: &Page) -> Result<SetIntRecord> {
        let (tx_number, block_id, offset, layout) = UpdateLayout::read_header(page)?;
        let value = page.get_int(layout.value_pos)?;
        Ok(SetIntRecord {
            tx_number,
            offset,
            block_id,
            value,
        })
    }

    pub fn write_to_log(
        log_manager: &LogManager,
        tx_number: TxNum,
        block_id: &BlockId,
        offset: usize,
        value: i32,
    ) -> Result<Lsn> {
        let layout = UpdateLayout::for_file_name_len(block_id.file_name().len());
        let mut page = Page::builder().block_size(layout.value_pos + INT_BYTES).build();
        layout.write_header(&mut page, SETINT, tx_number, block_id, offset)?;
        page.set_int(layout.value_pos, value)?;
        log_manager.append(page.contents())
    }
}

impl LogRecord for SetIntRecord {
    fn op(&self) -> i32 {
        SETINT
    }

    fn tx_number(&self) -> Option<TxNum> {
        Some(self.tx_number)
    }

    fn undo(&self, tx: &mut Transaction) -> Result<()> {
        tx.pin(&self.block_id)?;
        let restored = tx.set_int(&self.block_id, self.offset, self.value, false);
        tx.unpin(&self.block_id);
        restored
    }
}

impl Display for SetIntRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<SETINT {} {} {} {}>",
            self.tx_number, self.block_id, self.offset, self.value
        )
    }
}

/// Logs the value a string field held before it was overwritten.
pub struct SetStringRecord {
    tx_number: TxNum,
    offset: usize,
    block_id: BlockId,
    value: String,
}

impl SetStringRecord {
    pub fn new(page: &Page) -> Result<SetStringRecord> {
        let (tx_number, block_id, offset, layout) = UpdateLayout::read_header(page)?;
        let value = page.get_string(layout.value_pos)?;
        Ok(SetStringRecord {
            tx_number,
            offset,
            block_id,
            value,
        })
    }

    pub fn write_to_log(
        log_manager: &LogManager,
        tx_number: TxNum,
        block_id: &BlockId,
        offset: usize,
        value: &str,
    ) -> Result<Lsn> {
        let layout = UpdateLayout::for_file_name_len(block_id.file_name().len());
        let mut page = Page::builder()
            .block_size(layout.value_pos + Page::max_len(value.len()))
            .build();
        layout.write_header(&mut page, SETSTRING, tx_number, block_id, offset)?;
        page.set_string(layout.value_pos, value)?;
        log_manager.append(page.contents())
    }
}

impl LogRecord for SetStringRecord {
    fn op(&self) -> i32 {
        SETSTRING
    }

    fn tx_number(&self) -> Option<TxNum> {
        Some(self.tx_number)
    }

    fn undo(&self, tx: &mut Transaction) -> Result<()> {
        tx.pin(&self.block_id)?;
        let restored = tx.set_string(&self.block_id, self.offset, &self.value, false);
        tx.unpin(&self.block_id);
        restored
    }
}

impl Display for SetStringRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<SETSTRING {} {} {} {}>",
            self.tx_number, self.block_id, self.offset, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbConfig, SimpleDb};
    use tempdir::TempDir;

    #[test]
    fn test_nq_checkpoint_round_trip() {
        let bytes = NqCheckpointRecord::encode(&[22, 24]).unwrap();
        assert_eq!(bytes.len(), 16);

        let rec = create_log_record(bytes).unwrap();
        assert_eq!(rec.op(), NQCKPT);
        assert_eq!(rec.tx_number(), None);
        assert_eq!(rec.checkpoint_txs(), Some(&[22, 24][..]));
        assert_eq!(rec.to_string(), "<NQCKPT 2 [22, 24]>");
    }

    #[test]
    fn test_nq_checkpoint_reads_exactly_count_ids() {
        let mut bytes = NqCheckpointRecord::encode(&[7]).unwrap();
        bytes.extend_from_slice(&99i32.to_be_bytes());
        let page = Page::builder().log_buffer(bytes).build();
        let rec = NqCheckpointRecord::new(&page).unwrap();
        assert_eq!(rec.tx_list(), &[7]);
    }

    #[test]
    fn test_checkpoint_undo_changes_nothing() {
        let tmp_dir = TempDir::new("test_ckpt_undo").unwrap();
        let db = SimpleDb::open(tmp_dir.path().join("db"), DbConfig::default()).unwrap();
        let mut tx = db.new_tx().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.pin(&blk).unwrap();
        tx.set_int(&blk, 0, 17, true).unwrap();

        let before_lsn = db.log_manager().latest_lsn();
        let available = tx.available_buffers();
        for rec in [
            create_log_record(NqCheckpointRecord::encode(&[22, 24]).unwrap()).unwrap(),
            Box::new(CheckpointRecord) as Box<dyn LogRecord>,
        ] {
            rec.undo(&mut tx).unwrap();
        }
        assert_eq!(tx.get_int(&blk, 0).unwrap(), 17);
        assert_eq!(db.log_manager().latest_lsn(), before_lsn);
        assert_eq!(tx.available_buffers(), available);
        tx.commit().unwrap();
    }

    #[test]
    fn test_update_records_decode() {
        let tmp_dir = TempDir::new("test_update_records").unwrap();
        let db = SimpleDb::open(tmp_dir.path().join("db"), DbConfig::default()).unwrap();
        let lm = db.log_manager();
        let blk = BlockId::new("students.tbl", 3);
        SetIntRecord::write_to_log(&lm, 9, &blk, 40, -5).unwrap();
        SetStringRecord::write_to_log(&lm, 9, &blk, 80, "joe").unwrap();
        CommitRecord::write_to_log(&lm, 9).unwrap();

        let recs: Vec<String> = lm
            .iterator()
            .unwrap()
            .take(3)
            .map(|bytes| create_log_record(bytes.unwrap()).unwrap().to_string())
            .collect();
        assert_eq!(
            recs,
            vec![
                "<COMMIT 9>".to_string(),
                "<SETSTRING 9 [file students.tbl, block number 3] 80 joe>".to_string(),
                "<SETINT 9 [file students.tbl, block number 3] 40 -5>".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_operation_is_corrupt() {
        let bytes = 42i32.to_be_bytes().to_vec();
        assert!(matches!(create_log_record(bytes), Err(Error::CorruptLogRecord(_))));
    }
}
