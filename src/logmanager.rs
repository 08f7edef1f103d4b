use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::filemanager::{BlockId, FileManager, Page};

/// Log sequence number. The first appended record gets 1.
pub type Lsn = i32;

const INT_BYTES: usize = std::mem::size_of::<i32>();

/// The write-ahead log.
///
/// Each log block starts with a boundary int; records are packed from the end
/// of the block towards the boundary, each as a length-prefixed byte array, so
/// that reading a block forwards yields the newest record first.
pub struct LogManager {
    log_file: String,
    file_manager: Arc<FileManager>,
    state: Mutex<LogState>,
}

struct LogState {
    log_page: Page,
    block_id: BlockId,
    latest_lsn: Lsn,
    last_saved_lsn: Lsn,
}

impl LogManager {
    pub fn builder(log_file: &str, file_manager: Arc<FileManager>) -> LogManagerBuilder {
        LogManagerBuilder::new(log_file, file_manager)
    }

    /// Appends `rec` to the log and returns its sequence number. The record is
    /// not durable until [`LogManager::flush`] is called with that number.
    pub fn append(&self, rec: &[u8]) -> Result<Lsn> {
        let mut state = self.state.lock();
        let mut boundary = state.log_page.get_int(0)? as usize;
        let bytes_needed = rec.len() + INT_BYTES;
        if boundary < bytes_needed + INT_BYTES {
            // the record doesn't fit, so move to the next block
            self.flush_to_file(&mut state)?;
            state.block_id =
                append_new_block(&self.file_manager, &self.log_file, &mut state.log_page)?;
            boundary = state.log_page.get_int(0)? as usize;
            if boundary < bytes_needed + INT_BYTES {
                return Err(Error::PageOverflow {
                    offset: INT_BYTES,
                    len: bytes_needed,
                    capacity: boundary,
                });
            }
        }
        let rec_pos = boundary - bytes_needed;
        state.log_page.set_bytes(rec_pos, rec)?;
        state.log_page.set_int(0, rec_pos as i32)?;
        state.latest_lsn += 1;
        trace!("appended log record lsn={} len={}", state.latest_lsn, rec.len());
        Ok(state.latest_lsn)
    }

    /// Makes every record up to and including `lsn` durable.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn >= state.last_saved_lsn {
            self.flush_to_file(&mut state)?;
        }
        Ok(())
    }

    /// Flushes the log and iterates its records, newest first.
    pub fn iterator(&self) -> Result<LogIterator> {
        let mut state = self.state.lock();
        self.flush_to_file(&mut state)?;
        LogIterator::new(Arc::clone(&self.file_manager), state.block_id.clone())
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.state.lock().latest_lsn
    }

    fn flush_to_file(&self, state: &mut LogState) -> Result<()> {
        self.file_manager.write(&state.block_id, &state.log_page)?;
        state.last_saved_lsn = state.latest_lsn;
        debug!("flushed log {} through lsn {}", self.log_file, state.last_saved_lsn);
        Ok(())
    }
}

pub struct LogManagerBuilder {
    log_file: String,
    file_manager: Arc<FileManager>,
}

impl LogManagerBuilder {
    pub fn new(log_file: &str, file_manager: Arc<FileManager>) -> Self {
        Self {
            log_file: log_file.to_string(),
            file_manager,
        }
    }

    /// Opens the log, positioning on its last block or creating the first one.
    pub fn build(self) -> Result<LogManager> {
        let mut log_page = Page::builder()
            .block_size(self.file_manager.block_size())
            .build();
        let log_size = self.file_manager.length(&self.log_file)?;
        let block_id = if log_size == 0 {
            append_new_block(&self.file_manager, &self.log_file, &mut log_page)?
        } else {
            let block_id = BlockId::new(&self.log_file, log_size - 1);
            self.file_manager.read(&block_id, &mut log_page)?;
            block_id
        };

        Ok(LogManager {
            log_file: self.log_file,
            file_manager: self.file_manager,
            state: Mutex::new(LogState {
                log_page,
                block_id,
                latest_lsn: 0,
                last_saved_lsn: 0,
            }),
        })
    }
}

fn append_new_block(
    file_manager: &FileManager,
    log_file: &str,
    log_page: &mut Page,
) -> Result<BlockId> {
    let block_id = file_manager.append(log_file)?;
    log_page.contents_mut().fill(0);
    log_page.set_int(0, file_manager.block_size() as i32)?;
    file_manager.write(&block_id, log_page)?;
    Ok(block_id)
}

/// Walks the log backwards, from the newest record to the oldest.
pub struct LogIterator {
    file_manager: Arc<FileManager>,
    block_id: BlockId,
    page: Page,
    current_pos: usize,
}

impl LogIterator {
    fn new(file_manager: Arc<FileManager>, block_id: BlockId) -> Result<LogIterator> {
        let page = Page::builder().block_size(file_manager.block_size()).build();
        let mut iter = LogIterator {
            file_manager,
            block_id: block_id.clone(),
            page,
            current_pos: 0,
        };
        iter.move_to_block(block_id)?;
        Ok(iter)
    }

    fn move_to_block(&mut self, block_id: BlockId) -> Result<()> {
        self.file_manager.read(&block_id, &mut self.page)?;
        self.current_pos = self.page.get_int(0)? as usize;
        self.block_id = block_id;
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.current_pos >= self.file_manager.block_size() {
            if self.block_id.block_num() == 0 {
                return Ok(None);
            }
            let prev = BlockId::new(self.block_id.file_name(), self.block_id.block_num() - 1);
            self.move_to_block(prev)?;
        }
        let rec = self.page.get_bytes(self.current_pos)?.to_vec();
        self.current_pos += INT_BYTES + rec.len();
        Ok(Some(rec))
    }
}

impl Iterator for LogIterator {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    const TEST_BLOCK_SIZE: usize = 64;

    fn log_manager(dir: &TempDir) -> LogManager {
        let file_manager = Arc::new(FileManager::new(dir.path(), TEST_BLOCK_SIZE).unwrap());
        LogManager::builder("log.wal", file_manager).build().unwrap()
    }

    #[test]
    fn test_log_manager_starts_on_block_zero() {
        let tmp_dir = TempDir::new("test_log_manager").unwrap();
        let log_manager = log_manager(&tmp_dir);
        assert_eq!(log_manager.state.lock().block_id.block_num(), 0);
        assert_eq!(log_manager.latest_lsn(), 0);
    }

    #[test]
    fn test_append_and_iterate_across_blocks() {
        let tmp_dir = TempDir::new("test_log_iter").unwrap();
        let log_manager = log_manager(&tmp_dir);

        for i in 1..=20 {
            let rec = format!("record{:02}", i);
            assert_eq!(log_manager.append(rec.as_bytes()).unwrap(), i);
        }
        assert!(log_manager.state.lock().block_id.block_num() > 0);

        let records: Vec<String> = log_manager
            .iterator()
            .unwrap()
            .map(|r| String::from_utf8(r.unwrap()).unwrap())
            .collect();
        let expected: Vec<String> = (1..=20)
            .rev()
            .map(|i| format!("record{:02}", i))
            .collect();
        assert_eq!(records, expected);
    }

    #[test]
    fn test_record_larger_than_block_is_rejected() {
        let tmp_dir = TempDir::new("test_log_oversized").unwrap();
        let log_manager = log_manager(&tmp_dir);
        let err = log_manager.append(&[1u8; TEST_BLOCK_SIZE]).unwrap_err();
        assert!(matches!(err, Error::PageOverflow { .. }));
        assert_eq!(log_manager.latest_lsn(), 0);
    }

    #[test]
    fn test_reopen_continues_last_block() {
        let tmp_dir = TempDir::new("test_log_reopen").unwrap();
        {
            let log_manager = log_manager(&tmp_dir);
            let lsn = log_manager.append(b"first").unwrap();
            log_manager.flush(lsn).unwrap();
        }
        let log_manager = log_manager(&tmp_dir);
        log_manager.append(b"second").unwrap();
        let records: Vec<Vec<u8>> = log_manager
            .iterator()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records, vec![b"second".to_vec(), b"first".to_vec()]);
    }
}
