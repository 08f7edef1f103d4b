use std::collections::HashMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};

const INT_BYTES: usize = std::mem::size_of::<i32>();

/// Names one block of a file. Used as the key for buffer and lock lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    file_name: String,
    block_num: u32,
}

impl BlockId {
    pub fn new(file_name: &str, block_num: u32) -> BlockId {
        BlockId {
            file_name: file_name.to_string(),
            block_num,
        }
    }

    /// A marker block standing for "the end of `file_name`". Locking it
    /// serialises size queries against appends.
    pub fn end_of_file(file_name: &str) -> BlockId {
        BlockId::new(file_name, u32::MAX)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn block_num(&self) -> u32 {
        self.block_num
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[file {}, block number {}]", self.file_name, self.block_num)
    }
}

/// A fixed-capacity byte page.
///
/// Integers are 4-byte big-endian. Byte arrays and strings are stored as a
/// 4-byte length followed by the bytes. A write that does not fit fails with
/// [`Error::PageOverflow`] and leaves the page untouched.
#[derive(Debug, Clone)]
pub struct Page {
    byte_buffer: Vec<u8>,
}

impl Page {
    pub fn builder() -> PageBuilder {
        PageBuilder::new()
    }

    pub fn block_size(&self) -> usize {
        self.byte_buffer.len()
    }

    /// Bytes needed to store a string of `strlen` ASCII characters.
    pub fn max_len(strlen: usize) -> usize {
        INT_BYTES + strlen
    }

    pub fn get_int(&self, offset: usize) -> Result<i32> {
        let bytes = self.slice(offset, INT_BYTES)?;
        let mut raw = [0u8; INT_BYTES];
        raw.copy_from_slice(bytes);
        Ok(i32::from_be_bytes(raw))
    }

    pub fn set_int(&mut self, offset: usize, val: i32) -> Result<()> {
        self.check_fits(offset, INT_BYTES)?;
        self.byte_buffer[offset..offset + INT_BYTES].copy_from_slice(&val.to_be_bytes());
        Ok(())
    }

    pub fn get_bytes(&self, offset: usize) -> Result<&[u8]> {
        let len = self.get_int(offset)?;
        if len < 0 {
            return Err(Error::CorruptPage { offset, len });
        }
        self.slice(offset + INT_BYTES, len as usize)
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_fits(offset, INT_BYTES + bytes.len())?;
        let start = offset + INT_BYTES;
        self.byte_buffer[offset..start].copy_from_slice(&(bytes.len() as i32).to_be_bytes());
        self.byte_buffer[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_string(&self, offset: usize) -> Result<String> {
        let bytes = self.get_bytes(offset)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn set_string(&mut self, offset: usize, val: &str) -> Result<()> {
        self.set_bytes(offset, val.as_bytes())
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.byte_buffer
    }

    pub(crate) fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.byte_buffer
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.byte_buffer
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_fits(offset, len)?;
        Ok(&self.byte_buffer[offset..offset + len])
    }

    fn check_fits(&self, offset: usize, len: usize) -> Result<()> {
        let capacity = self.byte_buffer.len();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            warn!("{} bytes do not fit at offset {} of the page", len, offset);
            return Err(Error::PageOverflow {
                offset,
                len,
                capacity,
            });
        }
        Ok(())
    }
}

pub struct PageBuilder {
    byte_buffer: Vec<u8>,
}

impl PageBuilder {
    pub fn new() -> PageBuilder {
        PageBuilder {
            byte_buffer: Vec::new(),
        }
    }

    /// A zeroed data page of `block_size` bytes.
    pub fn block_size(&mut self, block_size: usize) -> &mut Self {
        self.byte_buffer = vec![0; block_size];
        self
    }

    /// Wraps existing bytes, as done for log records.
    pub fn log_buffer(&mut self, buffer: Vec<u8>) -> &mut Self {
        self.byte_buffer = buffer;
        self
    }

    pub fn build(&mut self) -> Page {
        let bb = std::mem::take(&mut self.byte_buffer);
        Page { byte_buffer: bb }
    }
}

impl Default for PageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Block-addressed file I/O. Every call is serialised on the open-file map.
pub struct FileManager {
    db_directory: PathBuf,
    block_size: usize,
    is_new: bool,
    open_files: Mutex<HashMap<String, File>>,
}

impl FileManager {
    pub fn new(db_directory: impl AsRef<Path>, block_size: usize) -> std::io::Result<FileManager> {
        let db_directory = db_directory.as_ref().to_path_buf();
        let is_new = !db_directory.exists();
        if is_new {
            std::fs::create_dir_all(&db_directory)?;
        }

        // Remove all temp files on startup
        for entry in std::fs::read_dir(&db_directory)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with("temp") {
                debug!("removing leftover temp file {:?}", entry.path());
                std::fs::remove_file(entry.path())?;
            }
        }

        Ok(FileManager {
            db_directory,
            block_size,
            is_new,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    /// Reads `block_id` into `page`. Bytes past the end of the file read as zero.
    pub fn read(&self, block_id: &BlockId, page: &mut Page) -> std::io::Result<()> {
        let mut files = self.open_files.lock();
        let file = self.get_file(&mut files, block_id.file_name())?;
        file.seek(SeekFrom::Start(self.offset_of(block_id)))?;

        let buf = page.contents_mut();
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    pub fn write(&self, block_id: &BlockId, page: &Page) -> std::io::Result<()> {
        let mut files = self.open_files.lock();
        let file = self.get_file(&mut files, block_id.file_name())?;
        file.seek(SeekFrom::Start(self.offset_of(block_id)))?;
        file.write_all(page.contents())?;
        file.sync_data()
    }

    /// Extends `file_name` by one zeroed block and returns its id.
    pub fn append(&self, file_name: &str) -> std::io::Result<BlockId> {
        let mut files = self.open_files.lock();
        let file = self.get_file(&mut files, file_name)?;
        let new_block_num = (file.metadata()?.len() / self.block_size as u64) as u32;
        let block_id = BlockId::new(file_name, new_block_num);
        file.seek(SeekFrom::Start(self.offset_of(&block_id)))?;
        file.write_all(&vec![0u8; self.block_size])?;
        file.sync_data()?;
        Ok(block_id)
    }

    /// Number of blocks in `file_name`.
    pub fn length(&self, file_name: &str) -> std::io::Result<u32> {
        let mut files = self.open_files.lock();
        let file = self.get_file(&mut files, file_name)?;
        Ok((file.metadata()?.len() / self.block_size as u64) as u32)
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn offset_of(&self, block_id: &BlockId) -> u64 {
        block_id.block_num() as u64 * self.block_size as u64
    }

    fn get_file<'a>(
        &self,
        files: &'a mut HashMap<String, File>,
        file_name: &str,
    ) -> std::io::Result<&'a mut File> {
        if !files.contains_key(file_name) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.db_directory.join(file_name))?;
            files.insert(file_name.to_string(), file);
        }
        files
            .get_mut(file_name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
    }
}
