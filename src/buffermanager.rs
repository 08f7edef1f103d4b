use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{AbortCause, Error, Result};
use crate::filemanager::{BlockId, FileManager, Page};
use crate::logmanager::{LogManager, Lsn};
use crate::TxNum;

/// How long `pin` waits for a free buffer before aborting.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// A buffer as handed out by [`BufferManager::pin`].
///
/// Callers lock it to read or modify the page. The lock must not be held
/// across calls back into the buffer manager.
pub type SharedBuffer = Arc<Mutex<Buffer>>;

/// One in-memory slot that may hold the image of a block.
pub struct Buffer {
    file_manager: Arc<FileManager>,
    log_manager: Arc<LogManager>,
    id: usize,
    contents: Page,
    block_id: Option<BlockId>,
    pins: u32,
    txnum: Option<TxNum>,
    lsn: Option<Lsn>,
}

impl Buffer {
    pub fn new(file_manager: Arc<FileManager>, log_manager: Arc<LogManager>, id: usize) -> Buffer {
        let contents = Page::builder().block_size(file_manager.block_size()).build();
        Buffer {
            file_manager,
            log_manager,
            id,
            contents,
            block_id: None,
            pins: 0,
            txnum: None,
            lsn: None,
        }
    }

    /// Slot index in the pool. Never changes.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn contents(&self) -> &Page {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Page {
        &mut self.contents
    }

    pub fn block_id(&self) -> Option<&BlockId> {
        self.block_id.as_ref()
    }

    pub fn pin_count(&self) -> u32 {
        self.pins
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    /// The transaction that modified this buffer since it was last flushed.
    pub fn modifying_tx(&self) -> Option<TxNum> {
        self.txnum
    }

    /// Records that `txnum` changed the page. `lsn` is the log record of the
    /// change, or `None` when the change was not logged.
    pub fn set_modified(&mut self, txnum: TxNum, lsn: Option<Lsn>) {
        self.txnum = Some(txnum);
        if let Some(lsn) = lsn {
            self.lsn = Some(lsn);
        }
    }

    /// Rebinds the buffer to `block_id`, writing out the old block first if it
    /// is dirty.
    ///
    /// If the read fails the buffer is left unassigned.
    pub(crate) fn assign_to_block(&mut self, block_id: BlockId) -> Result<()> {
        self.flush()?;
        self.block_id = None;
        self.file_manager.read(&block_id, &mut self.contents)?;
        self.block_id = Some(block_id);
        self.pins = 0;
        self.lsn = None;
        Ok(())
    }

    /// Writes the page to disk if it has been modified, honouring the
    /// write-ahead rule. Flushing a clean buffer does nothing.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.txnum.is_none() {
            return Ok(());
        }
        if let Some(block_id) = &self.block_id {
            if let Some(lsn) = self.lsn {
                self.log_manager.flush(lsn)?;
            }
            self.file_manager.write(block_id, &self.contents)?;
            debug!("buffer {} flushed {}", self.id, block_id);
        }
        self.txnum = None;
        Ok(())
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    pub(crate) fn unpin(&mut self) {
        assert!(self.pins > 0, "buffer {} unpinned more often than pinned", self.id);
        self.pins -= 1;
    }
}

/// Owns a fixed pool of buffers and maps blocks onto them.
///
/// Every pool state transition happens under one pool-wide lock. Callers that
/// find no unpinned buffer wait on a pool-wide condition for up to
/// `max_wait` and then abort.
pub struct BufferManager {
    buffers: Vec<SharedBuffer>,
    state: Mutex<PoolState>,
    available: Condvar,
    max_wait: Duration,
}

struct PoolState {
    in_memory: HashMap<BlockId, usize>,
    // Any unpinned buffer may be taken; no recency is tracked.
    unpinned: VecDeque<usize>,
    interrupts: u64,
}

impl BufferManager {
    pub fn builder(
        file_manager: Arc<FileManager>,
        log_manager: Arc<LogManager>,
    ) -> BufferManagerBuilder {
        BufferManagerBuilder::new(file_manager, log_manager)
    }

    /// Pins a buffer to `block_id`, waiting for one to become free if needed.
    ///
    /// Fails with [`Error::BufferAbort`] if none is free within `max_wait` or
    /// the wait is interrupted.
    pub fn pin(&self, block_id: &BlockId) -> Result<SharedBuffer> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.state.lock();
        let interrupts = state.interrupts;
        loop {
            if let Some(idx) = self.try_to_pin(&mut state, block_id)? {
                trace!("pinned {} to buffer {}", block_id, idx);
                return Ok(Arc::clone(&self.buffers[idx]));
            }
            if Instant::now() >= deadline {
                warn!("gave up waiting for a buffer for {}", block_id);
                return Err(Error::BufferAbort(AbortCause::TimedOut));
            }
            debug!("no unpinned buffer for {}, waiting", block_id);
            // a timed-out wait still gets one more attempt above
            let _ = self.available.wait_until(&mut state, deadline);
            if state.interrupts != interrupts {
                warn!("wait for a buffer for {} was interrupted", block_id);
                return Err(Error::BufferAbort(AbortCause::Interrupted));
            }
        }
    }

    /// Releases one pin. When the count reaches zero the buffer becomes a
    /// candidate for reuse and every waiter is woken.
    pub fn unpin(&self, buffer: &SharedBuffer) {
        let mut state = self.state.lock();
        let mut buf = buffer.lock();
        buf.unpin();
        if !buf.is_pinned() {
            state.unpinned.push_back(buf.id());
            self.available.notify_all();
        }
    }

    /// Number of unpinned buffers.
    pub fn available(&self) -> usize {
        self.state.lock().unpinned.len()
    }

    pub fn size(&self) -> usize {
        self.buffers.len()
    }

    /// Flushes every buffer modified by `txnum`. Pins are left as they are.
    pub fn flush_all(&self, txnum: TxNum) -> Result<()> {
        let _state = self.state.lock();
        for buffer in &self.buffers {
            let mut buf = buffer.lock();
            if buf.modifying_tx() == Some(txnum) {
                buf.flush()?;
            }
        }
        Ok(())
    }

    /// Aborts every thread currently waiting in [`BufferManager::pin`].
    pub fn interrupt_waiters(&self) {
        let mut state = self.state.lock();
        state.interrupts += 1;
        self.available.notify_all();
    }

    /// Snapshot of the pool for diagnostics. Also logged at info level.
    pub fn status(&self) -> BufferPoolStatus {
        let state = self.state.lock();
        let buffers = self
            .buffers
            .iter()
            .map(|buffer| {
                let buf = buffer.lock();
                BufferStatus {
                    id: buf.id(),
                    block_id: buf.block_id().cloned(),
                    pins: buf.pin_count(),
                }
            })
            .collect();
        let status = BufferPoolStatus {
            buffers,
            unpinned: state.unpinned.iter().copied().collect(),
        };
        info!("{}", status);
        status
    }

    fn try_to_pin(&self, state: &mut PoolState, block_id: &BlockId) -> Result<Option<usize>> {
        let idx = match state.in_memory.get(block_id) {
            Some(&idx) => {
                if !self.buffers[idx].lock().is_pinned() {
                    state.unpinned.retain(|&i| i != idx);
                }
                idx
            }
            None => {
                let Some(idx) = state.unpinned.pop_front() else {
                    return Ok(None);
                };
                self.reassign(state, idx, block_id)?;
                idx
            }
        };
        self.buffers[idx].lock().pin();
        Ok(Some(idx))
    }

    fn reassign(&self, state: &mut PoolState, idx: usize, block_id: &BlockId) -> Result<()> {
        let mut buf = self.buffers[idx].lock();
        if let Some(old) = buf.block_id() {
            debug!("evicting {} from buffer {}", old, idx);
            state.in_memory.remove(old);
        }
        if let Err(e) = buf.assign_to_block(block_id.clone()) {
            // put the victim back the way it was found
            if let Some(old) = buf.block_id() {
                state.in_memory.insert(old.clone(), idx);
            }
            state.unpinned.push_front(idx);
            return Err(e);
        }
        state.in_memory.insert(block_id.clone(), idx);
        Ok(())
    }
}

pub struct BufferManagerBuilder {
    file_manager: Arc<FileManager>,
    log_manager: Arc<LogManager>,
    num_buffers: usize,
    max_wait: Duration,
}

impl BufferManagerBuilder {
    pub fn new(file_manager: Arc<FileManager>, log_manager: Arc<LogManager>) -> Self {
        Self {
            file_manager,
            log_manager,
            num_buffers: 8,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn num_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// # Panics
    ///
    /// Panics if the pool would have no buffers.
    pub fn build(self) -> BufferManager {
        assert!(self.num_buffers > 0, "buffer pool needs at least one buffer");
        let buffers = (0..self.num_buffers)
            .map(|id| {
                Arc::new(Mutex::new(Buffer::new(
                    Arc::clone(&self.file_manager),
                    Arc::clone(&self.log_manager),
                    id,
                )))
            })
            .collect();
        BufferManager {
            buffers,
            state: Mutex::new(PoolState {
                in_memory: HashMap::new(),
                unpinned: (0..self.num_buffers).collect(),
                interrupts: 0,
            }),
            available: Condvar::new(),
            max_wait: self.max_wait,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub id: usize,
    pub block_id: Option<BlockId>,
    pub pins: u32,
}

/// Every buffer with its block and pin state, plus the unpinned buffers in
/// the order they would be picked for reuse.
#[derive(Debug, Clone)]
pub struct BufferPoolStatus {
    pub buffers: Vec<BufferStatus>,
    pub unpinned: Vec<usize>,
}

impl Display for BufferPoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Buffers and their contents:")?;
        for b in &self.buffers {
            match &b.block_id {
                Some(blk) => writeln!(
                    f,
                    "Buffer {}: {} {}",
                    b.id,
                    blk,
                    if b.pins > 0 { "pinned" } else { "unpinned" }
                )?,
                None => writeln!(f, "Buffer {}: unassigned", b.id)?,
            }
        }
        write!(f, "Unpinned buffers:")?;
        for id in &self.unpinned {
            write!(f, " {}", id)?;
        }
        Ok(())
    }
}
