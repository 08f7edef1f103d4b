use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{AbortCause, Error, Result};
use crate::filemanager::BlockId;
use crate::TxNum;

/// How long a lock request waits for conflicting holders before aborting.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Current holders of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Shared(HashSet<TxNum>),
    Exclusive(TxNum),
}

/// Block-keyed registry of lock holders, shared by every transaction.
///
/// Deadlock is prevented with wait-die: a transaction only ever waits for
/// older (lower-numbered) transactions. A request that would have to wait for
/// a younger holder fails at once instead.
///
/// All blocks share one wait condition. Whenever a holder leaves a block every
/// waiter wakes and re-checks its own block.
pub struct LockTable {
    locks: Mutex<LockTableState>,
    released: Condvar,
    max_wait: Duration,
}

#[derive(Default)]
struct LockTableState {
    // an entry is never empty; the last holder leaving removes it
    entries: HashMap<BlockId, LockState>,
    interrupts: u64,
}

impl LockTable {
    pub fn new() -> LockTable {
        Self::with_max_wait(DEFAULT_MAX_WAIT)
    }

    pub fn with_max_wait(max_wait: Duration) -> LockTable {
        LockTable {
            locks: Mutex::new(LockTableState::default()),
            released: Condvar::new(),
            max_wait,
        }
    }

    /// Grants `txnum` a shared lock on `block_id`, waiting while another
    /// transaction holds it exclusively.
    pub fn shared_lock(&self, block_id: &BlockId, txnum: TxNum) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.locks.lock();
        let interrupts = state.interrupts;
        loop {
            match state.entries.entry(block_id.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(LockState::Shared(HashSet::from([txnum])));
                    break;
                }
                Entry::Occupied(mut entry) => match entry.get_mut() {
                    LockState::Shared(holders) => {
                        holders.insert(txnum);
                        break;
                    }
                    LockState::Exclusive(holder) if *holder == txnum => break,
                    LockState::Exclusive(_) => {}
                },
            }
            self.wait(&mut state, block_id, txnum, deadline, interrupts)?;
        }
        trace!("tx {} holds a shared lock on {}", txnum, block_id);
        Ok(())
    }

    /// Grants `txnum` the exclusive lock on `block_id`.
    ///
    /// Dies immediately if a younger transaction holds the block, otherwise
    /// waits until `txnum` is the only holder left.
    pub fn exclusive_lock(&self, block_id: &BlockId, txnum: TxNum) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.locks.lock();
        let interrupts = state.interrupts;
        loop {
            let (dies, held, must_wait) = match state.entries.get(block_id) {
                Some(holders) => (
                    has_younger_holder(holders, txnum),
                    *holders == LockState::Exclusive(txnum),
                    has_other_holder(holders, txnum),
                ),
                None => (false, false, false),
            };
            if dies {
                warn!("tx {} dies requesting an exclusive lock on {}", txnum, block_id);
                return Err(Error::LockAbort {
                    block: block_id.clone(),
                    cause: AbortCause::Died,
                });
            }
            if held {
                break;
            }
            if !must_wait {
                state.entries.insert(block_id.clone(), LockState::Exclusive(txnum));
                break;
            }
            self.wait(&mut state, block_id, txnum, deadline, interrupts)?;
        }
        trace!("tx {} holds the exclusive lock on {}", txnum, block_id);
        Ok(())
    }

    /// Releases whatever lock `txnum` holds on `block_id` and wakes all
    /// waiters.
    pub fn unlock(&self, block_id: &BlockId, txnum: TxNum) {
        let mut state = self.locks.lock();
        let now_empty = match state.entries.get_mut(block_id) {
            Some(LockState::Exclusive(holder)) => *holder == txnum,
            Some(LockState::Shared(holders)) => {
                holders.remove(&txnum);
                holders.is_empty()
            }
            None => return,
        };
        if now_empty {
            state.entries.remove(block_id);
        }
        trace!("tx {} released its lock on {}", txnum, block_id);
        self.released.notify_all();
    }

    /// The holders of `block_id`, if anyone holds it.
    pub fn holders(&self, block_id: &BlockId) -> Option<LockState> {
        self.locks.lock().entries.get(block_id).cloned()
    }

    /// Number of blocks currently locked.
    pub fn locked_blocks(&self) -> usize {
        self.locks.lock().entries.len()
    }

    /// Aborts every thread currently waiting for a lock.
    pub fn interrupt_waiters(&self) {
        let mut state = self.locks.lock();
        state.interrupts += 1;
        self.released.notify_all();
    }

    fn wait(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockTableState>,
        block_id: &BlockId,
        txnum: TxNum,
        deadline: Instant,
        interrupts: u64,
    ) -> Result<()> {
        if Instant::now() >= deadline {
            warn!("tx {} timed out waiting for a lock on {}", txnum, block_id);
            return Err(Error::LockAbort {
                block: block_id.clone(),
                cause: AbortCause::TimedOut,
            });
        }
        debug!("tx {} waits for a lock on {}", txnum, block_id);
        let _ = self.released.wait_until(state, deadline);
        if state.interrupts != interrupts {
            warn!("tx {} was interrupted waiting for a lock on {}", txnum, block_id);
            return Err(Error::LockAbort {
                block: block_id.clone(),
                cause: AbortCause::Interrupted,
            });
        }
        Ok(())
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

fn has_younger_holder(holders: &LockState, txnum: TxNum) -> bool {
    match holders {
        LockState::Exclusive(holder) => *holder > txnum,
        LockState::Shared(ids) => ids.iter().any(|&id| id > txnum),
    }
}

fn has_other_holder(holders: &LockState, txnum: TxNum) -> bool {
    match holders {
        LockState::Exclusive(holder) => *holder != txnum,
        LockState::Shared(ids) => ids.iter().any(|&id| id != txnum),
    }
}
