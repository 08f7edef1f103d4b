//! Multi-threaded behaviour of the buffer pool and the lock table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use simpledb_txcore::{
    AbortCause, BlockId, BufferManager, ConcurrencyManager, Error, FileManager, LockState,
    LockTable, LogManager,
};
use tempdir::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn buffer_manager(dir: &TempDir, num_buffers: usize, max_wait: Duration) -> Arc<BufferManager> {
    let fm = Arc::new(FileManager::new(dir.path(), 64).unwrap());
    let lm = Arc::new(
        LogManager::builder("test.log", Arc::clone(&fm))
            .build()
            .unwrap(),
    );
    Arc::new(
        BufferManager::builder(fm, lm)
            .num_buffers(num_buffers)
            .max_wait(max_wait)
            .build(),
    )
}

#[test]
fn exhausted_pool_aborts_after_timeout() {
    init_logger();
    let tmp_dir = TempDir::new("exhausted_pool").unwrap();
    let max_wait = Duration::from_millis(300);
    let bm = buffer_manager(&tmp_dir, 1, max_wait);

    let held = bm.pin(&BlockId::new("data", 0)).unwrap();

    let waiter = {
        let bm = Arc::clone(&bm);
        thread::spawn(move || {
            let start = Instant::now();
            let result = bm.pin(&BlockId::new("data", 1));
            (result.map(|_| ()), start.elapsed())
        })
    };
    let (result, waited) = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::BufferAbort(AbortCause::TimedOut))));
    assert!(waited >= max_wait);
    assert_eq!(bm.available(), 0);

    bm.unpin(&held);
    assert_eq!(bm.available(), 1);
}

#[test]
fn unpin_wakes_buffer_waiter() {
    init_logger();
    let tmp_dir = TempDir::new("unpin_wakes").unwrap();
    let bm = buffer_manager(&tmp_dir, 1, Duration::from_secs(5));
    let held = bm.pin(&BlockId::new("data", 0)).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let bm = Arc::clone(&bm);
        thread::spawn(move || {
            let buffer = bm.pin(&BlockId::new("data", 1)).unwrap();
            tx.send(()).unwrap();
            let block = buffer.lock().block_id().cloned();
            bm.unpin(&buffer);
            block
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    bm.unpin(&held);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(waiter.join().unwrap(), Some(BlockId::new("data", 1)));
}

#[test]
fn interrupt_aborts_buffer_waiter() {
    init_logger();
    let tmp_dir = TempDir::new("interrupt_pool").unwrap();
    let bm = buffer_manager(&tmp_dir, 1, Duration::from_secs(5));
    let _held = bm.pin(&BlockId::new("data", 0)).unwrap();

    let waiter = {
        let bm = Arc::clone(&bm);
        thread::spawn(move || bm.pin(&BlockId::new("data", 1)).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(100));
    bm.interrupt_waiters();
    assert!(matches!(
        waiter.join().unwrap(),
        Err(Error::BufferAbort(AbortCause::Interrupted))
    ));
}

#[test]
fn pinned_buffers_are_never_evicted() {
    init_logger();
    let tmp_dir = TempDir::new("no_premature_eviction").unwrap();
    let bm = buffer_manager(&tmp_dir, 3, Duration::from_secs(10));

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let bm = Arc::clone(&bm);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let blk = BlockId::new("data", (t * 7 + i) % 6);
                    let buffer = bm.pin(&blk).unwrap();
                    assert_eq!(buffer.lock().block_id(), Some(&blk));
                    thread::sleep(Duration::from_millis(1));
                    assert_eq!(buffer.lock().block_id(), Some(&blk));
                    bm.unpin(&buffer);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(bm.available(), 3);
    let status = bm.status();
    assert!(status.buffers.iter().all(|b| b.pins == 0));
    assert_eq!(status.unpinned.len(), 3);
}

#[test]
fn older_transaction_dies_on_younger_holder() {
    init_logger();
    let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(5)));
    let blk = BlockId::new("data", 0);
    let mut younger = ConcurrencyManager::new(5, Arc::clone(&table));
    let mut older = ConcurrencyManager::new(3, Arc::clone(&table));

    younger.shared_lock(&blk).unwrap();
    let start = Instant::now();
    let err = older.exclusive_lock(&blk).unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, Error::LockAbort { cause: AbortCause::Died, .. }));

    older.release_all();
    younger.release_all();
    assert_eq!(table.locked_blocks(), 0);
}

#[test]
fn younger_transaction_waits_for_older_holder() {
    init_logger();
    let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(5)));
    let blk = BlockId::new("data", 0);
    let mut older = ConcurrencyManager::new(3, Arc::clone(&table));
    older.shared_lock(&blk).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let table = Arc::clone(&table);
        let blk = blk.clone();
        thread::spawn(move || {
            let mut younger = ConcurrencyManager::new(5, table);
            let result = younger.exclusive_lock(&blk);
            tx.send(()).unwrap();
            result
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    older.release_all();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap().unwrap();
    assert_eq!(table.holders(&blk), Some(LockState::Exclusive(5)));
}

#[test]
fn upgrade_times_out_while_older_holder_stays() {
    init_logger();
    let max_wait = Duration::from_millis(200);
    let table = Arc::new(LockTable::with_max_wait(max_wait));
    let blk = BlockId::new("data", 0);
    let mut older = ConcurrencyManager::new(3, Arc::clone(&table));
    let mut younger = ConcurrencyManager::new(5, Arc::clone(&table));
    older.shared_lock(&blk).unwrap();

    let start = Instant::now();
    let err = younger.exclusive_lock(&blk).unwrap_err();
    assert!(start.elapsed() >= max_wait);
    assert!(matches!(err, Error::LockAbort { cause: AbortCause::TimedOut, .. }));
    assert_eq!(
        table.holders(&blk),
        Some(LockState::Shared(HashSet::from([3, 5])))
    );

    younger.release_all();
    older.release_all();
    assert_eq!(table.locked_blocks(), 0);
}

#[test]
fn crossing_upgrades_cannot_deadlock() {
    init_logger();
    let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(10)));
    let a = BlockId::new("data", 0);
    let b = BlockId::new("data", 1);

    let mut cm1 = ConcurrencyManager::new(1, Arc::clone(&table));
    let mut cm2 = ConcurrencyManager::new(2, Arc::clone(&table));
    cm1.shared_lock(&a).unwrap();
    cm2.shared_lock(&b).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let start = Instant::now();
    let t1 = {
        let barrier = Arc::clone(&barrier);
        let b = b.clone();
        thread::spawn(move || {
            barrier.wait();
            let result = cm1.exclusive_lock(&b);
            cm1.release_all();
            result
        })
    };
    let t2 = {
        let barrier = Arc::clone(&barrier);
        let a = a.clone();
        thread::spawn(move || {
            barrier.wait();
            let result = cm2.exclusive_lock(&a);
            cm2.release_all();
            result
        })
    };
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    // tx 1 is older than tx 2's shared lock on b, so it dies; tx 2 only waits
    // for tx 1, which goes away once it has died
    assert!(matches!(r1, Err(Error::LockAbort { cause: AbortCause::Died, .. })));
    assert!(r2.is_ok());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(table.locked_blocks(), 0);
}

#[test]
fn exclusive_holders_are_alone() {
    init_logger();
    let table = Arc::new(LockTable::with_max_wait(Duration::from_secs(5)));
    let next_txnum = Arc::new(AtomicI32::new(0));
    let readers: Arc<Vec<AtomicUsize>> =
        Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
    let writers: Arc<Vec<AtomicUsize>> =
        Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());

    let workers: Vec<_> = (0..6)
        .map(|t| {
            let table = Arc::clone(&table);
            let next_txnum = Arc::clone(&next_txnum);
            let readers = Arc::clone(&readers);
            let writers = Arc::clone(&writers);
            thread::spawn(move || {
                let mut committed = 0;
                for i in 0..40usize {
                    let txnum = next_txnum.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut cm = ConcurrencyManager::new(txnum, Arc::clone(&table));
                    let n = (t + i) % 3;
                    let blk = BlockId::new("data", n as u32);
                    let exclusive = (t + i) % 4 == 0;
                    let granted = if exclusive {
                        cm.exclusive_lock(&blk)
                    } else {
                        cm.shared_lock(&blk)
                    };
                    match granted {
                        Ok(()) => {
                            if exclusive {
                                assert_eq!(writers[n].fetch_add(1, Ordering::SeqCst), 0);
                                assert_eq!(readers[n].load(Ordering::SeqCst), 0);
                                thread::sleep(Duration::from_millis(1));
                                writers[n].fetch_sub(1, Ordering::SeqCst);
                            } else {
                                readers[n].fetch_add(1, Ordering::SeqCst);
                                assert_eq!(writers[n].load(Ordering::SeqCst), 0);
                                thread::sleep(Duration::from_millis(1));
                                readers[n].fetch_sub(1, Ordering::SeqCst);
                            }
                            committed += 1;
                        }
                        Err(e) => assert!(e.is_abort()),
                    }
                    cm.release_all();
                }
                committed
            })
        })
        .collect();

    let committed: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(committed > 0);
    assert_eq!(table.locked_blocks(), 0);
}
