//! Work-stealing batch executor for bulk insert and query.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;

/// Run `op(id, thread_id)` for every `id` in `start..end` across
/// `num_threads` workers pulling from a shared atomic cursor.
///
/// `num_threads == 0` means one worker per available core. The first error
/// wins: it is recorded, remaining workers stop pulling new ids, and work
/// already dispatched runs to completion. `thread_id` lets callers keep
/// per-worker scratch buffers.
pub(crate) fn parallel_for<F>(start: usize, end: usize, num_threads: usize, op: F) -> Result<()>
where
    F: Fn(usize, usize) -> Result<()> + Sync,
{
    let num_threads = if num_threads == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        num_threads
    };

    if num_threads == 1 {
        for id in start..end {
            op(id, 0)?;
        }
        return Ok(());
    }

    let cursor = AtomicUsize::new(start);
    let failure: Mutex<Option<crate::ProximaError>> = Mutex::new(None);
    let op = &op;

    std::thread::scope(|scope| {
        for thread_id in 0..num_threads {
            let cursor = &cursor;
            let failure = &failure;
            scope.spawn(move || loop {
                let id = cursor.fetch_add(1, Ordering::Relaxed);
                if id >= end {
                    break;
                }
                if let Err(error) = op(id, thread_id) {
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                    // Park the cursor past the end so other workers stop
                    // scheduling new work.
                    cursor.store(end, Ordering::Relaxed);
                    break;
                }
            });
        }
    });

    match failure.into_inner() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
