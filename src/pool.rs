use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::{lock, wait_on_condvar, ChunkResult, PipelineError, WorkItem};

struct Task {
    item: WorkItem,
    slot: Arc<TaskSlot>,
}

#[derive(Default)]
struct TaskSlot {
    done: AtomicBool,
    result: Mutex<Option<ChunkResult>>,
    ready_cv: Condvar,
}

/// Ownership token for one submitted work item. Exactly one handle exists per
/// submission; retrieval consumes it.
pub struct TaskHandle {
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    /// Non-blocking completion check.
    pub fn is_ready(&self) -> bool {
        self.slot.done.load(Ordering::Acquire)
    }

    /// Take the computed bytes, or the propagated failure.
    ///
    /// Blocks on the completion slot if called before readiness.
    pub fn retrieve(self) -> ChunkResult {
        let mut guard = lock(&self.slot.result)?;
        while guard.is_none() {
            guard = wait_on_condvar(&self.slot.ready_cv, guard)?;
        }
        guard
            .take()
            .unwrap_or(Err(PipelineError::Internal("task result already taken")))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    closed: bool,
}

/// Fixed-size pool of worker threads consuming a shared FIFO task queue.
pub struct ThreadPool {
    queue_state: Arc<(Mutex<QueueState>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        let queue_state = Arc::new((Mutex::new(QueueState::default()), Condvar::new()));
        let workers = (0..threads.max(1))
            .map(|_| {
                let queue_ref = Arc::clone(&queue_state);
                std::thread::spawn(move || worker_loop(queue_ref))
            })
            .collect();
        Self {
            queue_state,
            workers,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, item: WorkItem) -> TaskHandle {
        let slot = Arc::new(TaskSlot::default());
        let handle = TaskHandle {
            slot: Arc::clone(&slot),
        };
        let (queue_lock, queue_cv) = &*self.queue_state;
        // The queue lock is only held around push/pop; no user code runs under
        // it, so poisoning cannot leave the state inconsistent.
        let mut state = queue_lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(Task { item, slot });
        queue_cv.notify_one();
        handle
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let (queue_lock, queue_cv) = &*self.queue_state;
            let mut state = queue_lock.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            for task in state.queue.drain(..) {
                complete(
                    &task.slot,
                    Err(PipelineError::Internal(
                        "worker pool shut down before task ran",
                    )),
                );
            }
            queue_cv.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(queue_state: Arc<(Mutex<QueueState>, Condvar)>) {
    loop {
        let task = {
            let (queue_lock, queue_cv) = &*queue_state;
            let mut state = match queue_lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Some(task);
                }
                if state.closed {
                    break None;
                }
                state = match queue_cv.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };

        let Some(task) = task else {
            break;
        };

        // A panicking work item must still resolve its slot, otherwise the
        // coordinator would poll its handle forever.
        let result = match panic::catch_unwind(AssertUnwindSafe(task.item)) {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Chunk("work item panicked".to_string())),
        };
        complete(&task.slot, result);
    }
}

fn complete(slot: &TaskSlot, result: ChunkResult) {
    let mut guard = match slot.result.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(result);
    drop(guard);
    slot.done.store(true, Ordering::Release);
    slot.ready_cv.notify_all();
}
