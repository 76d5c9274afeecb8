use crate::model::{JobId, OpId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

// ─── Epochs ───────────────────────────────────────────────────

/// One monotone change counter with waiters. Watchers snapshot the value,
/// do their read, and block here until the counter moves past the snapshot.
#[derive(Debug, Default)]
pub struct Epoch {
    counter: AtomicU64,
    notify: Notify,
}

impl Epoch {
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Advance the counter and wake every waiter. Callers only bump after
    /// the store mutation that the bump advertises has committed.
    pub fn bump(&self) -> u64 {
        let next = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify.notify_waiters();
        next
    }

    /// Wait until the counter exceeds `prev`, up to `timeout`. Returns
    /// whether a change was observed.
    pub async fn wait_newer(&self, prev: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before the check so a bump between the two
            // cannot be lost.
            let notified = self.notify.notified();
            if self.current() > prev {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.current() > prev;
            }
        }
    }
}

/// The three process-wide epochs external watchers block on.
#[derive(Debug, Default)]
pub struct Epochs {
    pub jobs: Epoch,
    pub machine: Epoch,
    pub blacklist: Epoch,
}

// ─── Busy sets ────────────────────────────────────────────────

/// Process-wide set of job ids with an in-flight PowerRequest. Inserted by
/// the request taker, removed by the completion applier; this is what keeps
/// a job from being taken twice while hardware work is outstanding.
#[derive(Debug, Default)]
pub struct BusyJobs {
    inner: Mutex<HashSet<JobId>>,
}

impl BusyJobs {
    /// Claim a job. Returns false when it is already in flight.
    pub fn insert(&self, job: JobId) -> bool {
        self.inner.lock().expect("busy-jobs poisoned").insert(job)
    }

    pub fn remove(&self, job: JobId) {
        self.inner.lock().expect("busy-jobs poisoned").remove(&job);
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.inner
            .lock()
            .expect("busy-jobs poisoned")
            .contains(&job)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("busy-jobs poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Same discipline for blacklist operations: the pending-op query only
/// filters on completion, so this set keeps an op from being re-taken while
/// its request is still queued or executing.
#[derive(Debug, Default)]
pub struct BusyOps {
    inner: Mutex<HashSet<OpId>>,
}

impl BusyOps {
    pub fn insert(&self, op: OpId) -> bool {
        self.inner.lock().expect("busy-ops poisoned").insert(op)
    }

    pub fn remove(&self, op: OpId) {
        self.inner.lock().expect("busy-ops poisoned").remove(&op);
    }
}
