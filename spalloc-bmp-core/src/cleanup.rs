use crate::epochs::{BusyJobs, BusyOps, Epochs};
use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::report::{EmailSender, SerialMapper};
use crate::store::Store;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Deferred outcome of a hardware request. Each variant carries everything
/// its store mutation needs; nothing here refers back into worker state.
#[derive(Clone, Debug)]
pub enum Completion {
    PowerDone {
        job: JobId,
        to: JobState,
        on_boards: Vec<BoardId>,
        off_boards: Vec<BoardId>,
        changes: Vec<ChangeId>,
    },
    PowerFailed {
        job: JobId,
        from: JobState,
        changes: Vec<ChangeId>,
    },
    /// Extra task enqueued beside `PowerFailed` on a permanent failure
    /// while heading for READY.
    QuarantineBoard {
        machine: String,
        job: JobId,
        board: BoardId,
    },
    /// Blacklist access gave up on the board permanently.
    TakeOutOfService {
        machine: String,
        board: BoardId,
    },
    BlacklistRead {
        op: OpId,
        board: BoardId,
        blacklist: Blacklist,
        bmp_serial: String,
    },
    BlacklistWritten {
        op: OpId,
    },
    SerialRead {
        op: OpId,
        board: BoardId,
        bmp_serial: String,
    },
    BlacklistFailed {
        op: OpId,
        message: String,
    },
}

/// Work deferred until after the store mutations of a drain have committed.
#[derive(Clone, Debug)]
pub enum PostCleanup {
    BoardIssueEmail { machine: String, board: BoardId },
}

/// The two deferred-work queues: completions from workers (multi-producer,
/// controller sole consumer) and post-commit actions produced while
/// draining them.
#[derive(Debug, Default)]
pub struct CompletionQueues {
    cleanup: Mutex<VecDeque<Completion>>,
    post: Mutex<VecDeque<PostCleanup>>,
}

impl CompletionQueues {
    pub fn push(&self, completion: Completion) {
        self.cleanup
            .lock()
            .expect("cleanup queue poisoned")
            .push_back(completion);
    }

    fn pop(&self) -> Option<Completion> {
        self.cleanup
            .lock()
            .expect("cleanup queue poisoned")
            .pop_front()
    }

    fn push_front(&self, completion: Completion) {
        self.cleanup
            .lock()
            .expect("cleanup queue poisoned")
            .push_front(completion);
    }

    fn push_post(&self, action: PostCleanup) {
        self.post
            .lock()
            .expect("post queue poisoned")
            .push_back(action);
    }

    fn drain_post(&self) -> Vec<PostCleanup> {
        self.post
            .lock()
            .expect("post queue poisoned")
            .drain(..)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.cleanup.lock().expect("cleanup queue poisoned").len()
    }
}

#[derive(Default)]
struct DrainFlags {
    jobs_changed: bool,
    blacklist_done: bool,
}

/// Drain the completion queue, applying each outcome in one atomic store
/// operation. Epochs are bumped only after the mutations have committed; a
/// busy store leaves the rest of the queue for the next tick. Post-commit
/// actions (operator emails) run last either way.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn drain(
    queues: &CompletionQueues,
    store: &dyn Store,
    busy_jobs: &BusyJobs,
    busy_ops: &BusyOps,
    epochs: &Epochs,
    email: &dyn EmailSender,
    serials: &dyn SerialMapper,
    report_user: &str,
) -> StoreResult<()> {
    let mut flags = DrainFlags::default();
    let result = loop {
        let Some(completion) = queues.pop() else {
            break Ok(());
        };
        match apply_one(queues, store, busy_jobs, busy_ops, serials, report_user, &completion)
            .await
        {
            Ok(applied) => {
                flags.jobs_changed |= applied.jobs_changed;
                flags.blacklist_done |= applied.blacklist_done;
            }
            Err(StoreError::Busy) => {
                // Not applied: put it back and retry the whole tail next tick.
                queues.push_front(completion);
                break Err(StoreError::Busy);
            }
            Err(e) => break Err(e),
        }
    };

    if flags.jobs_changed {
        epochs.jobs.bump();
        epochs.machine.bump();
    }
    if flags.blacklist_done {
        epochs.blacklist.bump();
    }

    for action in queues.drain_post() {
        match action {
            PostCleanup::BoardIssueEmail { machine, board } => {
                email
                    .send(
                        &format!("Board taken out of service on {machine}"),
                        &format!(
                            "Board {board} on machine {machine} was marked as not \
                             functioning by the BMP controller and needs attention."
                        ),
                    )
                    .await;
            }
        }
    }

    result
}

async fn apply_one(
    queues: &CompletionQueues,
    store: &dyn Store,
    busy_jobs: &BusyJobs,
    busy_ops: &BusyOps,
    serials: &dyn SerialMapper,
    report_user: &str,
    completion: &Completion,
) -> StoreResult<DrainFlags> {
    let mut flags = DrainFlags::default();
    match completion {
        Completion::PowerDone {
            job,
            to,
            on_boards,
            off_boards,
            changes,
        } => {
            flags.jobs_changed = store
                .power_succeeded(*job, *to, on_boards, off_boards, changes)
                .await?;
            busy_jobs.remove(*job);
            tracing::info!(job, state = %to, "power request applied");
        }
        Completion::PowerFailed { job, from, changes } => {
            flags.jobs_changed = store.power_failed(*job, *from, changes).await?;
            busy_jobs.remove(*job);
            tracing::warn!(job, state = %from, "power request failed, job rolled back");
        }
        Completion::QuarantineBoard {
            machine,
            job,
            board,
        } => {
            flags.jobs_changed = store.quarantine_board(*job, *board, report_user).await?;
            if flags.jobs_changed {
                queues.push_post(PostCleanup::BoardIssueEmail {
                    machine: machine.clone(),
                    board: *board,
                });
            }
            tracing::warn!(job, board, machine, "board quarantined, job re-queued");
        }
        Completion::TakeOutOfService { machine, board } => {
            flags.jobs_changed = store.take_out_of_service(*board, report_user).await?;
            if flags.jobs_changed {
                queues.push_post(PostCleanup::BoardIssueEmail {
                    machine: machine.clone(),
                    board: *board,
                });
            }
            tracing::warn!(board, machine, "board taken out of service");
        }
        Completion::BlacklistRead {
            op,
            board,
            blacklist,
            bmp_serial,
        } => {
            let physical = serials.physical_serial(bmp_serial);
            store
                .blacklist_read_done(*op, *board, blacklist, bmp_serial, physical.as_deref())
                .await?;
            busy_ops.remove(*op);
            flags.blacklist_done = true;
        }
        Completion::BlacklistWritten { op } => {
            store.blacklist_write_done(*op).await?;
            busy_ops.remove(*op);
            flags.blacklist_done = true;
        }
        Completion::SerialRead {
            op,
            board,
            bmp_serial,
        } => {
            let physical = serials.physical_serial(bmp_serial);
            store
                .serial_read_done(*op, *board, bmp_serial, physical.as_deref())
                .await?;
            busy_ops.remove(*op);
            flags.blacklist_done = true;
        }
        Completion::BlacklistFailed { op, message } => {
            store.blacklist_op_failed(*op, message).await?;
            busy_ops.remove(*op);
            flags.blacklist_done = true;
        }
    }
    Ok(flags)
}
