use crate::error::StoreResult;
use crate::model::*;
use async_trait::async_trait;

/// Persistence trait for everything the BMP controller reads or writes.
///
/// Every method is a composite, atomic operation: one lock hold in the
/// memory backend, one transaction in Postgres. Taking rows marks them
/// in-progress in the same operation; applying an outcome performs all of
/// its coupled mutations together. The `bool` returns say whether any row
/// actually changed, which is what drives epoch bumps.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Machines ──

    /// All machines, in service or not. Callers filter.
    async fn machines(&self) -> StoreResult<Vec<MachineDesc>>;

    // ── Startup recovery ──

    /// Clear `in_progress` flags left behind by a crashed previous run so
    /// their requests are taken again. Returns how many rows were reset.
    async fn clear_stale_in_progress(&self) -> StoreResult<u64>;

    // ── Taking work ──

    /// Job ids with pending (not in-progress) changes on one machine.
    async fn jobs_with_pending_changes(&self, machine: &str) -> StoreResult<Vec<JobId>>;

    /// Take every pending change row for one job: mark the rows in-progress
    /// and return them joined with physical identity and board address.
    async fn take_changes_for_job(&self, job: JobId) -> StoreResult<Vec<ChangeRow>>;

    /// Pending (uncompleted) blacklist operations, oldest first.
    async fn pending_blacklist_ops(&self) -> StoreResult<Vec<BlacklistOpRow>>;

    /// Finish a change set that cancelled out to nothing: set the job state
    /// directly and delete the covered rows. No hardware work happens.
    async fn finish_zero_change(
        &self,
        job: JobId,
        to: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool>;

    // ── Applying power outcomes ──

    /// Record a successful PowerRequest: set the power bit (and power
    /// timestamps) for every listed board, advance the job to `to`,
    /// deallocate the job's boards when `to` is DESTROYED, and delete the
    /// covered change rows.
    async fn power_succeeded(
        &self,
        job: JobId,
        to: JobState,
        on_boards: &[BoardId],
        off_boards: &[BoardId],
        changes: &[ChangeId],
    ) -> StoreResult<bool>;

    /// Record a failed PowerRequest: reset `in_progress` on every covered
    /// row (the rows stay) and roll the job back to `from`.
    async fn power_failed(
        &self,
        job: JobId,
        from: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool>;

    /// Quarantine after a permanent failure on the way to READY: job back
    /// to QUEUED, its boards deallocated, all of its queued changes
    /// deleted, the named board marked not functioning, and a board-issue
    /// report filed under `reporter`.
    async fn quarantine_board(
        &self,
        job: JobId,
        board: BoardId,
        reporter: &str,
    ) -> StoreResult<bool>;

    /// Mark a board not functioning outside any job context (blacklist
    /// operations gone permanently wrong) and file a report.
    async fn take_out_of_service(&self, board: BoardId, reporter: &str) -> StoreResult<bool>;

    // ── Applying blacklist outcomes ──

    /// Store a read blacklist plus the serial numbers learned on the way.
    async fn blacklist_read_done(
        &self,
        op: OpId,
        board: BoardId,
        blacklist: &Blacklist,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()>;

    /// Mark a blacklist write completed.
    async fn blacklist_write_done(&self, op: OpId) -> StoreResult<()>;

    /// Mark a serial read completed and record the serials on the board.
    async fn serial_read_done(
        &self,
        op: OpId,
        board: BoardId,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()>;

    /// Mark a blacklist operation failed, storing the exception text.
    async fn blacklist_op_failed(&self, op: OpId, message: &str) -> StoreResult<()>;

    // ── Management / inspection ──

    /// Count of change rows not yet in progress (operator counter).
    async fn pending_change_count(&self) -> StoreResult<u64>;

    async fn board(&self, board: BoardId) -> StoreResult<Option<BoardRecord>>;

    async fn job_state(&self, job: JobId) -> StoreResult<Option<JobState>>;

    /// Reports filed against one board, oldest first.
    async fn board_reports(&self, board: BoardId) -> StoreResult<Vec<BoardReport>>;
}
