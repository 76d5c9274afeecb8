use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::sync::RwLock;

/// A blacklist-operation row plus its completion state.
#[derive(Clone, Debug)]
pub struct StoredOp {
    pub row: BlacklistOpRow,
    pub completed: bool,
    pub failure: Option<String>,
    pub result: Option<Blacklist>,
}

struct Inner {
    machines: Vec<MachineDesc>,
    boards: HashMap<BoardId, BoardRecord>,
    jobs: HashMap<JobId, JobState>,
    changes: BTreeMap<ChangeId, ChangeRow>,
    ops: BTreeMap<OpId, StoredOp>,
    reports: Vec<BoardReport>,
    next_board: BoardId,
    next_change: ChangeId,
    next_op: OpId,
}

/// In-memory implementation of `Store` for tests and dummy deployments.
/// Atomicity per method comes from holding the write lock for the whole
/// composite operation.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                machines: Vec::new(),
                boards: HashMap::new(),
                jobs: HashMap::new(),
                changes: BTreeMap::new(),
                ops: BTreeMap::new(),
                reports: Vec::new(),
                next_board: 1,
                next_change: 1,
                next_op: 1,
            }),
        }
    }

    // ── Population (used by tests and the server's seeding path) ──

    pub async fn add_machine(&self, machine: MachineDesc) {
        self.inner.write().await.machines.push(machine);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_board(
        &self,
        board_id: Option<BoardId>,
        machine: &str,
        triad: TriadCoords,
        bmp: BmpCoords,
        board_number: BoardNumber,
        address: Option<IpAddr>,
    ) -> BoardId {
        let mut w = self.inner.write().await;
        let id = board_id.unwrap_or_else(|| {
            let id = w.next_board;
            w.next_board += 1;
            id
        });
        w.next_board = w.next_board.max(id + 1);
        w.boards.insert(
            id,
            BoardRecord {
                board_id: id,
                machine: machine.to_string(),
                triad,
                bmp,
                board_number,
                address,
                power: false,
                functioning: true,
                allocated_to: None,
                bmp_serial: None,
                physical_serial: None,
                last_power_on: None,
                last_power_off: None,
            },
        );
        id
    }

    pub async fn add_job(&self, job: JobId, state: JobState) {
        self.inner.write().await.jobs.insert(job, state);
    }

    /// Assign boards to a job, as the allocator would have.
    pub async fn allocate(&self, job: JobId, boards: &[BoardId]) {
        let mut w = self.inner.write().await;
        for id in boards {
            if let Some(b) = w.boards.get_mut(id) {
                b.allocated_to = Some(job);
            }
        }
    }

    pub async fn set_bmp_serial(&self, board: BoardId, serial: &str) {
        if let Some(b) = self.inner.write().await.boards.get_mut(&board) {
            b.bmp_serial = Some(serial.to_string());
        }
    }

    /// Force a board's power bit (seeding power-off scenarios).
    pub async fn set_board_power(&self, board: BoardId, power: bool) {
        if let Some(b) = self.inner.write().await.boards.get_mut(&board) {
            b.power = power;
        }
    }

    /// Enqueue one pending-change row, joining the board's physical
    /// identity and address the way the production queries do.
    pub async fn add_change(
        &self,
        job: JobId,
        board: BoardId,
        from: JobState,
        to: JobState,
        power_on: bool,
        links: LinkFlags,
    ) -> StoreResult<ChangeId> {
        let mut w = self.inner.write().await;
        let rec = w
            .boards
            .get(&board)
            .ok_or_else(|| StoreError::NotFound(format!("board {board}")))?
            .clone();
        let id = w.next_change;
        w.next_change += 1;
        w.changes.insert(
            id,
            ChangeRow {
                change_id: id,
                job_id: job,
                board_id: board,
                bmp: rec.bmp,
                board_number: rec.board_number,
                from_state: from,
                to_state: to,
                power_on,
                current_power: rec.power,
                links,
                in_progress: false,
                board_address: rec.address,
            },
        );
        Ok(id)
    }

    pub async fn add_blacklist_op(
        &self,
        board: BoardId,
        kind: BlacklistOpKind,
        payload: Option<Blacklist>,
    ) -> StoreResult<OpId> {
        let mut w = self.inner.write().await;
        let rec = w
            .boards
            .get(&board)
            .ok_or_else(|| StoreError::NotFound(format!("board {board}")))?
            .clone();
        let id = w.next_op;
        w.next_op += 1;
        w.ops.insert(
            id,
            StoredOp {
                row: BlacklistOpRow {
                    op_id: id,
                    board_id: board,
                    machine: rec.machine.clone(),
                    bmp: rec.bmp,
                    board_number: rec.board_number,
                    kind,
                    expected_serial: rec.bmp_serial.clone(),
                    payload,
                },
                completed: false,
                failure: None,
                result: None,
            },
        );
        Ok(id)
    }

    // ── Inspection (tests) ──

    pub async fn change_rows_for_job(&self, job: JobId) -> Vec<ChangeRow> {
        self.inner
            .read()
            .await
            .changes
            .values()
            .filter(|c| c.job_id == job)
            .cloned()
            .collect()
    }

    pub async fn blacklist_op(&self, op: OpId) -> Option<StoredOp> {
        self.inner.read().await.ops.get(&op).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

impl Inner {
    fn deallocate_job(&mut self, job: JobId) {
        for b in self.boards.values_mut() {
            if b.allocated_to == Some(job) {
                b.allocated_to = None;
            }
        }
    }

    fn set_job_state(&mut self, job: JobId, state: JobState) -> bool {
        match self.jobs.get_mut(&job) {
            Some(s) if *s != state => {
                *s = state;
                true
            }
            _ => false,
        }
    }

    fn record_board_serials(
        &mut self,
        board: BoardId,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) {
        if let Some(b) = self.boards.get_mut(&board) {
            b.bmp_serial = Some(bmp_serial.to_string());
            if let Some(phys) = physical_serial {
                b.physical_serial = Some(phys.to_string());
            }
        }
    }

    fn mark_dead(&mut self, board: BoardId, reporter: &str, issue: &str) -> bool {
        let changed = match self.boards.get_mut(&board) {
            Some(b) if b.functioning => {
                b.functioning = false;
                true
            }
            _ => false,
        };
        if changed {
            self.reports.push(BoardReport {
                board_id: board,
                reporter: reporter.to_string(),
                issue: issue.to_string(),
                timestamp: now_ms(),
            });
        }
        changed
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ── Machines ──

    async fn machines(&self) -> StoreResult<Vec<MachineDesc>> {
        Ok(self.inner.read().await.machines.clone())
    }

    // ── Startup recovery ──

    async fn clear_stale_in_progress(&self) -> StoreResult<u64> {
        let mut w = self.inner.write().await;
        let mut reset = 0;
        for c in w.changes.values_mut() {
            if c.in_progress {
                c.in_progress = false;
                reset += 1;
            }
        }
        Ok(reset)
    }

    // ── Taking work ──

    async fn jobs_with_pending_changes(&self, machine: &str) -> StoreResult<Vec<JobId>> {
        let r = self.inner.read().await;
        let mut jobs: Vec<JobId> = r
            .changes
            .values()
            .filter(|c| !c.in_progress)
            .filter(|c| {
                r.boards
                    .get(&c.board_id)
                    .is_some_and(|b| b.machine == machine)
            })
            .map(|c| c.job_id)
            .collect();
        jobs.sort_unstable();
        jobs.dedup();
        Ok(jobs)
    }

    async fn take_changes_for_job(&self, job: JobId) -> StoreResult<Vec<ChangeRow>> {
        let mut w = self.inner.write().await;
        let powers: HashMap<BoardId, bool> =
            w.boards.iter().map(|(id, b)| (*id, b.power)).collect();
        let mut taken = Vec::new();
        for c in w.changes.values_mut() {
            if c.job_id == job && !c.in_progress {
                c.in_progress = true;
                // The join reads the power bit as of take time.
                if let Some(power) = powers.get(&c.board_id) {
                    c.current_power = *power;
                }
                taken.push(c.clone());
            }
        }
        Ok(taken)
    }

    async fn pending_blacklist_ops(&self) -> StoreResult<Vec<BlacklistOpRow>> {
        let r = self.inner.read().await;
        Ok(r.ops
            .values()
            .filter(|o| !o.completed && o.failure.is_none())
            .map(|o| o.row.clone())
            .collect())
    }

    async fn finish_zero_change(
        &self,
        job: JobId,
        to: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut w = self.inner.write().await;
        let mut changed = false;
        for id in changes {
            changed |= w.changes.remove(id).is_some();
        }
        changed |= w.set_job_state(job, to);
        Ok(changed)
    }

    // ── Applying power outcomes ──

    async fn power_succeeded(
        &self,
        job: JobId,
        to: JobState,
        on_boards: &[BoardId],
        off_boards: &[BoardId],
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut w = self.inner.write().await;
        let now = now_ms();
        let mut changed = false;
        for id in on_boards {
            if let Some(b) = w.boards.get_mut(id) {
                changed |= !b.power;
                b.power = true;
                b.last_power_on = Some(now);
            }
        }
        for id in off_boards {
            if let Some(b) = w.boards.get_mut(id) {
                changed |= b.power;
                b.power = false;
                b.last_power_off = Some(now);
            }
        }
        changed |= w.set_job_state(job, to);
        if to == JobState::Destroyed {
            w.deallocate_job(job);
        }
        for id in changes {
            changed |= w.changes.remove(id).is_some();
        }
        Ok(changed)
    }

    async fn power_failed(
        &self,
        job: JobId,
        from: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut w = self.inner.write().await;
        let mut changed = false;
        for id in changes {
            if let Some(c) = w.changes.get_mut(id) {
                changed |= c.in_progress;
                c.in_progress = false;
            }
        }
        changed |= w.set_job_state(job, from);
        Ok(changed)
    }

    async fn quarantine_board(
        &self,
        job: JobId,
        board: BoardId,
        reporter: &str,
    ) -> StoreResult<bool> {
        let mut w = self.inner.write().await;
        let mut changed = w.set_job_state(job, JobState::Queued);
        w.deallocate_job(job);
        let doomed: Vec<ChangeId> = w
            .changes
            .values()
            .filter(|c| c.job_id == job)
            .map(|c| c.change_id)
            .collect();
        for id in doomed {
            w.changes.remove(&id);
            changed = true;
        }
        changed |= w.mark_dead(
            board,
            reporter,
            "board was not reachable when powering on: taking out of service",
        );
        Ok(changed)
    }

    async fn take_out_of_service(&self, board: BoardId, reporter: &str) -> StoreResult<bool> {
        let mut w = self.inner.write().await;
        Ok(w.mark_dead(
            board,
            reporter,
            "board persistently failed blacklist access: taking out of service",
        ))
    }

    // ── Applying blacklist outcomes ──

    async fn blacklist_read_done(
        &self,
        op: OpId,
        board: BoardId,
        blacklist: &Blacklist,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.record_board_serials(board, bmp_serial, physical_serial);
        let o = w
            .ops
            .get_mut(&op)
            .ok_or_else(|| StoreError::NotFound(format!("blacklist op {op}")))?;
        o.completed = true;
        o.result = Some(blacklist.clone());
        Ok(())
    }

    async fn blacklist_write_done(&self, op: OpId) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        let o = w
            .ops
            .get_mut(&op)
            .ok_or_else(|| StoreError::NotFound(format!("blacklist op {op}")))?;
        o.completed = true;
        Ok(())
    }

    async fn serial_read_done(
        &self,
        op: OpId,
        board: BoardId,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.record_board_serials(board, bmp_serial, physical_serial);
        let o = w
            .ops
            .get_mut(&op)
            .ok_or_else(|| StoreError::NotFound(format!("blacklist op {op}")))?;
        o.completed = true;
        Ok(())
    }

    async fn blacklist_op_failed(&self, op: OpId, message: &str) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        let o = w
            .ops
            .get_mut(&op)
            .ok_or_else(|| StoreError::NotFound(format!("blacklist op {op}")))?;
        o.failure = Some(message.to_string());
        Ok(())
    }

    // ── Management / inspection ──

    async fn pending_change_count(&self) -> StoreResult<u64> {
        let r = self.inner.read().await;
        Ok(r.changes.values().filter(|c| !c.in_progress).count() as u64)
    }

    async fn board(&self, board: BoardId) -> StoreResult<Option<BoardRecord>> {
        Ok(self.inner.read().await.boards.get(&board).cloned())
    }

    async fn job_state(&self, job: JobId) -> StoreResult<Option<JobState>> {
        Ok(self.inner.read().await.jobs.get(&job).copied())
    }

    async fn board_reports(&self, board: BoardId) -> StoreResult<Vec<BoardReport>> {
        let r = self.inner.read().await;
        Ok(r.reports
            .iter()
            .filter(|rep| rep.board_id == board)
            .cloned()
            .collect())
    }
}
