use crate::epochs::{BusyJobs, BusyOps};
use crate::error::StoreResult;
use crate::model::*;
use crate::store::Store;
use std::collections::{BTreeMap, HashMap};

/// Result of one taking pass.
#[derive(Default)]
pub(crate) struct TakeOutcome {
    pub requests: Vec<Request>,
    /// A change set was finished directly in the store (it cancelled out),
    /// so the job and machine epochs want bumping.
    pub jobs_changed: bool,
}

/// Drain the store's pending work into in-memory requests: one grouped
/// PowerRequest per job with changes, one BlacklistRequest per pending op.
/// Jobs already in flight are skipped; taken jobs and ops enter the busy
/// sets before their rows leave the store, so nothing is taken twice.
pub(crate) async fn take_requests(
    store: &dyn Store,
    busy_jobs: &BusyJobs,
    busy_ops: &BusyOps,
    machines: &[MachineDesc],
) -> StoreResult<TakeOutcome> {
    let mut outcome = TakeOutcome::default();

    for machine in machines.iter().filter(|m| m.in_service) {
        for job in store.jobs_with_pending_changes(&machine.name).await? {
            if !busy_jobs.insert(job) {
                continue;
            }
            match take_power_request(store, machine, job).await? {
                Taken::Request(req) => outcome.requests.push(Request::Power(req)),
                Taken::FinishedDirectly => {
                    outcome.jobs_changed = true;
                    busy_jobs.remove(job);
                }
                Taken::Nothing => busy_jobs.remove(job),
            }
        }
    }

    for op in store.pending_blacklist_ops().await? {
        if !busy_ops.insert(op.op_id) {
            continue;
        }
        outcome.requests.push(Request::Blacklist(BlacklistRequest {
            machine: op.machine,
            op: op.op_id,
            board: op.board_id,
            bmp: op.bmp,
            board_number: op.board_number,
            kind: op.kind,
            expected_serial: op.expected_serial,
            payload: op.payload,
        }));
    }

    Ok(outcome)
}

enum Taken {
    Request(PowerRequest),
    FinishedDirectly,
    Nothing,
}

async fn take_power_request(
    store: &dyn Store,
    machine: &MachineDesc,
    job: JobId,
) -> StoreResult<Taken> {
    let rows = store.take_changes_for_job(job).await?;
    if rows.is_empty() {
        return Ok(Taken::Nothing);
    }

    let from = rows[0].from_state;
    let to = rows[0].to_state;
    let change_ids: Vec<ChangeId> = rows.iter().map(|r| r.change_id).collect();
    if rows
        .iter()
        .any(|r| r.from_state != from || r.to_state != to)
    {
        // Allocator contract violation: rows in one set must agree.
        tracing::error!(
            job,
            machine = %machine.name,
            "pending changes disagree on job state transition, failing them back"
        );
        store.power_failed(job, from, &change_ids).await?;
        return Ok(Taken::FinishedDirectly);
    }

    let mut req = PowerRequest {
        machine: machine.name.clone(),
        job,
        from,
        to,
        power_on: BTreeMap::new(),
        power_off: BTreeMap::new(),
        link_off: BTreeMap::new(),
        on_board_ids: Vec::new(),
        off_board_ids: Vec::new(),
        change_ids,
        board_at: HashMap::new(),
        ping_targets: Vec::new(),
    };

    for row in &rows {
        req.board_at.insert(
            BmpBoard {
                bmp: row.bmp,
                board: row.board_number,
            },
            row.board_id,
        );
        if row.power_on {
            // Link stops travel with the boards being brought up.
            for direction in row.links.links_off() {
                req.link_off
                    .entry(row.bmp)
                    .or_default()
                    .push((row.board_number, direction));
            }
        }
        if row.power_on == row.current_power {
            // Already in the requested state: nothing to switch.
            continue;
        }
        if row.power_on {
            req.power_on
                .entry(row.bmp)
                .or_default()
                .push(row.board_number);
            req.on_board_ids.push(row.board_id);
            if let Some(addr) = row.board_address {
                req.ping_targets.push(addr);
            }
        } else {
            req.power_off
                .entry(row.bmp)
                .or_default()
                .push(row.board_number);
            req.off_board_ids.push(row.board_id);
        }
    }

    if req.power_on.is_empty() && req.power_off.is_empty() && req.link_off.is_empty() {
        if to == JobState::Unknown {
            // Likely an allocator bug; no sensible default exists, so leave
            // the rows alone and say so.
            tracing::warn!(
                job,
                machine = %machine.name,
                "change rows with nothing to switch and unknown target state"
            );
            return Ok(Taken::Nothing);
        }
        tracing::debug!(job, state = %to, "changes cancel out, setting job state directly");
        let changed = store.finish_zero_change(job, to, &req.change_ids).await?;
        return Ok(if changed {
            Taken::FinishedDirectly
        } else {
            Taken::Nothing
        });
    }

    Ok(Taken::Request(req))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use std::collections::BTreeMap;

    async fn seeded() -> (MemoryStore, Vec<MachineDesc>, BoardId, BoardId) {
        let store = MemoryStore::new();
        let machine = MachineDesc {
            name: "spin5".to_string(),
            bmps: BTreeMap::from([(BmpCoords::ROOT, "10.0.0.1".parse().unwrap())]),
            in_service: true,
        };
        store.add_machine(machine.clone()).await;
        let b0 = store
            .add_board(
                Some(100),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 0 },
                BmpCoords::ROOT,
                3,
                Some("10.0.0.3".parse().unwrap()),
            )
            .await;
        let b1 = store
            .add_board(
                Some(101),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 1 },
                BmpCoords::ROOT,
                4,
                Some("10.0.0.4".parse().unwrap()),
            )
            .await;
        (store, vec![machine], b0, b1)
    }

    #[tokio::test]
    async fn groups_one_request_per_job() {
        let (store, machines, b0, b1) = seeded().await;
        store.add_job(42, JobState::Power).await;
        store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();
        let mut links = LinkFlags::ALL_ON;
        links.set(Direction::North, false);
        store
            .add_change(42, b1, JobState::Queued, JobState::Ready, true, links)
            .await
            .unwrap();

        let busy_jobs = BusyJobs::default();
        let busy_ops = BusyOps::default();
        let outcome = take_requests(&store, &busy_jobs, &busy_ops, &machines)
            .await
            .unwrap();

        assert_eq!(outcome.requests.len(), 1);
        let Request::Power(req) = &outcome.requests[0] else {
            panic!("expected a power request");
        };
        assert_eq!(req.job, 42);
        assert_eq!(req.from, JobState::Queued);
        assert_eq!(req.to, JobState::Ready);
        assert_eq!(req.power_on[&BmpCoords::ROOT], vec![3, 4]);
        assert!(req.power_off.is_empty());
        assert_eq!(
            req.link_off[&BmpCoords::ROOT],
            vec![(4, Direction::North)]
        );
        assert_eq!(req.on_board_ids, vec![b0, b1]);
        assert_eq!(req.change_ids.len(), 2);
        assert_eq!(req.ping_targets.len(), 2);
        assert_eq!(
            req.board_at[&BmpBoard {
                bmp: BmpCoords::ROOT,
                board: 3
            }],
            b0
        );
        // The job is now busy and its rows are in progress.
        assert!(busy_jobs.contains(42));
        assert!(store
            .change_rows_for_job(42)
            .await
            .iter()
            .all(|c| c.in_progress));
    }

    #[tokio::test]
    async fn busy_jobs_are_skipped() {
        let (store, machines, b0, _) = seeded().await;
        store.add_job(42, JobState::Power).await;
        store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let busy_jobs = BusyJobs::default();
        busy_jobs.insert(42);
        let outcome = take_requests(&store, &busy_jobs, &BusyOps::default(), &machines)
            .await
            .unwrap();
        assert!(outcome.requests.is_empty());
        // Rows untouched for a busy job.
        assert!(store
            .change_rows_for_job(42)
            .await
            .iter()
            .all(|c| !c.in_progress));
    }

    #[tokio::test]
    async fn cancelling_changes_finish_directly() {
        let (store, machines, b0, _) = seeded().await;
        store.add_job(42, JobState::Power).await;
        // Board is already off; asking for off has nothing to switch.
        store
            .add_change(42, b0, JobState::Ready, JobState::Destroyed, false, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let busy_jobs = BusyJobs::default();
        let outcome = take_requests(&store, &busy_jobs, &BusyOps::default(), &machines)
            .await
            .unwrap();

        assert!(outcome.requests.is_empty());
        assert!(outcome.jobs_changed);
        assert_eq!(
            store.job_state(42).await.unwrap(),
            Some(JobState::Destroyed)
        );
        assert!(store.change_rows_for_job(42).await.is_empty());
        assert!(!busy_jobs.contains(42));
    }

    #[tokio::test]
    async fn unknown_target_with_nothing_to_switch_is_left_alone() {
        let (store, machines, b0, _) = seeded().await;
        store.add_job(42, JobState::Power).await;
        store
            .add_change(42, b0, JobState::Power, JobState::Unknown, false, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let busy_jobs = BusyJobs::default();
        let outcome = take_requests(&store, &busy_jobs, &BusyOps::default(), &machines)
            .await
            .unwrap();

        assert!(outcome.requests.is_empty());
        assert!(!outcome.jobs_changed);
        assert_eq!(store.job_state(42).await.unwrap(), Some(JobState::Power));
        assert!(!busy_jobs.contains(42));
    }

    #[tokio::test]
    async fn disagreeing_transitions_fail_back() {
        let (store, machines, b0, b1) = seeded().await;
        store.add_job(42, JobState::Power).await;
        store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();
        store
            .add_change(42, b1, JobState::Ready, JobState::Destroyed, false, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let outcome = take_requests(
            &store,
            &BusyJobs::default(),
            &BusyOps::default(),
            &machines,
        )
        .await
        .unwrap();

        assert!(outcome.requests.is_empty());
        // Rolled back to the first row's from-state, rows kept.
        assert_eq!(store.job_state(42).await.unwrap(), Some(JobState::Queued));
        let rows = store.change_rows_for_job(42).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|c| !c.in_progress));
    }

    #[tokio::test]
    async fn out_of_service_machines_are_ignored() {
        let (store, mut machines, b0, _) = seeded().await;
        machines[0].in_service = false;
        store.add_job(42, JobState::Power).await;
        store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let outcome = take_requests(
            &store,
            &BusyJobs::default(),
            &BusyOps::default(),
            &machines,
        )
        .await
        .unwrap();
        assert!(outcome.requests.is_empty());
    }

    #[tokio::test]
    async fn blacklist_ops_become_requests_once() {
        let (store, machines, b0, _) = seeded().await;
        store.set_bmp_serial(b0, "SN-3").await;
        let op = store
            .add_blacklist_op(b0, BlacklistOpKind::ReadBlacklist, None)
            .await
            .unwrap();

        let busy_ops = BusyOps::default();
        let outcome = take_requests(&store, &BusyJobs::default(), &busy_ops, &machines)
            .await
            .unwrap();
        assert_eq!(outcome.requests.len(), 1);
        let Request::Blacklist(req) = &outcome.requests[0] else {
            panic!("expected a blacklist request");
        };
        assert_eq!(req.op, op);
        assert_eq!(req.kind, BlacklistOpKind::ReadBlacklist);
        assert_eq!(req.expected_serial.as_deref(), Some("SN-3"));

        // Second pass: the op is busy, nothing is taken again.
        let again = take_requests(&store, &BusyJobs::default(), &busy_ops, &machines)
            .await
            .unwrap();
        assert!(again.requests.is_empty());
    }
}
