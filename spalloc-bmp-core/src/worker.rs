use crate::cleanup::{Completion, CompletionQueues};
use crate::config::BmpConfig;
use crate::driver::BmpDriver;
use crate::error::HardwareError;
use crate::model::*;
use crate::ping::ping;
use crate::txrx::{HwResult, Transceiver, TransceiverFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;

/// Everything a worker task borrows from the controller context.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub cfg: Arc<BmpConfig>,
    pub factory: Arc<TransceiverFactory>,
    pub queues: Arc<CompletionQueues>,
    /// Last classified hardware error, kept for the test API.
    pub last_error: Arc<StdMutex<Option<HardwareError>>>,
    pub stop: watch::Receiver<bool>,
}

/// Controller-side handle to one machine's worker.
pub(crate) struct WorkerHandle {
    tx: Option<mpsc::UnboundedSender<Request>>,
    depth: Arc<AtomicUsize>,
    pub(crate) join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Current FIFO depth (requests queued, not yet picked up).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn submit(&self, req: Request) {
        let Some(tx) = &self.tx else {
            tracing::warn!(machine = req.machine(), "worker already closed, dropping request");
            return;
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        if tx.send(req).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("worker channel closed, dropping request");
        }
    }

    /// Close the FIFO; the worker exits once it has drained or is stopped.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Spawn the long-lived worker task for one machine.
pub(crate) fn spawn(shared: WorkerShared, machine: MachineDesc) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let join = tokio::spawn(run(shared, machine, rx, depth.clone()));
    WorkerHandle {
        tx: Some(tx),
        depth,
        join,
    }
}

async fn run(
    shared: WorkerShared,
    machine: MachineDesc,
    mut rx: mpsc::UnboundedReceiver<Request>,
    depth: Arc<AtomicUsize>,
) {
    tracing::info!(machine = %machine.name, "BMP worker started");
    let mut stop = shared.stop.clone();
    loop {
        let req = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => req,
                // FIFO closed and drained: orderly exit.
                None => break,
            },
            _ = stopped(&mut stop) => break,
        };
        depth.fetch_sub(1, Ordering::AcqRel);
        if process(&shared, &machine, req, &mut stop).await == Flow::Stopped {
            break;
        }
    }
    tracing::info!(machine = %machine.name, "BMP worker exiting");
}

/// Resolves when the stop flag is raised (or its sender is gone).
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

/// Drive one request through the retry contract.
async fn process(
    shared: &WorkerShared,
    machine: &MachineDesc,
    req: Request,
    stop: &mut watch::Receiver<bool>,
) -> Flow {
    // The controller pre-warmed the cache, so these are ordinarily hits.
    let mut ctrls: HashMap<BmpCoords, Arc<dyn Transceiver>> = HashMap::new();
    for bmp in req.bmps() {
        match shared.factory.transceiver(machine, bmp).await {
            Ok(txrx) => {
                ctrls.insert(bmp, txrx);
            }
            Err(e) => {
                tracing::warn!(
                    machine = %machine.name, %bmp, error = %e,
                    "no transceiver for request, failing it"
                );
                remember_error(shared, &e);
                record_failure(shared, &req, &e);
                return Flow::Continue;
            }
        }
    }

    let mut attempts = 0;
    loop {
        match bmp_action(shared, &req, &ctrls, &mut attempts).await {
            ActionOutcome::Done => return Flow::Continue,
            ActionOutcome::Retry => {
                tokio::select! {
                    _ = sleep(shared.cfg.probe_interval()) => {}
                    _ = stopped(stop) => {
                        let e = HardwareError::Io("interrupted by shutdown".to_string());
                        record_failure(shared, &req, &e);
                        return Flow::Stopped;
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ActionOutcome {
    Done,
    Retry,
}

/// One attempt at a request plus failure classification: the shared retry
/// contract for both request kinds. Success and final failure both enqueue
/// completions; only a transient failure with attempts remaining asks the
/// caller to come back.
pub(crate) async fn bmp_action(
    shared: &WorkerShared,
    req: &Request,
    ctrls: &HashMap<BmpCoords, Arc<dyn Transceiver>>,
    attempts: &mut u32,
) -> ActionOutcome {
    *attempts += 1;
    let result = match req {
        Request::Power(p) => perform_power(shared, p, ctrls).await,
        Request::Blacklist(b) => perform_blacklist(shared, b, ctrls).await,
    };
    let err = match result {
        Ok(()) => return ActionOutcome::Done,
        Err(e) => e,
    };
    remember_error(shared, &err);

    match &err {
        HardwareError::Transient(_) if *attempts < shared.cfg.power_attempts => {
            tracing::info!(
                machine = req.machine(), attempt = *attempts, error = %err,
                "transient BMP failure, will retry"
            );
            ActionOutcome::Retry
        }
        HardwareError::Transient(_) => {
            tracing::warn!(
                machine = req.machine(), attempts = *attempts, error = %err,
                "transient BMP failure on final attempt, giving up"
            );
            record_failure(shared, req, &err);
            ActionOutcome::Done
        }
        HardwareError::Permanent { at } => {
            tracing::error!(machine = req.machine(), core = %at, "permanent BMP failure");
            record_failure(shared, req, &err);
            match req {
                Request::Power(p) if p.to == JobState::Ready && !p.is_power_off_only() => {
                    match p.board_at.get(at) {
                        Some(&board) => shared.queues.push(Completion::QuarantineBoard {
                            machine: p.machine.clone(),
                            job: p.job,
                            board,
                        }),
                        None => tracing::error!(
                            machine = %p.machine, core = %at,
                            "permanent failure at a board outside the request"
                        ),
                    }
                }
                Request::Power(_) => {}
                Request::Blacklist(b) => shared.queues.push(Completion::TakeOutOfService {
                    machine: b.machine.clone(),
                    board: b.board,
                }),
            }
            ActionOutcome::Done
        }
        HardwareError::CallerBug(_) | HardwareError::Io(_) => {
            tracing::error!(machine = req.machine(), error = %err, "BMP request failed");
            record_failure(shared, req, &err);
            ActionOutcome::Done
        }
    }
}

fn remember_error(shared: &WorkerShared, err: &HardwareError) {
    *shared
        .last_error
        .lock()
        .expect("last-error slot poisoned") = Some(err.clone());
}

fn record_failure(shared: &WorkerShared, req: &Request, err: &HardwareError) {
    match req {
        Request::Power(p) => shared.queues.push(Completion::PowerFailed {
            job: p.job,
            from: p.from,
            changes: p.change_ids.clone(),
        }),
        Request::Blacklist(b) => shared.queues.push(Completion::BlacklistFailed {
            op: b.op,
            message: err.to_string(),
        }),
    }
}

fn driver_for(
    shared: &WorkerShared,
    machine: &str,
    bmp: BmpCoords,
    ctrls: &HashMap<BmpCoords, Arc<dyn Transceiver>>,
) -> HwResult<BmpDriver> {
    let txrx = ctrls
        .get(&bmp)
        .ok_or_else(|| HardwareError::Io(format!("no transceiver for {bmp}")))?;
    Ok(BmpDriver::new(machine, bmp, txrx.clone(), &shared.cfg))
}

/// Execute a power request. Per BMP the order is fixed: power on, stop
/// perimeter links, power off.
async fn perform_power(
    shared: &WorkerShared,
    p: &PowerRequest,
    ctrls: &HashMap<BmpCoords, Arc<dyn Transceiver>>,
) -> HwResult<()> {
    for (bmp, boards) in &p.power_on {
        driver_for(shared, &p.machine, *bmp, ctrls)?
            .power_on_and_check(boards)
            .await?;
    }

    // Prime ARP caches along the path to the freshly powered boards. This
    // is best-effort: a lost ping never fails the request.
    if !p.ping_targets.is_empty() {
        let mut pings = JoinSet::new();
        for addr in p.ping_targets.iter().copied() {
            pings.spawn(async move { (addr, ping(addr).await) });
        }
        while let Some(joined) = pings.join_next().await {
            if let Ok((addr, reachable)) = joined {
                if !reachable {
                    tracing::debug!(%addr, "ARP priming ping got no answer");
                }
            }
        }
    }

    for (bmp, links) in &p.link_off {
        let driver = driver_for(shared, &p.machine, *bmp, ctrls)?;
        for (board, direction) in links {
            driver.set_link_off(*board, *direction).await?;
        }
    }
    for (bmp, boards) in &p.power_off {
        driver_for(shared, &p.machine, *bmp, ctrls)?
            .power_off(boards)
            .await?;
    }

    shared.queues.push(Completion::PowerDone {
        job: p.job,
        to: p.to,
        on_boards: p.on_board_ids.clone(),
        off_boards: p.off_board_ids.clone(),
        changes: p.change_ids.clone(),
    });
    Ok(())
}

/// Execute one blacklist operation.
async fn perform_blacklist(
    shared: &WorkerShared,
    b: &BlacklistRequest,
    ctrls: &HashMap<BmpCoords, Arc<dyn Transceiver>>,
) -> HwResult<()> {
    let driver = driver_for(shared, &b.machine, b.bmp, ctrls)?;
    match b.kind {
        BlacklistOpKind::ReadBlacklist => {
            let (blacklist, serial) = driver
                .read_blacklist(b.board_number, b.expected_serial.as_deref())
                .await?;
            shared.queues.push(Completion::BlacklistRead {
                op: b.op,
                board: b.board,
                blacklist,
                bmp_serial: serial,
            });
        }
        BlacklistOpKind::WriteBlacklist => {
            let payload = b.payload.as_ref().ok_or_else(|| {
                HardwareError::CallerBug(format!("blacklist write op {} has no payload", b.op))
            })?;
            let expected = b.expected_serial.as_deref().ok_or_else(|| {
                HardwareError::CallerBug(format!(
                    "blacklist write op {} has no expected serial",
                    b.op
                ))
            })?;
            driver
                .write_blacklist(b.board_number, expected, payload)
                .await?;
            shared.queues.push(Completion::BlacklistWritten { op: b.op });
        }
        BlacklistOpKind::GetSerial => {
            let serial = driver.read_serial(b.board_number).await?;
            shared.queues.push(Completion::SerialRead {
                op: b.op,
                board: b.board,
                bmp_serial: serial,
            });
        }
    }
    Ok(())
}
