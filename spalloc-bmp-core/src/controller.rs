use crate::cleanup::{self, Completion, CompletionQueues};
use crate::config::BmpConfig;
use crate::epochs::{BusyJobs, BusyOps, Epochs};
use crate::error::{HardwareError, StoreError, StoreResult};
use crate::model::*;
use crate::report::{EmailSender, SerialMapper};
use crate::store::Store;
use crate::taker;
use crate::txrx::{Connector, TransceiverFactory};
use crate::worker::{self, WorkerHandle, WorkerShared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

struct Ctx {
    cfg: Arc<BmpConfig>,
    store: Arc<dyn Store>,
    factory: Arc<TransceiverFactory>,
    busy_jobs: BusyJobs,
    busy_ops: BusyOps,
    queues: Arc<CompletionQueues>,
    epochs: Epochs,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    paused: AtomicBool,
    email: Arc<dyn EmailSender>,
    serials: Arc<dyn SerialMapper>,
    last_error: Arc<StdMutex<Option<HardwareError>>>,
}

/// The process-wide BMP controller: owns the tick loop, the busy sets, the
/// worker registry, the transceiver cache and the deferred-work queues.
/// Everything the surrounding service needs goes through this handle.
pub struct BmpController {
    ctx: Arc<Ctx>,
    tick_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BmpController {
    /// Build the controller. Clears `in_progress` markers a crashed
    /// previous run may have left so that work is taken again.
    pub async fn new(
        cfg: BmpConfig,
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        email: Arc<dyn EmailSender>,
        serials: Arc<dyn SerialMapper>,
    ) -> StoreResult<Self> {
        let stale = store.clear_stale_in_progress().await?;
        if stale > 0 {
            tracing::warn!(rows = stale, "cleared stale in-progress changes from previous run");
        }
        let cfg = Arc::new(cfg);
        let factory = Arc::new(TransceiverFactory::new(&cfg, connector));
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(Ctx {
                cfg,
                store,
                factory,
                busy_jobs: BusyJobs::default(),
                busy_ops: BusyOps::default(),
                queues: Arc::new(CompletionQueues::default()),
                epochs: Epochs::default(),
                workers: Mutex::new(HashMap::new()),
                stop_tx,
                stop_rx,
                paused: AtomicBool::new(false),
                email,
                serials,
                last_error: Arc::new(StdMutex::new(None)),
            }),
            tick_task: StdMutex::new(None),
        })
    }

    /// Start the periodic tick. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut slot = self.tick_task.lock().expect("tick slot poisoned");
        if slot.is_some() {
            return;
        }
        let ctx = self.ctx.clone();
        *slot = Some(tokio::spawn(run_ticks(ctx)));
    }

    /// One controller cycle: apply queued outcomes, take new work, dispatch
    /// it. This is also the test hook; note that a request taken in cycle N
    /// has its outcome applied in cycle N+1, so tests drive two cycles with
    /// a pause between them.
    pub async fn process_requests_once(&self) -> StoreResult<()> {
        process_once(&self.ctx).await
    }

    pub fn pause(&self) {
        self.ctx.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.ctx.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.paused.load(Ordering::Acquire)
    }

    /// Switch between real and stub transceivers at runtime.
    pub async fn set_use_dummy(&self, on: bool) {
        self.ctx.factory.set_use_dummy(on).await;
    }

    pub fn epochs(&self) -> &Epochs {
        &self.ctx.epochs
    }

    /// Operator counter: change rows waiting in the store.
    pub async fn pending_request_count(&self) -> StoreResult<u64> {
        self.ctx.store.pending_change_count().await
    }

    /// Operator counter: requests sitting in worker FIFOs.
    pub async fn active_request_count(&self) -> usize {
        let workers = self.ctx.workers.lock().await;
        workers.values().map(|w| w.depth()).sum()
    }

    /// Completions recorded but not yet applied to the store.
    pub fn queued_completions(&self) -> usize {
        self.ctx.queues.pending()
    }

    /// Last classified hardware error, for the test API.
    pub fn last_hardware_error(&self) -> Option<HardwareError> {
        self.ctx
            .last_error
            .lock()
            .expect("last-error slot poisoned")
            .clone()
    }

    /// Stop everything: raise the stop flag, close and join every worker
    /// under a bounded timeout, apply the completions they left behind,
    /// and close the cached transceivers.
    pub async fn shutdown(&self) -> StoreResult<()> {
        tracing::info!("BMP controller shutting down");
        let _ = self.ctx.stop_tx.send(true);

        if let Some(tick) = self.tick_task.lock().expect("tick slot poisoned").take() {
            let _ = tick.await;
        }

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.ctx.workers.lock().await;
            workers.drain().map(|(_, h)| h).collect()
        };
        let join_timeout = self.ctx.cfg.probe_interval();
        for mut handle in handles {
            handle.close();
            if timeout(join_timeout, &mut handle.join).await.is_err() {
                tracing::warn!("worker stuck in BMP I/O past join timeout, aborting it");
                handle.join.abort();
            }
        }

        // Workers are gone; apply whatever they managed to record.
        drain_completions(&self.ctx).await?;

        self.ctx.factory.shutdown().await;
        tracing::info!("BMP controller stopped");
        Ok(())
    }

    /// Live transceiver count (drained to zero by `shutdown`).
    pub async fn open_transceivers(&self) -> usize {
        self.ctx.factory.open_count().await
    }
}

async fn run_ticks(ctx: Arc<Ctx>) {
    let mut ticker = interval(ctx.cfg.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stop = ctx.stop_rx.clone();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = worker::stopped(&mut stop) => break,
        }
        match process_once(&ctx).await {
            Ok(()) => {}
            Err(StoreError::Busy) => {
                tracing::debug!("store busy, skipping this tick");
            }
            Err(e) => {
                tracing::error!(error = %e, "BMP controller tick failed");
            }
        }
    }
}

async fn drain_completions(ctx: &Ctx) -> StoreResult<()> {
    cleanup::drain(
        &ctx.queues,
        ctx.store.as_ref(),
        &ctx.busy_jobs,
        &ctx.busy_ops,
        &ctx.epochs,
        ctx.email.as_ref(),
        ctx.serials.as_ref(),
        &ctx.cfg.system_report_user,
    )
    .await
}

async fn process_once(ctx: &Ctx) -> StoreResult<()> {
    if ctx.paused.load(Ordering::Acquire) {
        return Ok(());
    }

    // Outcomes first: their store mutations release busy jobs and epochs
    // before any new work is taken.
    drain_completions(ctx).await?;

    let machines = ctx.store.machines().await?;
    let outcome = taker::take_requests(
        ctx.store.as_ref(),
        &ctx.busy_jobs,
        &ctx.busy_ops,
        &machines,
    )
    .await?;
    if outcome.jobs_changed {
        ctx.epochs.jobs.bump();
        ctx.epochs.machine.bump();
    }

    if outcome.requests.is_empty() {
        return Ok(());
    }

    let by_name: HashMap<&str, &MachineDesc> =
        machines.iter().map(|m| (m.name.as_str(), m)).collect();

    for req in outcome.requests {
        let Some(machine) = by_name.get(req.machine()).copied() else {
            tracing::error!(machine = req.machine(), "request for unknown machine");
            fail_undispatched(ctx, &req, "machine vanished from configuration");
            continue;
        };

        // Materialise the transceivers here, on the controller task, so a
        // worker only ever sees warm cache hits.
        let mut dispatchable = true;
        for bmp in req.bmps() {
            if let Err(e) = ctx.factory.transceiver(machine, bmp).await {
                tracing::warn!(
                    machine = %machine.name, %bmp, error = %e,
                    "cannot reach BMP, failing request without dispatch"
                );
                *ctx.last_error.lock().expect("last-error slot poisoned") = Some(e.clone());
                fail_undispatched(ctx, &req, &e.to_string());
                dispatchable = false;
                break;
            }
        }
        if !dispatchable {
            continue;
        }

        let mut workers = ctx.workers.lock().await;
        let handle = workers
            .entry(machine.name.clone())
            .or_insert_with(|| worker::spawn(worker_shared(ctx), machine.clone()));
        handle.submit(req);
    }

    Ok(())
}

fn worker_shared(ctx: &Ctx) -> WorkerShared {
    WorkerShared {
        cfg: ctx.cfg.clone(),
        factory: ctx.factory.clone(),
        queues: ctx.queues.clone(),
        last_error: ctx.last_error.clone(),
        stop: ctx.stop_rx.clone(),
    }
}

/// A request that never reached a worker still needs its failure recorded,
/// or its job/op would stay busy forever.
fn fail_undispatched(ctx: &Ctx, req: &Request, message: &str) {
    match req {
        Request::Power(p) => ctx.queues.push(Completion::PowerFailed {
            job: p.job,
            from: p.from,
            changes: p.change_ids.clone(),
        }),
        Request::Blacklist(b) => ctx.queues.push(Completion::BlacklistFailed {
            op: b.op,
            message: message.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{LogOnlyEmailSender, StaticSerialMapper};
    use crate::store_memory::MemoryStore;
    use crate::txrx::{DummyConnector, DummyTransceiver, HwResult, Transceiver};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    // ── Test doubles ──

    /// Connector handing out one shared transceiver, so tests can script
    /// and inspect the hardware side.
    struct SharedConnector(Arc<dyn Transceiver>);

    #[async_trait]
    impl Connector for SharedConnector {
        async fn connect(
            &self,
            _machine: &MachineDesc,
            _bmp: BmpCoords,
        ) -> HwResult<Arc<dyn Transceiver>> {
            Ok(self.0.clone())
        }
    }

    /// Transceiver that fails `power_on` a scripted number of times.
    struct FlakyPowerTxrx {
        inner: DummyTransceiver,
        failures: AtomicU32,
        error: HardwareError,
        power_on_calls: AtomicU32,
    }

    impl FlakyPowerTxrx {
        fn new(failures: u32, error: HardwareError) -> Self {
            Self {
                inner: DummyTransceiver::new(),
                failures: AtomicU32::new(failures),
                error,
                power_on_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transceiver for FlakyPowerTxrx {
        async fn power_on(&self, boards: &[BoardNumber]) -> HwResult<()> {
            self.power_on_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.power_on(boards).await
        }
        async fn power_off(&self, boards: &[BoardNumber]) -> HwResult<()> {
            self.inner.power_off(boards).await
        }
        async fn read_fpga_register(
            &self,
            board: BoardNumber,
            fpga: FpgaId,
            bank: u32,
            addr: u32,
        ) -> HwResult<u32> {
            self.inner.read_fpga_register(board, fpga, bank, addr).await
        }
        async fn write_fpga_register(
            &self,
            board: BoardNumber,
            fpga: FpgaId,
            bank: u32,
            addr: u32,
            value: u32,
        ) -> HwResult<()> {
            self.inner
                .write_fpga_register(board, fpga, bank, addr, value)
                .await
        }
        async fn read_serial(&self, board: BoardNumber) -> HwResult<String> {
            self.inner.read_serial(board).await
        }
        async fn read_blacklist(&self, board: BoardNumber) -> HwResult<Blacklist> {
            self.inner.read_blacklist(board).await
        }
        async fn write_blacklist(
            &self,
            board: BoardNumber,
            blacklist: &Blacklist,
        ) -> HwResult<()> {
            self.inner.write_blacklist(board, blacklist).await
        }
        async fn firmware_version(&self) -> HwResult<FirmwareVersion> {
            self.inner.firmware_version().await
        }
        async fn load_fpga_firmware(&self, boards: &[BoardNumber]) -> HwResult<()> {
            self.inner.load_fpga_firmware(boards).await
        }
        async fn close(&self) {}
    }

    /// Email sink that counts what it was asked to send.
    #[derive(Default)]
    struct CountingEmail {
        sent: AtomicU32,
    }

    #[async_trait]
    impl crate::report::EmailSender for CountingEmail {
        async fn send(&self, _subject: &str, _body: &str) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ── Rig ──

    struct Rig {
        store: Arc<MemoryStore>,
        controller: BmpController,
        email: Arc<CountingEmail>,
    }

    async fn rig_with(cfg: BmpConfig, connector: Arc<dyn Connector>) -> Rig {
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(MachineDesc {
                name: "spin5".to_string(),
                bmps: BTreeMap::from([(BmpCoords::ROOT, "10.11.12.1".parse().unwrap())]),
                in_service: true,
            })
            .await;
        let email = Arc::new(CountingEmail::default());
        let serials = Arc::new(StaticSerialMapper::new(
            [("SN-100".to_string(), "PHYS-100".to_string())]
                .into_iter()
                .collect(),
        ));
        let controller = BmpController::new(
            cfg,
            store.clone(),
            connector,
            email.clone(),
            serials,
        )
        .await
        .unwrap();
        Rig {
            store,
            controller,
            email,
        }
    }

    async fn rig() -> Rig {
        let cfg = BmpConfig {
            use_dummy_bmp: true,
            ..BmpConfig::default()
        };
        rig_with(cfg, Arc::new(DummyConnector)).await
    }

    /// Seed boards 100 (BMP 0,0 board 3) and 101 (BMP 0,0 board 4).
    /// No addresses: these tests must not spawn real ARP-priming pings.
    async fn seed_boards(store: &MemoryStore) -> (BoardId, BoardId) {
        let b0 = store
            .add_board(
                Some(100),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 0 },
                BmpCoords::ROOT,
                3,
                None,
            )
            .await;
        let b1 = store
            .add_board(
                Some(101),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 1 },
                BmpCoords::ROOT,
                4,
                None,
            )
            .await;
        (b0, b1)
    }

    /// Run the two-cycle pattern: cycle one takes and dispatches, cycle two
    /// applies what the workers recorded.
    async fn two_cycles(controller: &BmpController) {
        controller.process_requests_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.process_requests_once().await.unwrap();
    }

    // ── S1: power on a two-board job ──

    #[tokio::test(start_paused = true)]
    async fn s1_power_on_two_board_job() {
        let rig = rig().await;
        let (b0, b1) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        rig.store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();
        rig.store
            .add_change(42, b1, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let jobs_before = rig.controller.epochs().jobs.current();
        let machine_before = rig.controller.epochs().machine.current();

        two_cycles(&rig.controller).await;

        assert!(rig.store.board(b0).await.unwrap().unwrap().power);
        assert!(rig.store.board(b1).await.unwrap().unwrap().power);
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Ready)
        );
        assert!(rig.store.change_rows_for_job(42).await.is_empty());
        assert_eq!(rig.controller.epochs().jobs.current(), jobs_before + 1);
        assert_eq!(
            rig.controller.epochs().machine.current(),
            machine_before + 1
        );
        assert_eq!(rig.controller.queued_completions(), 0);
        rig.controller.shutdown().await.unwrap();
    }

    // ── S2: power off three boards, job destroyed ──

    #[tokio::test(start_paused = true)]
    async fn s2_power_off_destroys_job() {
        let rig = rig().await;
        let (b0, b1) = seed_boards(&rig.store).await;
        let b2 = rig
            .store
            .add_board(
                Some(102),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 2 },
                BmpCoords::ROOT,
                5,
                None,
            )
            .await;
        rig.store.add_job(42, JobState::Ready).await;
        rig.store.allocate(42, &[b0, b1, b2]).await;
        for b in [b0, b1, b2] {
            rig.store.set_board_power(b, true).await;
            rig.store
                .add_change(42, b, JobState::Ready, JobState::Destroyed, false, LinkFlags::ALL_ON)
                .await
                .unwrap();
        }

        two_cycles(&rig.controller).await;

        for b in [b0, b1, b2] {
            let rec = rig.store.board(b).await.unwrap().unwrap();
            assert!(!rec.power, "board {b} still powered");
            assert_eq!(rec.allocated_to, None);
        }
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Destroyed)
        );
        assert!(rig.store.change_rows_for_job(42).await.is_empty());
        rig.controller.shutdown().await.unwrap();
    }

    // ── S3: transient failure then recovery ──

    #[tokio::test(start_paused = true)]
    async fn s3_transient_then_recover() {
        let txrx = Arc::new(FlakyPowerTxrx::new(
            1,
            HardwareError::Transient("BMP timeout".into()),
        ));
        let cfg = BmpConfig {
            power_attempts: 3,
            probe_interval_ms: 100,
            ..BmpConfig::default()
        };
        let rig = rig_with(cfg, Arc::new(SharedConnector(txrx.clone()))).await;
        let (b0, b1) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        for b in [b0, b1] {
            rig.store
                .add_change(42, b, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
                .await
                .unwrap();
        }

        two_cycles(&rig.controller).await;

        // Two hardware attempts: one failed, one clean.
        assert_eq!(txrx.power_on_calls.load(Ordering::SeqCst), 2);
        assert!(rig.store.board(b0).await.unwrap().unwrap().functioning);
        assert!(rig.store.board(b0).await.unwrap().unwrap().power);
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Ready)
        );
        assert_eq!(rig.email.sent.load(Ordering::SeqCst), 0);
        rig.controller.shutdown().await.unwrap();
    }

    // ── S4: permanent failure on the way to READY ──

    #[tokio::test(start_paused = true)]
    async fn s4_permanent_failure_quarantines() {
        let txrx = Arc::new(FlakyPowerTxrx::new(
            u32::MAX,
            HardwareError::Permanent {
                at: BmpBoard {
                    bmp: BmpCoords::ROOT,
                    board: 3,
                },
            },
        ));
        let rig = rig_with(BmpConfig::default(), Arc::new(SharedConnector(txrx))).await;
        let (b0, b1) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        rig.store.allocate(42, &[b0, b1]).await;
        for b in [b0, b1] {
            rig.store
                .add_change(42, b, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
                .await
                .unwrap();
        }

        two_cycles(&rig.controller).await;

        let rec = rig.store.board(b0).await.unwrap().unwrap();
        assert!(!rec.functioning, "board 100 should be quarantined");
        assert_eq!(rec.allocated_to, None);
        // Only the addressed board is marked dead.
        assert!(rig.store.board(b1).await.unwrap().unwrap().functioning);
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Queued)
        );
        assert!(rig.store.change_rows_for_job(42).await.is_empty());
        let reports = rig.store.board_reports(b0).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reporter, "bmp-controller");
        assert_eq!(rig.email.sent.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rig.controller.last_hardware_error(),
            Some(HardwareError::Permanent { .. })
        ));
        rig.controller.shutdown().await.unwrap();
    }

    // ── S5: blacklist read with matching serial ──

    #[tokio::test(start_paused = true)]
    async fn s5_blacklist_read() {
        let txrx = Arc::new(DummyTransceiver::new());
        txrx.set_serial(3, "SN-100");
        let mut expected = Blacklist::default();
        expected.chips.insert(ChipLocation { x: 2, y: 5 });
        txrx.set_blacklist(3, expected.clone());

        let rig = rig_with(
            BmpConfig::default(),
            Arc::new(SharedConnector(txrx.clone())),
        )
        .await;
        let (b0, _) = seed_boards(&rig.store).await;
        rig.store.set_bmp_serial(b0, "SN-100").await;
        let op = rig
            .store
            .add_blacklist_op(b0, BlacklistOpKind::ReadBlacklist, None)
            .await
            .unwrap();

        let blacklist_before = rig.controller.epochs().blacklist.current();
        two_cycles(&rig.controller).await;

        let stored = rig.store.blacklist_op(op).await.unwrap();
        assert!(stored.completed);
        assert_eq!(stored.result, Some(expected));
        let rec = rig.store.board(b0).await.unwrap().unwrap();
        assert_eq!(rec.bmp_serial.as_deref(), Some("SN-100"));
        assert_eq!(rec.physical_serial.as_deref(), Some("PHYS-100"));
        assert_eq!(
            rig.controller.epochs().blacklist.current(),
            blacklist_before + 1
        );
        rig.controller.shutdown().await.unwrap();
    }

    // ── S6: blacklist write refused on serial mismatch ──

    #[tokio::test(start_paused = true)]
    async fn s6_blacklist_write_serial_mismatch() {
        let txrx = Arc::new(DummyTransceiver::new());
        txrx.set_serial(3, "XYZ");

        let rig = rig_with(
            BmpConfig::default(),
            Arc::new(SharedConnector(txrx.clone())),
        )
        .await;
        let (b0, _) = seed_boards(&rig.store).await;
        rig.store.set_bmp_serial(b0, "ABC").await;
        let mut payload = Blacklist::default();
        payload.chips.insert(ChipLocation { x: 1, y: 1 });
        let op = rig
            .store
            .add_blacklist_op(b0, BlacklistOpKind::WriteBlacklist, Some(payload))
            .await
            .unwrap();

        two_cycles(&rig.controller).await;

        let stored = rig.store.blacklist_op(op).await.unwrap();
        assert!(!stored.completed);
        assert!(stored
            .failure
            .as_deref()
            .unwrap()
            .contains("aborting blacklist write"));
        // The write never reached the hardware.
        assert!(txrx.read_blacklist(3).await.unwrap().is_empty());
        rig.controller.shutdown().await.unwrap();
    }

    // ── Pause, counters, startup recovery, shutdown ──

    #[tokio::test(start_paused = true)]
    async fn paused_controller_takes_nothing() {
        let rig = rig().await;
        let (b0, _) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        rig.store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        rig.controller.pause();
        two_cycles(&rig.controller).await;
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Power)
        );
        assert_eq!(rig.controller.pending_request_count().await.unwrap(), 1);

        rig.controller.resume();
        two_cycles(&rig.controller).await;
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Ready)
        );
        rig.controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn startup_clears_stale_in_progress() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(MachineDesc {
                name: "spin5".to_string(),
                bmps: BTreeMap::from([(BmpCoords::ROOT, "10.11.12.1".parse().unwrap())]),
                in_service: true,
            })
            .await;
        let b0 = store
            .add_board(
                Some(100),
                "spin5",
                TriadCoords { x: 0, y: 0, z: 0 },
                BmpCoords::ROOT,
                3,
                None,
            )
            .await;
        store.add_job(7, JobState::Power).await;
        store
            .add_change(7, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();
        // Simulate a crash mid-flight.
        store.take_changes_for_job(7).await.unwrap();

        let cfg = BmpConfig {
            use_dummy_bmp: true,
            ..BmpConfig::default()
        };
        let controller = BmpController::new(
            cfg,
            store.clone(),
            Arc::new(DummyConnector),
            Arc::new(LogOnlyEmailSender),
            Arc::new(StaticSerialMapper::default()),
        )
        .await
        .unwrap();

        // The change is pending again and gets processed normally.
        assert_eq!(controller.pending_request_count().await.unwrap(), 1);
        controller.process_requests_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.process_requests_once().await.unwrap();
        assert_eq!(store.job_state(7).await.unwrap(), Some(JobState::Ready));
        controller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_nothing_open() {
        let rig = rig().await;
        let (b0, _) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        rig.store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        rig.controller.process_requests_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        rig.controller.shutdown().await.unwrap();

        // Every completion enqueued before the stop flag was applied.
        assert_eq!(rig.controller.queued_completions(), 0);
        assert_eq!(rig.controller.open_transceivers().await, 0);
        assert_eq!(rig.controller.active_request_count().await, 0);
        assert_eq!(
            rig.store.job_state(42).await.unwrap(),
            Some(JobState::Ready)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tick_drives_work_without_manual_cycles() {
        let cfg = BmpConfig {
            use_dummy_bmp: true,
            period_ms: 50,
            ..BmpConfig::default()
        };
        let rig = rig_with(cfg, Arc::new(DummyConnector)).await;
        let (b0, _) = seed_boards(&rig.store).await;
        rig.store.add_job(42, JobState::Power).await;
        rig.store
            .add_change(42, b0, JobState::Queued, JobState::Ready, true, LinkFlags::ALL_ON)
            .await
            .unwrap();

        let snapshot = rig.controller.epochs().jobs.current();
        rig.controller.start();
        assert!(
            rig.controller
                .epochs()
                .jobs
                .wait_newer(snapshot, Duration::from_secs(30))
                .await
        );
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if rig.store.job_state(42).await.unwrap() == Some(JobState::Ready) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tick loop never applied the change");
        rig.controller.shutdown().await.unwrap();
    }
}
