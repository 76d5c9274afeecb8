use crate::config::BmpConfig;
use crate::error::HardwareError;
use crate::model::*;
use crate::ping::ping;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

pub type HwResult<T> = Result<T, HardwareError>;

// ─── Wire contract ────────────────────────────────────────────

/// The BMP wire contract, as seen by the driver. One instance talks to the
/// BMPs of one machine through its root BMP; board numbers are relative to
/// the frame the instance was built for. Implementations own the encoding;
/// this crate only ships the no-hardware stub.
#[async_trait]
pub trait Transceiver: Send + Sync {
    async fn power_on(&self, boards: &[BoardNumber]) -> HwResult<()>;

    async fn power_off(&self, boards: &[BoardNumber]) -> HwResult<()>;

    async fn read_fpga_register(
        &self,
        board: BoardNumber,
        fpga: FpgaId,
        bank: u32,
        addr: u32,
    ) -> HwResult<u32>;

    async fn write_fpga_register(
        &self,
        board: BoardNumber,
        fpga: FpgaId,
        bank: u32,
        addr: u32,
        value: u32,
    ) -> HwResult<()>;

    async fn read_serial(&self, board: BoardNumber) -> HwResult<String>;

    async fn read_blacklist(&self, board: BoardNumber) -> HwResult<Blacklist>;

    async fn write_blacklist(&self, board: BoardNumber, blacklist: &Blacklist) -> HwResult<()>;

    async fn firmware_version(&self) -> HwResult<FirmwareVersion>;

    /// Rewrite the FPGA bitfiles of the named boards from the BMP's flash.
    async fn load_fpga_firmware(&self, boards: &[BoardNumber]) -> HwResult<()>;

    async fn close(&self);
}

/// Builds transceivers for the factory. The production connector (UDP to
/// the root BMP) is injected by the embedding service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        machine: &MachineDesc,
        bmp: BmpCoords,
    ) -> HwResult<Arc<dyn Transceiver>>;
}

// ─── Dummy implementation ─────────────────────────────────────

/// The FLAG register of each FPGA; its low two bits identify the FPGA that
/// answered, or read 0b11 when the whole set is sitting in reset.
pub const FLAG_REGISTER: u32 = 0x40004;

/// Per-link STOP register within a link register bank.
pub const STOP_REGISTER: u32 = 0x5C;

#[derive(Default)]
struct DummyState {
    powered: HashSet<BoardNumber>,
    serials: HashMap<BoardNumber, String>,
    blacklists: HashMap<BoardNumber, Blacklist>,
    stopped_links: HashSet<(BoardNumber, FpgaId, u32)>,
}

/// No-hardware stand-in honouring the full contract. FPGA health reads
/// always come back good, serials default to `DUMMY-<board>`, and every
/// mutation is remembered so tests can assert against it.
#[derive(Default)]
pub struct DummyTransceiver {
    state: StdMutex<DummyState>,
}

impl DummyTransceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_serial(&self, board: BoardNumber, serial: &str) {
        self.state
            .lock()
            .expect("dummy state poisoned")
            .serials
            .insert(board, serial.to_string());
    }

    pub fn set_blacklist(&self, board: BoardNumber, blacklist: Blacklist) {
        self.state
            .lock()
            .expect("dummy state poisoned")
            .blacklists
            .insert(board, blacklist);
    }

    pub fn is_powered(&self, board: BoardNumber) -> bool {
        self.state
            .lock()
            .expect("dummy state poisoned")
            .powered
            .contains(&board)
    }

    pub fn stopped_links(&self) -> Vec<(BoardNumber, FpgaId, u32)> {
        let mut v: Vec<_> = self
            .state
            .lock()
            .expect("dummy state poisoned")
            .stopped_links
            .iter()
            .copied()
            .collect();
        v.sort_unstable();
        v
    }
}

#[async_trait]
impl Transceiver for DummyTransceiver {
    async fn power_on(&self, boards: &[BoardNumber]) -> HwResult<()> {
        let mut s = self.state.lock().expect("dummy state poisoned");
        s.powered.extend(boards.iter().copied());
        Ok(())
    }

    async fn power_off(&self, boards: &[BoardNumber]) -> HwResult<()> {
        let mut s = self.state.lock().expect("dummy state poisoned");
        for b in boards {
            s.powered.remove(b);
        }
        Ok(())
    }

    async fn read_fpga_register(
        &self,
        _board: BoardNumber,
        fpga: FpgaId,
        _bank: u32,
        addr: u32,
    ) -> HwResult<u32> {
        // Healthy FPGAs identify themselves in FLAG[1:0].
        if addr == FLAG_REGISTER {
            return Ok(fpga as u32);
        }
        Ok(0)
    }

    async fn write_fpga_register(
        &self,
        board: BoardNumber,
        fpga: FpgaId,
        bank: u32,
        addr: u32,
        value: u32,
    ) -> HwResult<()> {
        if addr == STOP_REGISTER && value != 0 {
            self.state
                .lock()
                .expect("dummy state poisoned")
                .stopped_links
                .insert((board, fpga, bank));
        }
        Ok(())
    }

    async fn read_serial(&self, board: BoardNumber) -> HwResult<String> {
        let s = self.state.lock().expect("dummy state poisoned");
        Ok(s.serials
            .get(&board)
            .cloned()
            .unwrap_or_else(|| format!("DUMMY-{board}")))
    }

    async fn read_blacklist(&self, board: BoardNumber) -> HwResult<Blacklist> {
        let s = self.state.lock().expect("dummy state poisoned");
        Ok(s.blacklists.get(&board).cloned().unwrap_or_default())
    }

    async fn write_blacklist(&self, board: BoardNumber, blacklist: &Blacklist) -> HwResult<()> {
        self.state
            .lock()
            .expect("dummy state poisoned")
            .blacklists
            .insert(board, blacklist.clone());
        Ok(())
    }

    async fn firmware_version(&self) -> HwResult<FirmwareVersion> {
        Ok(FirmwareVersion::new(2, 1, 0))
    }

    async fn load_fpga_firmware(&self, _boards: &[BoardNumber]) -> HwResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Connector producing fresh `DummyTransceiver`s.
#[derive(Debug, Default)]
pub struct DummyConnector;

#[async_trait]
impl Connector for DummyConnector {
    async fn connect(
        &self,
        _machine: &MachineDesc,
        _bmp: BmpCoords,
    ) -> HwResult<Arc<dyn Transceiver>> {
        Ok(Arc::new(DummyTransceiver::new()))
    }
}

// ─── Factory ──────────────────────────────────────────────────

type CacheKey = (String, BmpCoords);

/// Process-wide transceiver cache, one entry per `(machine, BMP coords)`.
/// Each cached handle is bound to the machine's root BMP and is only ever
/// used inside the one worker that owns that machine, which is what keeps
/// the single-talker invariant.
pub struct TransceiverFactory {
    connector: Arc<dyn Connector>,
    dummy_connector: DummyConnector,
    use_dummy: AtomicBool,
    build_attempts: u32,
    cache: Mutex<HashMap<CacheKey, Arc<dyn Transceiver>>>,
}

impl TransceiverFactory {
    pub fn new(cfg: &BmpConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            dummy_connector: DummyConnector,
            use_dummy: AtomicBool::new(cfg.use_dummy_bmp),
            build_attempts: cfg.build_attempts.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn use_dummy(&self) -> bool {
        self.use_dummy.load(Ordering::Acquire)
    }

    /// Toggle dummy mode at runtime. Flushes the cache and closes every
    /// cached connection so the next request rebuilds against the new mode.
    pub async fn set_use_dummy(&self, on: bool) {
        if self.use_dummy.swap(on, Ordering::AcqRel) == on {
            return;
        }
        tracing::info!(dummy = on, "BMP transceiver mode changed, flushing cache");
        self.flush().await;
    }

    /// Fetch the transceiver for one BMP, building and caching it on first
    /// use. Construction is retried with pings of the root BMP in between,
    /// because a BMP can take a while to answer after a power cycle.
    pub async fn transceiver(
        &self,
        machine: &MachineDesc,
        bmp: BmpCoords,
    ) -> HwResult<Arc<dyn Transceiver>> {
        let key = (machine.name.clone(), bmp);
        let mut cache = self.cache.lock().await;
        if let Some(txrx) = cache.get(&key) {
            return Ok(txrx.clone());
        }

        let mut attempt = 0;
        let txrx = loop {
            let result = if self.use_dummy() {
                self.dummy_connector.connect(machine, bmp).await
            } else {
                self.connector.connect(machine, bmp).await
            };
            match result {
                Ok(txrx) => break txrx,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.build_attempts {
                        tracing::warn!(
                            machine = %machine.name, %bmp, attempts = attempt, error = %e,
                            "giving up building BMP transceiver"
                        );
                        return Err(e);
                    }
                    tracing::info!(
                        machine = %machine.name, %bmp, attempt, error = %e,
                        "BMP transceiver build failed, pinging and retrying"
                    );
                    if let Some(host) = machine.root_bmp_host() {
                        ping(host).await;
                    }
                }
            }
        };
        cache.insert(key, txrx.clone());
        Ok(txrx)
    }

    /// Close and drop every cached connection.
    pub async fn shutdown(&self) {
        self.flush().await;
    }

    async fn flush(&self) {
        let drained: Vec<Arc<dyn Transceiver>> = {
            let mut cache = self.cache.lock().await;
            cache.drain().map(|(_, t)| t).collect()
        };
        for txrx in drained {
            txrx.close().await;
        }
    }

    /// Number of live cached connections (shutdown property checks).
    pub async fn open_count(&self) -> usize {
        self.cache.lock().await.len()
    }
}
