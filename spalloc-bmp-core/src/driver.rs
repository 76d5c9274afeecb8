use crate::config::BmpConfig;
use crate::error::HardwareError;
use crate::model::*;
use crate::txrx::{HwResult, Transceiver, FLAG_REGISTER, STOP_REGISTER};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// All-FPGAs marker in FLAG[1:0]: seeing it from a single FPGA means the
/// set is sitting in reset and wants its bitfiles reloading.
const FLAG_ALL_FPGAS: u32 = 0b11;

/// Per-board verdict from one FPGA health sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FpgaHealth {
    Good,
    Bad,
    /// At least one FPGA read back the all-FPGAs reset marker.
    Reset,
}

/// Adapter for one BMP: the operations the workers need, layered over the
/// raw wire contract. One driver per `(machine, BMP)` per request.
pub struct BmpDriver {
    machine: String,
    bmp: BmpCoords,
    txrx: Arc<dyn Transceiver>,
    fpga_attempts: u32,
    fpga_reload: bool,
    version: OnceCell<FirmwareVersion>,
}

impl BmpDriver {
    pub fn new(machine: &str, bmp: BmpCoords, txrx: Arc<dyn Transceiver>, cfg: &BmpConfig) -> Self {
        Self {
            machine: machine.to_string(),
            bmp,
            txrx,
            fpga_attempts: cfg.fpga_attempts.max(1),
            fpga_reload: cfg.fpga_reload,
            version: OnceCell::new(),
        }
    }

    async fn firmware_version(&self) -> HwResult<FirmwareVersion> {
        self.version
            .get_or_try_init(|| self.txrx.firmware_version())
            .await
            .map(|v| *v)
    }

    /// Power the boards on, then keep re-asserting power until every FPGA
    /// reports healthy or the attempt bound runs out. Attempts are 0-based;
    /// a reload of the bitfiles happens at most once, and never off the
    /// back of the first failed check.
    pub async fn power_on_and_check(&self, boards: &[BoardNumber]) -> HwResult<()> {
        let mut pending = boards.to_vec();
        let mut reloaded = false;
        let mut attempt: u32 = 0;
        loop {
            tracing::debug!(
                machine = %self.machine, bmp = %self.bmp, ?pending, attempt,
                "asserting power"
            );
            self.txrx.power_on(&pending).await?;

            let mut bad = Vec::new();
            let mut reset = Vec::new();
            for &board in &pending {
                match self.check_fpgas(board).await? {
                    FpgaHealth::Good => {}
                    FpgaHealth::Bad => bad.push(board),
                    FpgaHealth::Reset => {
                        bad.push(board);
                        reset.push(board);
                    }
                }
            }
            if bad.is_empty() {
                return Ok(());
            }

            attempt += 1;
            if attempt >= self.fpga_attempts {
                tracing::warn!(
                    machine = %self.machine, bmp = %self.bmp, boards = ?bad, attempts = attempt,
                    "FPGAs never came up healthy"
                );
                return Err(HardwareError::Permanent {
                    at: BmpBoard {
                        bmp: self.bmp,
                        board: bad[0],
                    },
                });
            }

            // Never reload on the strength of the first check alone.
            if attempt >= 2 && !reloaded && self.fpga_reload && !reset.is_empty() {
                tracing::warn!(
                    machine = %self.machine, bmp = %self.bmp, boards = ?reset,
                    "FPGAs in reset state, reloading bitfiles"
                );
                self.txrx.load_fpga_firmware(&reset).await?;
                reloaded = true;
            }

            tracing::info!(
                machine = %self.machine, bmp = %self.bmp, boards = ?bad, attempt,
                "FPGA check failed, retrying power-on"
            );
            pending = bad;
        }
    }

    async fn check_fpgas(&self, board: BoardNumber) -> HwResult<FpgaHealth> {
        let mut health = FpgaHealth::Good;
        for fpga in 0..FPGAS_PER_BOARD {
            let flag = self
                .txrx
                .read_fpga_register(board, fpga, 0, FLAG_REGISTER)
                .await?;
            let id = flag & 0b11;
            if id == fpga as u32 {
                continue;
            }
            if id == FLAG_ALL_FPGAS {
                return Ok(FpgaHealth::Reset);
            }
            tracing::debug!(
                machine = %self.machine, bmp = %self.bmp, board, fpga, flag,
                "FPGA flag mismatch"
            );
            health = FpgaHealth::Bad;
        }
        Ok(health)
    }

    pub async fn power_off(&self, boards: &[BoardNumber]) -> HwResult<()> {
        tracing::debug!(machine = %self.machine, bmp = %self.bmp, ?boards, "deasserting power");
        self.txrx.power_off(boards).await
    }

    /// Stop one inter-board link by writing its FPGA's STOP register.
    /// BMP firmware that predates FPGA management gets a silent skip.
    pub async fn set_link_off(&self, board: BoardNumber, direction: Direction) -> HwResult<()> {
        let version = self.firmware_version().await?;
        if !version.can_manage_fpgas() {
            tracing::debug!(
                machine = %self.machine, bmp = %self.bmp, %version,
                "BMP firmware too old to manage FPGAs, skipping link stop"
            );
            return Ok(());
        }
        self.txrx
            .write_fpga_register(board, direction.fpga(), direction.bank(), STOP_REGISTER, 1)
            .await
    }

    pub async fn read_serial(&self, board: BoardNumber) -> HwResult<String> {
        self.txrx.read_serial(board).await
    }

    /// Read a board's blacklist, returning it with the serial the BMP
    /// reported. An unexpected serial is logged but does not stop the read.
    pub async fn read_blacklist(
        &self,
        board: BoardNumber,
        expected_serial: Option<&str>,
    ) -> HwResult<(Blacklist, String)> {
        let serial = self.txrx.read_serial(board).await?;
        if let Some(expected) = expected_serial {
            if expected != serial {
                tracing::warn!(
                    machine = %self.machine, bmp = %self.bmp, board,
                    expected, reported = %serial,
                    "BMP serial differs from store while reading blacklist"
                );
            }
        }
        let blacklist = self.txrx.read_blacklist(board).await?;
        Ok((blacklist, serial))
    }

    /// Write a board's blacklist. Refuses outright when the BMP's serial is
    /// not the one the store expected: flash on the wrong board is not a
    /// recoverable mistake.
    pub async fn write_blacklist(
        &self,
        board: BoardNumber,
        expected_serial: &str,
        blacklist: &Blacklist,
    ) -> HwResult<()> {
        let serial = self.txrx.read_serial(board).await?;
        if serial != expected_serial {
            return Err(HardwareError::CallerBug(format!(
                "aborting blacklist write: board {board} on {} reports serial {serial}, \
                 store expected {expected_serial}",
                self.bmp
            )));
        }
        self.txrx.write_blacklist(board, blacklist).await
    }
}
