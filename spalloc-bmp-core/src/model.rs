use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

// ─── Scalar aliases ───────────────────────────────────────────

/// Store-assigned job identity.
pub type JobId = i64;

/// Store-assigned board identity.
pub type BoardId = i64;

/// Store-assigned pending-change row identity.
pub type ChangeId = i64;

/// Store-assigned blacklist-operation row identity.
pub type OpId = i64;

/// Physical board number within one BMP's frame (0..=23).
pub type BoardNumber = u8;

/// One of the three link-routing FPGAs on a board.
pub type FpgaId = u8;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// FPGAs per board.
pub const FPGAS_PER_BOARD: FpgaId = 3;

// ─── Coordinates ──────────────────────────────────────────────

/// Identity of one management processor within a machine.
///
/// All wire traffic for a machine goes through the root BMP at `(0, 0)`;
/// the BMPs relay to each other over an internal I²C/CAN side channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BmpCoords {
    pub cabinet: u32,
    pub frame: u32,
}

impl BmpCoords {
    pub const ROOT: BmpCoords = BmpCoords {
        cabinet: 0,
        frame: 0,
    };

    pub fn new(cabinet: u32, frame: u32) -> Self {
        Self { cabinet, frame }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for BmpCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[c:{},f:{}]", self.cabinet, self.frame)
    }
}

/// Logical board position in the allocator's triad geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriadCoords {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl fmt::Display for TriadCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Physical address of a board: which BMP manages it and its number there.
/// This is the coordinate form hardware failures are reported against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BmpBoard {
    pub bmp: BmpCoords,
    pub board: BoardNumber,
}

impl fmt::Display for BmpBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b:{}", self.bmp, self.board)
    }
}

/// Chip position within a board (used by blacklists).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChipLocation {
    pub x: u8,
    pub y: u8,
}

impl fmt::Display for ChipLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

// ─── Link directions ──────────────────────────────────────────

/// The six inter-board link directions. Each of the three FPGAs drives two
/// adjacent perimeter links; the mapping is fixed by the board design.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    South,
    SouthWest,
    West,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
    ];

    /// Which FPGA manages this link.
    pub fn fpga(&self) -> FpgaId {
        match self {
            Direction::South | Direction::SouthWest => 0,
            Direction::West | Direction::North => 1,
            Direction::NorthEast | Direction::East => 2,
        }
    }

    /// Register bank for this link within its FPGA (each FPGA has two).
    pub fn bank(&self) -> u32 {
        match self {
            Direction::South | Direction::West | Direction::NorthEast => 0,
            Direction::SouthWest | Direction::North | Direction::East => 1,
        }
    }

    fn index(&self) -> usize {
        match self {
            Direction::North => 0,
            Direction::NorthEast => 1,
            Direction::East => 2,
            Direction::South => 3,
            Direction::SouthWest => 4,
            Direction::West => 5,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::North => "N",
            Direction::NorthEast => "NE",
            Direction::East => "E",
            Direction::South => "S",
            Direction::SouthWest => "SW",
            Direction::West => "W",
        };
        f.write_str(s)
    }
}

/// Per-direction keep-alive bits from a pending-change row. A cleared bit
/// means the link must be stopped when the change is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFlags(pub [bool; 6]);

impl LinkFlags {
    pub const ALL_ON: LinkFlags = LinkFlags([true; 6]);

    pub fn get(&self, d: Direction) -> bool {
        self.0[d.index()]
    }

    pub fn set(&mut self, d: Direction, on: bool) {
        self.0[d.index()] = on;
    }

    /// Directions whose links must be disabled.
    pub fn links_off(&self) -> impl Iterator<Item = Direction> + '_ {
        Direction::ALL.into_iter().filter(|d| !self.get(*d))
    }
}

impl Default for LinkFlags {
    fn default() -> Self {
        Self::ALL_ON
    }
}

// ─── Job state ────────────────────────────────────────────────

/// Allocator-owned job lifecycle state, mirrored here for the transitions
/// the BMP controller drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Unknown,
    Queued,
    Power,
    Ready,
    Destroyed,
}

impl JobState {
    pub fn from_i16(v: i16) -> JobState {
        match v {
            1 => JobState::Queued,
            2 => JobState::Power,
            3 => JobState::Ready,
            4 => JobState::Destroyed,
            _ => JobState::Unknown,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            JobState::Unknown => 0,
            JobState::Queued => 1,
            JobState::Power => 2,
            JobState::Ready => 3,
            JobState::Destroyed => 4,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Unknown => "UNKNOWN",
            JobState::Queued => "QUEUED",
            JobState::Power => "POWER",
            JobState::Ready => "READY",
            JobState::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

// ─── Blacklist ────────────────────────────────────────────────

/// The set of known-dead resources on one board, as held in the BMP's flash
/// and mirrored in the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklist {
    /// Entirely dead chips.
    pub chips: BTreeSet<ChipLocation>,
    /// Dead cores on otherwise-live chips.
    pub cores: BTreeMap<ChipLocation, BTreeSet<u32>>,
    /// Dead links on otherwise-live chips.
    pub links: BTreeMap<ChipLocation, BTreeSet<Direction>>,
}

impl Blacklist {
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty() && self.cores.is_empty() && self.links.is_empty()
    }
}

// ─── Firmware version ─────────────────────────────────────────

/// BMP firmware version triple. FPGA management (link stop registers,
/// bitfile reload) only exists from `MIN_FPGA_AWARE` onwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    pub const MIN_FPGA_AWARE: FirmwareVersion = FirmwareVersion {
        major: 2,
        minor: 0,
        patch: 0,
    };

    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn can_manage_fpgas(&self) -> bool {
        *self >= Self::MIN_FPGA_AWARE
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ─── Machine description ──────────────────────────────────────

/// Configuration-fixed description of one machine: its BMPs and where they
/// are reachable. The board population is read from the store per request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineDesc {
    pub name: String,
    /// BMP coordinates → management network address of that frame's BMP.
    pub bmps: BTreeMap<BmpCoords, IpAddr>,
    pub in_service: bool,
}

impl MachineDesc {
    /// Address of the root BMP, the single talker for the whole machine.
    pub fn root_bmp_host(&self) -> Option<IpAddr> {
        self.bmps.get(&BmpCoords::ROOT).copied()
    }
}

// ─── Store rows ───────────────────────────────────────────────

/// One row of the pending-change queue, joined with the board's physical
/// identity and network address (the worker never touches the store, so the
/// address is captured at take time).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub change_id: ChangeId,
    pub job_id: JobId,
    pub board_id: BoardId,
    pub bmp: BmpCoords,
    pub board_number: BoardNumber,
    pub from_state: JobState,
    pub to_state: JobState,
    pub power_on: bool,
    /// The board's power bit at take time; a change asking for the state
    /// the board is already in has nothing to switch.
    pub current_power: bool,
    pub links: LinkFlags,
    pub in_progress: bool,
    pub board_address: Option<IpAddr>,
}

/// Kind of a pending blacklist operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlacklistOpKind {
    ReadBlacklist,
    WriteBlacklist,
    GetSerial,
}

impl BlacklistOpKind {
    pub fn from_i16(v: i16) -> Option<BlacklistOpKind> {
        match v {
            0 => Some(BlacklistOpKind::ReadBlacklist),
            1 => Some(BlacklistOpKind::WriteBlacklist),
            2 => Some(BlacklistOpKind::GetSerial),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            BlacklistOpKind::ReadBlacklist => 0,
            BlacklistOpKind::WriteBlacklist => 1,
            BlacklistOpKind::GetSerial => 2,
        }
    }
}

/// One row of the pending blacklist-operation queue, joined with physical
/// identity and the serial number the store believes the board has.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlacklistOpRow {
    pub op_id: OpId,
    pub board_id: BoardId,
    pub machine: String,
    pub bmp: BmpCoords,
    pub board_number: BoardNumber,
    pub kind: BlacklistOpKind,
    pub expected_serial: Option<String>,
    /// Payload for `WriteBlacklist`; absent for the read kinds.
    pub payload: Option<Blacklist>,
}

/// Durable per-board record as the controller sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardRecord {
    pub board_id: BoardId,
    pub machine: String,
    pub triad: TriadCoords,
    pub bmp: BmpCoords,
    pub board_number: BoardNumber,
    pub address: Option<IpAddr>,
    pub power: bool,
    pub functioning: bool,
    pub allocated_to: Option<JobId>,
    pub bmp_serial: Option<String>,
    pub physical_serial: Option<String>,
    pub last_power_on: Option<Timestamp>,
    pub last_power_off: Option<Timestamp>,
}

/// Auto-filed report attached to a board the controller had to quarantine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardReport {
    pub board_id: BoardId,
    pub reporter: String,
    pub issue: String,
    pub timestamp: Timestamp,
}

// ─── In-memory requests ───────────────────────────────────────

/// All board and link changes for one job on one machine, grouped per BMP
/// so a worker can drive each management processor with one call sequence.
#[derive(Clone, Debug)]
pub struct PowerRequest {
    pub machine: String,
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
    /// Boards to switch on, per BMP.
    pub power_on: BTreeMap<BmpCoords, Vec<BoardNumber>>,
    /// Boards to switch off, per BMP.
    pub power_off: BTreeMap<BmpCoords, Vec<BoardNumber>>,
    /// Perimeter links to stop, per BMP.
    pub link_off: BTreeMap<BmpCoords, Vec<(BoardNumber, Direction)>>,
    /// Store identities of the boards switched on / off.
    pub on_board_ids: Vec<BoardId>,
    pub off_board_ids: Vec<BoardId>,
    /// Change rows this request covers.
    pub change_ids: Vec<ChangeId>,
    /// Physical address → store identity, for failure attribution.
    pub board_at: HashMap<BmpBoard, BoardId>,
    /// Addresses of freshly powered boards, pinged to prime ARP caches.
    pub ping_targets: Vec<IpAddr>,
}

impl PowerRequest {
    /// True when this request only removes power.
    pub fn is_power_off_only(&self) -> bool {
        self.power_on.is_empty()
    }
}

/// One blacklist operation against one board.
#[derive(Clone, Debug)]
pub struct BlacklistRequest {
    pub machine: String,
    pub op: OpId,
    pub board: BoardId,
    pub bmp: BmpCoords,
    pub board_number: BoardNumber,
    pub kind: BlacklistOpKind,
    pub expected_serial: Option<String>,
    pub payload: Option<Blacklist>,
}

/// A unit of work for a per-machine worker.
#[derive(Clone, Debug)]
pub enum Request {
    Power(PowerRequest),
    Blacklist(BlacklistRequest),
}

impl Request {
    pub fn machine(&self) -> &str {
        match self {
            Request::Power(p) => &p.machine,
            Request::Blacklist(b) => &b.machine,
        }
    }

    /// Every BMP this request will talk to.
    pub fn bmps(&self) -> BTreeSet<BmpCoords> {
        match self {
            Request::Power(p) => p
                .power_on
                .keys()
                .chain(p.power_off.keys())
                .chain(p.link_off.keys())
                .copied()
                .collect(),
            Request::Blacklist(b) => BTreeSet::from([b.bmp]),
        }
    }
}
