use anyhow::{Context, Result};
use serde::Deserialize;
use spalloc_bmp_core::model::{BmpCoords, MachineDesc, TriadCoords};
use spalloc_bmp_core::{BmpConfig, MemoryStore};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;

/// Whole-service configuration, loaded from YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub controller: BmpConfig,
    /// When set (and the `postgres` feature is compiled in), state lives in
    /// PostgreSQL; otherwise an in-memory store is seeded from `machines`.
    pub database_url: Option<String>,
    pub machines: Vec<MachineSettings>,
    /// BMP serial → physical serial lookup table.
    pub serial_map: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineSettings {
    pub name: String,
    #[serde(default = "default_true")]
    pub in_service: bool,
    pub bmps: Vec<BmpSettings>,
    #[serde(default)]
    pub boards: Vec<BoardSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BmpSettings {
    pub cabinet: u32,
    pub frame: u32,
    pub address: IpAddr,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardSettings {
    pub board_id: Option<i64>,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub cabinet: u32,
    pub frame: u32,
    pub board_num: u8,
    pub address: Option<IpAddr>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }
}

impl MachineSettings {
    pub fn to_desc(&self) -> MachineDesc {
        MachineDesc {
            name: self.name.clone(),
            bmps: self
                .bmps
                .iter()
                .map(|b| (BmpCoords::new(b.cabinet, b.frame), b.address))
                .collect::<BTreeMap<_, _>>(),
            in_service: self.in_service,
        }
    }
}

/// Populate a memory store with the configured machines and boards.
pub async fn seed_memory_store(store: &MemoryStore, config: &ServerConfig) {
    for machine in &config.machines {
        store.add_machine(machine.to_desc()).await;
        for board in &machine.boards {
            store
                .add_board(
                    board.board_id,
                    &machine.name,
                    TriadCoords {
                        x: board.x,
                        y: board.y,
                        z: board.z,
                    },
                    BmpCoords::new(board.cabinet, board.frame),
                    board.board_num,
                    board.address,
                )
                .await;
        }
    }
}
