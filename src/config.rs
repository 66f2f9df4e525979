/// Runtime configuration and the configuration store collaborator.
///
/// `NodeConfig` holds tuning values fixed at construction time. Values
/// that survive a reboot (own stone id, filter master state) go through
/// the `ConfigStore` trait, implemented by the platform's persistent
/// storage.
use heapless::LinearMap;

use crate::error::{Error, Resource, Result};

/// Interval of the periodic tick driving queues and time-outs.
pub const TICK_INTERVAL_MS: u32 = 100;

/// Interval at which the mesh queue sends a burst.
pub const QUEUE_PROCESS_INTERVAL_MS: u32 = 100;

/// Number of messages sent per mesh queue burst.
pub const QUEUE_BURST_COUNT: usize = 3;

/// Tuning values for the localisation core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// Ticks an asset stays throttled after it was forwarded.
    pub throttle_countdown_ticks: u8,
    /// Ticks after which a personal observation is forgotten.
    pub personal_timeout_ticks: u16,
    /// Ticks after which an unrefreshed winning record is reset.
    pub winning_timeout_ticks: u16,
    /// Extra dB our personal RSSI must exceed an inferior peer report by
    /// before we re-broadcast it.
    pub reclaim_margin_db: u8,
    /// Ticks an open filter modification may last before uncommitted
    /// uploads are rolled back. `None` waits forever.
    pub modification_timeout_ticks: Option<u32>,
    /// Transmissions per forwarded asset report.
    pub report_repeats: u8,
    /// Transmissions per filter summary broadcast.
    pub summary_repeats: u8,
}

impl NodeConfig {
    pub const fn new() -> Self {
        Self {
            throttle_countdown_ticks: 10,
            personal_timeout_ticks: 100,
            winning_timeout_ticks: 200,
            reclaim_margin_db: 0,
            modification_timeout_ticks: None,
            report_repeats: 1,
            summary_repeats: 3,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys of the small persisted values the core reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    StoneId,
    FilterMasterVersion,
    FilterMasterCrc,
}

/// Read/write access to persisted configuration values.
pub trait ConfigStore {
    fn get(&self, key: ConfigKey) -> Option<u16>;
    fn set(&mut self, key: ConfigKey, value: u16) -> Result<()>;
}

/// In-memory store, used on the host and in tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    values: LinearMap<ConfigKey, u16, 8>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            values: LinearMap::new(),
        }
    }

    pub fn with_stone_id(stone_id: u8) -> Self {
        let mut store = Self::new();
        let _ = store.values.insert(ConfigKey::StoneId, stone_id as u16);
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: ConfigKey) -> Option<u16> {
        self.values.get(&key).copied()
    }

    fn set(&mut self, key: ConfigKey, value: u16) -> Result<()> {
        self.values
            .insert(key, value)
            .map(|_| ())
            .map_err(|_| Error::CapacityExceeded(Resource::RecordStore))
    }
}
