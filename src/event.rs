/// Closed set of events exchanged between the components of a node.
///
/// External inputs (scans, mesh messages, ticks, config changes) and the
/// internal follow-ups they cause all travel through one bounded FIFO
/// bus. Each component implements [`EventListener`] and pattern-matches
/// the variants it cares about. Events pushed while an event is being
/// handled are processed after it, never nested.
use heapless::Deque;

use crate::config::ConfigKey;
use crate::error::{Error, Resource, Result};
use crate::filter::OutputFormat;
use crate::forwarder::OUTBOX_SIZE;
use crate::mesh_queue::MeshQueueItem;
use crate::protocol::{
    AssetReportId, FilterSummaryMsg, MeshMessage, MeshMsgType, ShortAssetId, StoneId,
};
use crate::scanner::ScannedDevice;
use crate::tracker::TRACKER_RECORD_COUNT;

/// Number of events that can be pending at once. One tick may time out
/// every tracked asset (two events each) and flush a full outbox (two
/// events per report) while a commit adds three more.
pub const EVENT_BUS_SIZE: usize = 2 * TRACKER_RECORD_COUNT + 2 * OUTBOX_SIZE + 8;

/// An advertisement that passed the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedAsset {
    pub asset_id: ShortAssetId,
    pub mac: [u8; 6],
    pub rssi: i8,
    pub channel: u8,
    pub output: OutputFormat,
    /// Bit i set when the filter at index i matched
    pub filter_bitmask: u8,
}

/// Locally believed winner of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingUpdate {
    pub asset_id: ShortAssetId,
    pub winner: StoneId,
    pub rssi: i8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // ── Inputs ──
    /// Advertisement from the scanner, already split into AD structures
    DeviceScanned(ScannedDevice),
    MeshMessageReceived(MeshMessage),
    PeriodicTick(u32),
    ConfigChanged { key: ConfigKey, value: u16 },

    // ── Internal ──
    AssetAccepted(AcceptedAsset),
    /// A committed filter set is active
    FiltersUpdated(FilterSummaryMsg),
    /// Tracker decided to tell the mesh about an asset
    AssetReport(AssetReportId),
    MeshSend(MeshQueueItem),
    MeshRemove { msg_type: MeshMsgType, id: u64 },

    // ── Outputs ──
    WinnerChanged {
        asset_id: ShortAssetId,
        is_this_node: bool,
    },
    TrackingUpdate(TrackingUpdate),
    AssetTimedOut(ShortAssetId),
    FilterDivergence {
        stone: StoneId,
        peer: FilterSummaryMsg,
        local: FilterSummaryMsg,
    },
}

/// Component side of the dispatch.
pub trait EventListener {
    fn handle_event(&mut self, event: &Event, bus: &mut EventBus);
}

pub struct EventBus {
    pending: Deque<Event, EVENT_BUS_SIZE>,
}

impl EventBus {
    pub const fn new() -> Self {
        Self {
            pending: Deque::new(),
        }
    }

    /// Queue an event. A full bus drops it.
    pub fn push(&mut self, event: Event) -> Result<()> {
        self.pending.push_back(event).map_err(|dropped| {
            log::warn!("event bus full, dropping {:?}", dropped);
            Error::CapacityExceeded(Resource::EventBus)
        })
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch command raised when this node starts or stops being nearest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
}

/// Events published to the rest of the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishedEvent {
    Switch(SwitchState),
    TrackingUpdate(TrackingUpdate),
}

/// Receiver of published events (e.g. the switch driver).
pub trait EventSink {
    fn publish(&mut self, event: PublishedEvent);
}
