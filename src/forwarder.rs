/// Asset forwarder.
///
/// Collects outbound asset reports in a small outbox, throttles assets
/// that were forwarded recently, and once per tick hands every pending
/// report to the mesh queue and the UART host. Also relays what peers
/// report and what the tracker decides to the UART.
use heapless::Vec;

use crate::comm::{write_uart, UartSink};
use crate::config::{ConfigKey, NodeConfig};
use crate::error::{Error, Resource, Result};
use crate::event::{AcceptedAsset, Event, EventBus, EventListener};
use crate::filter::OutputFormat;
use crate::mesh_queue::MeshQueueItem;
use crate::protocol::{
    format_mac, AssetReportId, AssetReportMac, MacString, MeshReport, ShortAssetId, StoneId,
    UartMessage,
};
use crate::rssi::CompressedRssi;
use crate::store::{Keyed, RecordStore};

/// Pending reports per tick.
pub const OUTBOX_SIZE: usize = 5;

/// Assets that can be throttled at once.
pub const THROTTLE_RECORD_COUNT: usize = 10;

/// Identifies the asset a report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKey {
    Mac([u8; 6]),
    Id(ShortAssetId),
}

impl AssetKey {
    /// Id used to find queued mesh items about this asset. The message type
    /// tells MAC and short id keys apart.
    pub fn queue_id(&self) -> u64 {
        match self {
            AssetKey::Mac(mac) => {
                let mut bytes = [0u8; 8];
                bytes[..6].copy_from_slice(mac);
                u64::from_le_bytes(bytes)
            }
            AssetKey::Id(id) => id.queue_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxMessage {
    Mac(AssetReportMac),
    Id(AssetReportId),
}

impl OutboxMessage {
    pub fn key(&self) -> AssetKey {
        match self {
            OutboxMessage::Mac(m) => AssetKey::Mac(m.mac),
            OutboxMessage::Id(m) => AssetKey::Id(m.asset_id),
        }
    }

    pub fn report(&self) -> MeshReport {
        match self {
            OutboxMessage::Mac(m) => MeshReport::Mac(*m),
            OutboxMessage::Id(m) => MeshReport::Id(*m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThrottleRecord {
    key: AssetKey,
    countdown: u8,
}

impl Keyed for ThrottleRecord {
    type Key = AssetKey;

    fn key(&self) -> AssetKey {
        self.key
    }
}

pub struct AssetForwarder<U: UartSink> {
    uart: U,
    my_id: StoneId,
    outbox: Vec<OutboxMessage, OUTBOX_SIZE>,
    throttle: RecordStore<ThrottleRecord, THROTTLE_RECORD_COUNT>,
    config: NodeConfig,
}

impl<U: UartSink> AssetForwarder<U> {
    pub fn new(uart: U, my_id: StoneId, config: NodeConfig) -> Self {
        Self {
            uart,
            my_id,
            outbox: Vec::new(),
            throttle: RecordStore::new(),
            config,
        }
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    pub fn set_stone_id(&mut self, id: StoneId) {
        self.my_id = id;
    }

    pub fn outbox(&self) -> &[OutboxMessage] {
        &self.outbox
    }

    pub fn is_throttled(&self, key: AssetKey) -> bool {
        self.throttle.lookup(key).is_some_and(|r| r.countdown > 0)
    }

    pub fn send_asset_mac(&mut self, asset: &AcceptedAsset) -> Result<()> {
        self.stage(OutboxMessage::Mac(AssetReportMac {
            rssi: CompressedRssi::new(asset.rssi, asset.channel),
            mac: asset.mac,
        }))
    }

    pub fn send_asset_id(&mut self, report: &AssetReportId) -> Result<()> {
        self.stage(OutboxMessage::Id(*report))
    }

    fn stage(&mut self, msg: OutboxMessage) -> Result<()> {
        let key = msg.key();
        if self.is_throttled(key) {
            return Ok(());
        }
        if let Some(pending) = self.outbox.iter_mut().find(|m| m.key() == key) {
            *pending = msg;
            return Ok(());
        }
        self.outbox.push(msg).map_err(|_| {
            log::debug!("outbox full, dropping report");
            Error::CapacityExceeded(Resource::Outbox)
        })
    }

    /// Dispatch every pending report to the UART and the mesh queue.
    pub fn flush(&mut self, bus: &mut EventBus) {
        let countdown = self.config.throttle_countdown_ticks;
        for msg in core::mem::take(&mut self.outbox) {
            let key = msg.key();
            match self
                .throttle
                .get_or_create(key, || ThrottleRecord { key, countdown: 0 })
            {
                Some(rec) => rec.countdown = countdown,
                None => log::debug!("throttle table full"),
            }

            self.write_report(&msg.report(), self.my_id);

            let report = msg.report();
            let _ = bus.push(Event::MeshRemove {
                msg_type: report.msg_type(),
                id: key.queue_id(),
            });
            let _ = bus.push(Event::MeshSend(MeshQueueItem::broadcast(
                &report,
                key.queue_id(),
                self.config.report_repeats,
                false,
            )));
        }
    }

    /// Count every throttle down by one tick.
    pub fn tick_throttle(&mut self) {
        self.throttle.retain(|rec| {
            rec.countdown = rec.countdown.saturating_sub(1);
            rec.countdown > 0
        });
    }

    fn write_report(&mut self, report: &MeshReport, seen_by: StoneId) {
        match report {
            MeshReport::Mac(m) => {
                let mut mac = MacString::new();
                format_mac(&m.mac, &mut mac);
                write_uart(
                    &mut self.uart,
                    &UartMessage::AssetMac {
                        mac: &mac,
                        stone: seen_by,
                        rssi: m.rssi.rssi(),
                        ch: m.rssi.channel(),
                    },
                );
            }
            MeshReport::Id(m) => {
                let id = m.asset_id.to_hex();
                write_uart(
                    &mut self.uart,
                    &UartMessage::AssetId {
                        id: &id,
                        stone: seen_by,
                        mask: m.filter_bitmask,
                        rssi: m.rssi,
                        ch: m.channel,
                    },
                );
            }
            MeshReport::FilterSummary(_) => {}
        }
    }
}

impl<U: UartSink> EventListener for AssetForwarder<U> {
    fn handle_event(&mut self, event: &Event, bus: &mut EventBus) {
        match event {
            Event::AssetAccepted(asset) if asset.output == OutputFormat::MacReport => {
                let _ = self.send_asset_mac(asset);
            }
            Event::AssetReport(report) => {
                let _ = self.send_asset_id(report);
            }
            Event::PeriodicTick(_) => {
                self.tick_throttle();
                self.flush(bus);
            }
            Event::MeshMessageReceived(msg) => {
                if let Some(report @ (MeshReport::Mac(_) | MeshReport::Id(_))) = msg.report() {
                    self.write_report(&report, msg.src);
                }
            }
            Event::TrackingUpdate(update) => {
                let id = update.asset_id.to_hex();
                write_uart(
                    &mut self.uart,
                    &UartMessage::Nearest {
                        id: &id,
                        winner: update.winner,
                        rssi: update.rssi,
                    },
                );
            }
            Event::AssetTimedOut(asset_id) => {
                let id = asset_id.to_hex();
                write_uart(&mut self.uart, &UartMessage::Timeout { id: &id });
            }
            Event::FilterDivergence { stone, peer, local } => write_uart(
                &mut self.uart,
                &UartMessage::FilterDivergence {
                    stone: *stone,
                    version: peer.master_version,
                    crc: peer.master_crc,
                    local_version: local.master_version,
                    local_crc: local.master_crc,
                },
            ),
            Event::ConfigChanged {
                key: ConfigKey::StoneId,
                value,
            } => self.set_stone_id(*value as StoneId),
            _ => {}
        }
    }
}
