/// Nearest-node tracker.
///
/// For every asset the node has heard about it keeps the RSSI it measured
/// itself (personal) and the best RSSI known in the mesh (winning) along
/// with the stone that reported it. Every node runs the same election on
/// the same reports, so the mesh converges on one winner per asset.
use crate::config::{ConfigKey, NodeConfig};
use crate::event::{AcceptedAsset, Event, EventBus, EventListener, TrackingUpdate};
use crate::filter::OutputFormat;
use crate::protocol::{AssetReportId, MeshReport, ShortAssetId, StoneId};
use crate::store::{Keyed, RecordStore};

/// Number of assets tracked at once.
pub const TRACKER_RECORD_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winner {
    pub stone: StoneId,
    pub rssi: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetRecord {
    pub asset_id: ShortAssetId,
    pub personal_rssi: Option<i8>,
    pub channel: u8,
    pub filter_bitmask: u8,
    pub winner: Option<Winner>,
    /// Ticks since the personal value was refreshed
    personal_age: u16,
    /// Ticks since the winning value was refreshed
    winner_age: u16,
}

impl AssetRecord {
    fn new(asset_id: ShortAssetId) -> Self {
        Self {
            asset_id,
            personal_rssi: None,
            channel: 0,
            filter_bitmask: 0,
            winner: None,
            personal_age: 0,
            winner_age: 0,
        }
    }

    pub fn is_winner(&self, my_id: StoneId) -> bool {
        self.winner.is_some_and(|w| w.stone == my_id)
    }

    fn set_winner(&mut self, stone: StoneId, rssi: i8) {
        self.winner = Some(Winner { stone, rssi });
        self.winner_age = 0;
    }

    fn report(&self, rssi: i8) -> AssetReportId {
        AssetReportId {
            asset_id: self.asset_id,
            filter_bitmask: self.filter_bitmask,
            rssi,
            channel: self.channel,
        }
    }

    fn update(&self) -> Option<TrackingUpdate> {
        self.winner.map(|w| TrackingUpdate {
            asset_id: self.asset_id,
            winner: w.stone,
            rssi: w.rssi,
        })
    }
}

impl Keyed for AssetRecord {
    type Key = ShortAssetId;

    fn key(&self) -> ShortAssetId {
        self.asset_id
    }
}

pub struct NearestTracker {
    records: RecordStore<AssetRecord, TRACKER_RECORD_COUNT>,
    my_id: StoneId,
    config: NodeConfig,
}

impl NearestTracker {
    pub fn new(my_id: StoneId, config: NodeConfig) -> Self {
        Self {
            records: RecordStore::new(),
            my_id,
            config,
        }
    }

    pub fn my_id(&self) -> StoneId {
        self.my_id
    }

    pub fn set_stone_id(&mut self, id: StoneId) {
        log::info!("tracker stone id {} -> {}", self.my_id, id);
        self.my_id = id;
    }

    pub fn record(&self, asset_id: ShortAssetId) -> Option<&AssetRecord> {
        self.records.lookup(asset_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &AssetRecord> {
        self.records.iter()
    }

    fn record_for(&mut self, asset_id: ShortAssetId) -> Option<&mut AssetRecord> {
        let rec = self
            .records
            .get_or_create(asset_id, || AssetRecord::new(asset_id));
        if rec.is_none() {
            log::warn!("tracker full, ignoring asset {}", asset_id.to_hex());
        }
        rec
    }

    /// This node observed the asset itself.
    pub fn on_personal_observation(&mut self, asset: &AcceptedAsset, bus: &mut EventBus) {
        let my_id = self.my_id;
        let Some(rec) = self.record_for(asset.asset_id) else {
            return;
        };

        rec.personal_rssi = Some(asset.rssi);
        rec.personal_age = 0;
        rec.channel = asset.channel;
        rec.filter_bitmask = asset.filter_bitmask;

        let before = rec.winner;
        let takes_win = match before {
            None => true,
            Some(w) if w.stone == my_id => true,
            Some(w) => asset.rssi > w.rssi,
        };
        if !takes_win {
            return;
        }

        rec.set_winner(my_id, asset.rssi);
        let _ = bus.push(Event::AssetReport(rec.report(asset.rssi)));
        if !before.is_some_and(|w| w.stone == my_id) {
            log::info!("won asset {} at {} dBm", asset.asset_id.to_hex(), asset.rssi);
            let _ = bus.push(Event::WinnerChanged {
                asset_id: asset.asset_id,
                is_this_node: true,
            });
        }
        if before != rec.winner {
            if let Some(update) = rec.update() {
                let _ = bus.push(Event::TrackingUpdate(update));
            }
        }
    }

    /// Another stone reported the asset.
    pub fn on_peer_report(&mut self, reporter: StoneId, report: &AssetReportId, bus: &mut EventBus) {
        let my_id = self.my_id;
        if reporter == my_id {
            return;
        }
        let margin = self.config.reclaim_margin_db as i16;
        let Some(rec) = self.record_for(report.asset_id) else {
            return;
        };

        let before = rec.winner;
        let adopt = match before {
            None => true,
            Some(w) => report.rssi > w.rssi,
        };

        if adopt {
            rec.set_winner(reporter, report.rssi);
            if before.is_some_and(|w| w.stone == my_id) {
                log::info!(
                    "lost asset {} to stone {} ({} dBm)",
                    report.asset_id.to_hex(),
                    reporter,
                    report.rssi
                );
                let _ = bus.push(Event::WinnerChanged {
                    asset_id: report.asset_id,
                    is_this_node: false,
                });
            }
            if let Some(update) = rec.update() {
                let _ = bus.push(Event::TrackingUpdate(update));
            }
            return;
        }

        // The winner's own report is its current value, even when weaker
        if before.is_some_and(|w| w.stone == reporter) {
            rec.set_winner(reporter, report.rssi);
            if before != rec.winner {
                if let Some(update) = rec.update() {
                    let _ = bus.push(Event::TrackingUpdate(update));
                }
            }
        }

        // An inferior report must not stick while we hear the asset better
        if let Some(personal) = rec.personal_rssi {
            if personal as i16 > report.rssi as i16 + margin {
                log::debug!(
                    "re-claiming asset {}: {} dBm beats reported {} dBm",
                    report.asset_id.to_hex(),
                    personal,
                    report.rssi
                );
                let _ = bus.push(Event::AssetReport(rec.report(personal)));
            }
        }
    }

    /// Age every record once; drop what is no longer backed by fresh reports.
    pub fn tick(&mut self, bus: &mut EventBus) {
        let my_id = self.my_id;
        let personal_timeout = self.config.personal_timeout_ticks;
        let winning_timeout = self.config.winning_timeout_ticks;

        self.records.retain(|rec| {
            if rec.personal_rssi.is_some() {
                rec.personal_age = rec.personal_age.saturating_add(1);
                if rec.personal_age >= personal_timeout {
                    rec.personal_rssi = None;
                }
            }

            if let Some(winner) = rec.winner {
                rec.winner_age = rec.winner_age.saturating_add(1);
                if rec.winner_age >= winning_timeout {
                    log::info!("asset {} timed out", rec.asset_id.to_hex());
                    rec.winner = None;
                    if winner.stone == my_id {
                        let _ = bus.push(Event::WinnerChanged {
                            asset_id: rec.asset_id,
                            is_this_node: false,
                        });
                    }
                    let _ = bus.push(Event::AssetTimedOut(rec.asset_id));
                }
            }

            rec.personal_rssi.is_some() || rec.winner.is_some()
        });
    }

    /// Forget every asset, e.g. after the filter set changed.
    pub fn reset(&mut self, bus: &mut EventBus) {
        for rec in self.records.iter().filter(|r| r.is_winner(self.my_id)) {
            let _ = bus.push(Event::WinnerChanged {
                asset_id: rec.asset_id,
                is_this_node: false,
            });
        }
        self.records.clear();
    }
}

impl EventListener for NearestTracker {
    fn handle_event(&mut self, event: &Event, bus: &mut EventBus) {
        match event {
            Event::AssetAccepted(asset) if asset.output == OutputFormat::ShortAssetId => {
                self.on_personal_observation(asset, bus);
            }
            Event::MeshMessageReceived(msg) => {
                if let Some(MeshReport::Id(report)) = msg.report() {
                    self.on_peer_report(msg.src, &report, bus);
                }
            }
            Event::PeriodicTick(_) => self.tick(bus),
            Event::FiltersUpdated(_) => self.reset(bus),
            Event::ConfigChanged {
                key: ConfigKey::StoneId,
                value,
            } => self.set_stone_id(*value as StoneId),
            _ => {}
        }
    }
}
