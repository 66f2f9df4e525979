/// Trackable parser: the filter admission engine.
///
/// Holds the controller's filter set in a [`FilterArena`], decides which
/// scanned advertisements are relevant, and runs the upload / remove /
/// commit lifecycle that keeps the set consistent across the mesh.
///
/// While `modification_in_progress` is set no advertisement is admitted:
/// the arena may hold half-uploaded filters. The flag starts set at boot
/// and only a successful commit clears it.
use crate::arena::FilterArena;
use crate::config::{ConfigKey, ConfigStore, NodeConfig};
use crate::error::{Error, Result, ResultCode};
use crate::event::{AcceptedAsset, Event, EventBus, EventListener};
use crate::filter::{short_asset_id, TrackingFilter};
use crate::mesh_queue::MeshQueueItem;
use crate::protocol::{
    ControlCommand, FilterSummary, FilterSummaryList, FilterSummaryMsg, MeshMsgType, MeshReport,
    StoneId, MAX_FILTER_IDS,
};
use crate::scanner::ScannedDevice;
use crate::util::{crc16, crc16_update, Lollipop};

/// Total bytes available for filter payloads.
pub const FILTER_BUFFER_SIZE: usize = 512;

/// Master state plus one entry per allocated filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSummaries {
    pub master: FilterSummaryMsg,
    pub modification_in_progress: bool,
    pub filters: FilterSummaryList,
}

/// Reply to a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Done(ResultCode),
    Summaries(FilterSummaries),
}

pub struct TrackableParser {
    arena: FilterArena<FILTER_BUFFER_SIZE, MAX_FILTER_IDS>,
    master_version: Lollipop,
    master_crc: u16,
    modification_in_progress: bool,
    /// Ticks since the last modification command
    modification_ticks: u32,
    config: NodeConfig,
}

impl TrackableParser {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            arena: FilterArena::new(),
            master_version: Lollipop::default(),
            master_crc: 0,
            modification_in_progress: true,
            modification_ticks: 0,
            config,
        }
    }

    /// Restore the persisted master state so a reboot never reuses a
    /// version. Filters themselves are pushed again by the controller.
    pub fn init(&mut self, store: &impl ConfigStore) {
        self.master_version =
            Lollipop::new(store.get(ConfigKey::FilterMasterVersion).unwrap_or(Lollipop::INITIAL));
        self.master_crc = store.get(ConfigKey::FilterMasterCrc).unwrap_or(0);
        self.modification_in_progress = true;
        self.modification_ticks = 0;
        log::info!(
            "trackable parser init: master version {} crc {:#06x}",
            self.master_version.value(),
            self.master_crc
        );
    }

    pub fn is_modification_in_progress(&self) -> bool {
        self.modification_in_progress
    }

    pub fn master(&self) -> FilterSummaryMsg {
        FilterSummaryMsg {
            master_version: self.master_version.value(),
            master_crc: self.master_crc,
        }
    }

    pub fn arena(&self) -> &FilterArena<FILTER_BUFFER_SIZE, MAX_FILTER_IDS> {
        &self.arena
    }

    fn begin_modification(&mut self) {
        self.modification_in_progress = true;
        self.modification_ticks = 0;
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Write one chunk of a filter. The first chunk for an unknown id
    /// allocates `total_size` bytes.
    pub fn upload(&mut self, filter_id: u8, total_size: usize, offset: usize, data: &[u8]) -> Result<()> {
        if total_size == 0 || offset + data.len() > total_size {
            return Err(Error::InvalidArgs);
        }

        match self.arena.find(filter_id) {
            None => {
                self.arena.allocate(filter_id, total_size)?;
                log::info!("allocated filter {} ({} bytes)", filter_id, total_size);
            }
            Some(slot) if slot.size != total_size => {
                log::warn!(
                    "filter {} upload size {} does not match allocated {}",
                    filter_id,
                    total_size,
                    slot.size
                );
                return Err(Error::InvalidArgs);
            }
            Some(_) => {}
        }

        self.begin_modification();
        self.arena.write(filter_id, offset, data)?;
        if let Some(slot) = self
            .arena
            .slots_mut()
            .iter_mut()
            .find(|s| s.filter_id == filter_id)
        {
            slot.committed = false;
            slot.crc = 0;
        }
        Ok(())
    }

    /// Remove a filter immediately and compact the arena.
    pub fn remove(&mut self, filter_id: u8) -> Result<()> {
        let freed = self.arena.deallocate(filter_id)?;
        self.begin_modification();
        log::info!("removed filter {}, freed {} bytes", filter_id, freed);
        Ok(())
    }

    /// Activate all filters, recompute CRCs, bump the master version and
    /// announce the new master state.
    pub fn commit(&mut self, bus: &mut EventBus) -> Result<FilterSummaryMsg> {
        for (slot, payload) in self.arena.iter() {
            if let Err(err) = TrackingFilter::parse(payload) {
                log::warn!("filter {} is malformed ({}), cannot commit", slot.filter_id, err);
                return Err(Error::InconsistentState);
            }
        }

        let mut crcs: heapless::Vec<u16, MAX_FILTER_IDS> = heapless::Vec::new();
        for (_, payload) in self.arena.iter() {
            let _ = crcs.push(crc16(payload));
        }

        let mut master_crc = crc16(&[]);
        for (slot, crc) in self.arena.slots_mut().iter_mut().zip(crcs) {
            slot.crc = crc;
            slot.committed = true;
            let c = crc.to_le_bytes();
            master_crc = crc16_update(master_crc, &[slot.filter_id, c[0], c[1]]);
        }

        self.master_crc = master_crc;
        self.master_version.increment();
        self.modification_in_progress = false;
        self.modification_ticks = 0;

        let summary = self.master();
        log::info!(
            "committed {} filters: master version {} crc {:#06x}",
            self.arena.len(),
            summary.master_version,
            summary.master_crc
        );

        let _ = bus.push(Event::FiltersUpdated(summary));
        let _ = bus.push(Event::MeshRemove {
            msg_type: MeshMsgType::FilterSummary,
            id: 0,
        });
        let _ = bus.push(Event::MeshSend(MeshQueueItem::broadcast(
            &MeshReport::FilterSummary(summary),
            0,
            self.config.summary_repeats,
            false,
        )));
        Ok(summary)
    }

    pub fn summaries(&self) -> FilterSummaries {
        let mut filters = FilterSummaryList::new();
        for (slot, payload) in self.arena.iter() {
            let _ = filters.push(FilterSummary {
                id: slot.filter_id,
                version: TrackingFilter::peek_version(payload),
                crc: slot.crc,
            });
        }
        FilterSummaries {
            master: self.master(),
            modification_in_progress: self.modification_in_progress,
            filters,
        }
    }

    pub fn handle_command(&mut self, cmd: &ControlCommand, bus: &mut EventBus) -> CommandResponse {
        let res = match cmd {
            ControlCommand::UploadFilter {
                filter_id,
                total_size,
                offset,
                data,
            } => self.upload(*filter_id, *total_size as usize, *offset as usize, data),
            ControlCommand::RemoveFilter { filter_id } => self.remove(*filter_id),
            ControlCommand::CommitFilterChanges => self.commit(bus).map(|_| ()),
            ControlCommand::GetFilterSummaries => {
                return CommandResponse::Summaries(self.summaries());
            }
        };
        if let Err(err) = res {
            log::info!("{} failed: {}", cmd.name(), err);
        }
        CommandResponse::Done(ResultCode::from(&res))
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Evaluate the committed filters in id order. The first match decides
    /// the asset id and output format.
    pub fn should_accept(&self, device: &ScannedDevice) -> Option<AcceptedAsset> {
        if self.modification_in_progress {
            return None;
        }

        let mut accepted: Option<AcceptedAsset> = None;
        let mut bitmask = 0u8;
        for (i, (slot, payload)) in self.arena.iter().enumerate() {
            if !slot.committed {
                continue;
            }
            let Ok(filter) = TrackingFilter::parse(payload) else {
                continue;
            };
            let Some(field) = filter.matches(device) else {
                continue;
            };

            bitmask |= 1 << i;
            if accepted.is_none() {
                accepted = Some(AcceptedAsset {
                    asset_id: short_asset_id(field),
                    mac: device.mac,
                    rssi: device.rssi,
                    channel: device.channel,
                    output: filter.output,
                    filter_bitmask: 0,
                });
            }
        }

        accepted.map(|asset| AcceptedAsset {
            filter_bitmask: bitmask,
            ..asset
        })
    }

    // ── Mesh sync and time-out ──────────────────────────────────────

    fn on_peer_summary(&self, stone: StoneId, peer: FilterSummaryMsg, bus: &mut EventBus) {
        let local = self.master();
        let peer_version = Lollipop::new(peer.master_version);
        if peer_version.is_newer_than(&self.master_version) && peer.master_crc != local.master_crc {
            log::warn!(
                "stone {} has newer filters: version {} crc {:#06x}, local version {} crc {:#06x}",
                stone,
                peer.master_version,
                peer.master_crc,
                local.master_version,
                local.master_crc
            );
            let _ = bus.push(Event::FilterDivergence { stone, peer, local });
        }
    }

    fn on_tick(&mut self, bus: &mut EventBus) {
        let Some(limit) = self.config.modification_timeout_ticks else {
            return;
        };
        if !self.modification_in_progress {
            return;
        }
        self.modification_ticks += 1;
        if self.modification_ticks < limit {
            return;
        }

        log::warn!("filter modification timed out, rolling back uncommitted filters");
        let mut stale: heapless::Vec<u8, MAX_FILTER_IDS> = heapless::Vec::new();
        for slot in self.arena.slots().iter().filter(|s| !s.committed) {
            let _ = stale.push(slot.filter_id);
        }
        for id in stale {
            let _ = self.arena.deallocate(id);
        }
        if let Err(err) = self.commit(bus) {
            log::warn!("commit after time-out failed: {}", err);
            self.modification_ticks = 0;
        }
    }
}

impl EventListener for TrackableParser {
    fn handle_event(&mut self, event: &Event, bus: &mut EventBus) {
        match event {
            Event::DeviceScanned(device) => {
                if let Some(asset) = self.should_accept(device) {
                    let _ = bus.push(Event::AssetAccepted(asset));
                }
            }
            Event::MeshMessageReceived(msg) => {
                if let Some(MeshReport::FilterSummary(peer)) = msg.report() {
                    self.on_peer_summary(msg.src, peer, bus);
                }
            }
            Event::PeriodicTick(_) => self.on_tick(bus),
            _ => {}
        }
    }
}
