/// One mesh node: owns every component and the collaborators, turns
/// external inputs into events and runs the bus until it is empty.
use crate::comm::{self, write_uart, LineReader, UartSink};
use crate::config::{ConfigKey, ConfigStore, NodeConfig};
use crate::error::Result;
use crate::event::{Event, EventBus, EventListener, EventSink, PublishedEvent, SwitchState};
use crate::forwarder::AssetForwarder;
use crate::mesh_queue::{MeshQueue, MeshTransport};
use crate::parser::{CommandResponse, TrackableParser};
use crate::protocol::{ControlCommand, MeshMessage, StoneId, UartMessage};
use crate::scanner::ScannedDevice;
use crate::tracker::NearestTracker;

pub struct Node<C: ConfigStore, T: MeshTransport, U: UartSink, S: EventSink> {
    store: C,
    sink: S,
    parser: TrackableParser,
    tracker: NearestTracker,
    forwarder: AssetForwarder<U>,
    queue: MeshQueue<T>,
    bus: EventBus,
    uart_reader: LineReader,
    tick_count: u32,
}

impl<C: ConfigStore, T: MeshTransport, U: UartSink, S: EventSink> Node<C, T, U, S> {
    pub fn new(config: NodeConfig, store: C, transport: T, uart: U, sink: S) -> Self {
        Self {
            store,
            sink,
            parser: TrackableParser::new(config),
            tracker: NearestTracker::new(0, config),
            forwarder: AssetForwarder::new(uart, 0, config),
            queue: MeshQueue::new(transport),
            bus: EventBus::new(),
            uart_reader: LineReader::new(),
            tick_count: 0,
        }
    }

    /// Read the persisted state. Must run once before any input.
    pub fn init(&mut self) {
        let id = match self.store.get(ConfigKey::StoneId) {
            Some(id) => id as StoneId,
            None => {
                log::warn!("no stone id configured");
                0
            }
        };
        self.tracker.set_stone_id(id);
        self.forwarder.set_stone_id(id);
        self.parser.init(&self.store);
        log::info!("stonemesh {} node {} ready", crate::protocol::VERSION, id);
    }

    pub fn my_id(&self) -> StoneId {
        self.tracker.my_id()
    }

    pub fn parser(&self) -> &TrackableParser {
        &self.parser
    }

    pub fn tracker(&self) -> &NearestTracker {
        &self.tracker
    }

    pub fn forwarder(&self) -> &AssetForwarder<U> {
        &self.forwarder
    }

    pub fn queue(&self) -> &MeshQueue<T> {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MeshQueue<T> {
        &mut self.queue
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    // ── Inputs ──────────────────────────────────────────────────────

    pub fn on_scan(&mut self, device: ScannedDevice) {
        self.handle_event(Event::DeviceScanned(device));
    }

    pub fn on_mesh_message(&mut self, msg: MeshMessage) {
        self.handle_event(Event::MeshMessageReceived(msg));
    }

    /// Advance time by one tick interval.
    pub fn tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
        self.handle_event(Event::PeriodicTick(self.tick_count));
    }

    /// Persist a configuration value and tell the components about it.
    pub fn set_config(&mut self, key: ConfigKey, value: u16) -> Result<()> {
        self.store.set(key, value)?;
        self.handle_event(Event::ConfigChanged { key, value });
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event) {
        let _ = self.bus.push(event);
        self.drain();
    }

    /// Run a control command and write its reply to the UART.
    pub fn handle_command(&mut self, cmd: &ControlCommand) -> CommandResponse {
        let response = self.parser.handle_command(cmd, &mut self.bus);
        match &response {
            CommandResponse::Done(code) => write_uart(
                self.forwarder.uart_mut(),
                &UartMessage::CommandResult {
                    cmd: cmd.name(),
                    code: *code,
                },
            ),
            CommandResponse::Summaries(s) => write_uart(
                self.forwarder.uart_mut(),
                &UartMessage::FilterSummaries {
                    version: s.master.master_version,
                    crc: s.master.master_crc,
                    modification_in_progress: s.modification_in_progress,
                    filters: &s.filters,
                },
            ),
        }
        self.drain();
        response
    }

    /// Parse and run one JSON command line from the host.
    pub fn handle_command_line(&mut self, line: &[u8]) -> Option<CommandResponse> {
        let cmd = parse_line(line)?;
        Some(self.handle_command(&cmd))
    }

    /// Feed one byte received from the host. Runs the command when it
    /// completes a line.
    pub fn on_uart_byte(&mut self, byte: u8) -> Option<CommandResponse> {
        let cmd = parse_line(self.uart_reader.feed(byte)?)?;
        Some(self.handle_command(&cmd))
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn drain(&mut self) {
        while let Some(event) = self.bus.pop() {
            self.dispatch(&event);
        }
    }

    fn dispatch(&mut self, event: &Event) {
        self.parser.handle_event(event, &mut self.bus);
        self.tracker.handle_event(event, &mut self.bus);
        self.forwarder.handle_event(event, &mut self.bus);
        self.queue.handle_event(event, &mut self.bus);

        match event {
            Event::WinnerChanged { is_this_node, .. } => {
                let state = if *is_this_node {
                    SwitchState::On
                } else {
                    SwitchState::Off
                };
                self.sink.publish(PublishedEvent::Switch(state));
            }
            Event::TrackingUpdate(update) => {
                self.sink.publish(PublishedEvent::TrackingUpdate(*update));
            }
            Event::FiltersUpdated(summary) => {
                let persisted = self
                    .store
                    .set(ConfigKey::FilterMasterVersion, summary.master_version)
                    .and_then(|_| self.store.set(ConfigKey::FilterMasterCrc, summary.master_crc));
                if let Err(err) = persisted {
                    log::warn!("failed to persist filter master state: {}", err);
                }
            }
            _ => {}
        }
    }
}

fn parse_line(line: &[u8]) -> Option<ControlCommand> {
    let cmd = comm::parse_command(line);
    if cmd.is_none() {
        log::warn!("ignoring unparseable command line");
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::RecordingUart;
    use crate::config::MemoryConfigStore;
    use crate::error::ResultCode;
    use crate::filter::{encode_filter, short_asset_id, FilterInput, MatchKind, OutputFormat, NO_RSSI_FLOOR};
    use crate::mesh_queue::tests::RecordingTransport;
    use crate::protocol::{MeshMsgType, UartOpcode};
    use crate::tracker::{Winner, TRACKER_RECORD_COUNT};

    type TestNode = Node<MemoryConfigStore, RecordingTransport, RecordingUart, RecordingSink>;

    #[derive(Default)]
    struct RecordingSink {
        events: std::vec::Vec<PublishedEvent>,
    }

    impl EventSink for RecordingSink {
        fn publish(&mut self, event: PublishedEvent) {
            self.events.push(event);
        }
    }

    impl RecordingSink {
        fn switches(&self) -> std::vec::Vec<SwitchState> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    PublishedEvent::Switch(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }
    }

    const TAG: [u8; 6] = [0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01];

    fn node(id: u8) -> TestNode {
        node_with(id, NodeConfig::new())
    }

    fn node_with(id: u8, config: NodeConfig) -> TestNode {
        let mut n = Node::new(
            config,
            MemoryConfigStore::with_stone_id(id),
            RecordingTransport::default(),
            RecordingUart::default(),
            RecordingSink::default(),
        );
        n.init();
        n
    }

    fn install_filter(n: &mut TestNode, output: OutputFormat) {
        install(n, output, MatchKind::Exact, &TAG);
    }

    fn install(n: &mut TestNode, output: OutputFormat, kind: MatchKind, entry: &[u8]) {
        let mut buf = [0u8; 32];
        let len = encode_filter(
            &mut buf,
            1,
            FilterInput::MacAddress,
            output,
            NO_RSSI_FLOOR,
            kind,
            entry.len() as u8,
            entry,
        )
        .unwrap();
        let upload = ControlCommand::UploadFilter {
            filter_id: 0,
            total_size: len as u16,
            offset: 0,
            data: heapless::Vec::from_slice(&buf[..len]).unwrap(),
        };
        assert_eq!(n.handle_command(&upload), CommandResponse::Done(ResultCode::Ok));
        assert_eq!(
            n.handle_command(&ControlCommand::CommitFilterChanges),
            CommandResponse::Done(ResultCode::Ok)
        );
    }

    /// Tick `from` until its queue is empty and deliver what it sent to `to`.
    fn deliver(from: &mut TestNode, to: &mut TestNode) {
        for _ in 0..10 {
            from.tick();
        }
        let src = from.my_id();
        let packets: std::vec::Vec<_> = from.queue_mut().transport_mut().sent.drain(..).collect();
        for packet in packets {
            let msg = MeshMessage::decode(src, &packet, -70, 1).unwrap();
            to.on_mesh_message(msg);
        }
    }

    // ── Wiring ──

    #[test]
    fn init_reads_store() {
        let n = node(7);
        assert_eq!(n.my_id(), 7);
        assert!(n.parser().is_modification_in_progress());
    }

    #[test]
    fn commit_persists_master_state() {
        let mut n = node(1);
        install_filter(&mut n, OutputFormat::ShortAssetId);
        let master = n.parser().master();
        assert_eq!(n.store().get(ConfigKey::FilterMasterVersion), Some(master.master_version));
        assert_eq!(n.store().get(ConfigKey::FilterMasterCrc), Some(master.master_crc));

        // Version keeps counting across a reboot
        let mut rebooted = Node::new(
            NodeConfig::new(),
            MemoryConfigStore::new(),
            RecordingTransport::default(),
            RecordingUart::default(),
            RecordingSink::default(),
        );
        rebooted.store.set(ConfigKey::FilterMasterVersion, master.master_version).unwrap();
        rebooted.init();
        assert_eq!(rebooted.parser().master().master_version, master.master_version);
    }

    #[test]
    fn commands_reply_on_uart() {
        let mut n = node(1);
        n.handle_command_line(b"{\"cmd\":\"remove_filter\",\"filter_id\":3}\n");
        n.handle_command_line(b"{\"cmd\":\"get_filter_summaries\"}");
        assert!(n.handle_command_line(b"garbage").is_none());

        let uart = n.forwarder().uart();
        assert_eq!(
            uart.of(UartOpcode::CommandResult),
            ["{\"type\":\"result\",\"cmd\":\"remove_filter\",\"code\":\"not_found\"}\n"]
        );
        assert_eq!(
            uart.of(UartOpcode::FilterSummaries),
            ["{\"type\":\"filter_summaries\",\"version\":0,\"crc\":0,\"modifying\":true,\"filters\":[]}\n"]
        );
    }

    #[test]
    fn uart_bytes_run_commands() {
        let mut n = node(1);
        let mut responses = std::vec::Vec::new();
        let input = b"{\"cmd\":\"remove_filter\",\"filter_id\":3}\r\n{\"cmd\":\"get_filter_summaries\"}\n";
        for &b in input.iter() {
            responses.extend(n.on_uart_byte(b));
        }
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], CommandResponse::Done(ResultCode::NotFound));
        assert_eq!(n.forwarder().uart().of(UartOpcode::FilterSummaries).len(), 1);
    }

    #[test]
    fn overlong_uart_line_is_not_run() {
        let mut n = node(1);
        for _ in 0..crate::protocol::MAX_MSG_LEN {
            assert!(n.on_uart_byte(b' ').is_none());
        }
        for &b in b"{\"cmd\":\"remove_filter\",\"filter_id\":3}\n" {
            assert!(n.on_uart_byte(b).is_none());
        }
        assert!(n.forwarder().uart().of(UartOpcode::CommandResult).is_empty());

        for &b in b"{\"cmd\":\"commit\"}\n" {
            n.on_uart_byte(b);
        }
        assert_eq!(n.forwarder().uart().of(UartOpcode::CommandResult).len(), 1);
    }

    #[test]
    fn commit_broadcasts_summary() {
        let mut n = node(1);
        install_filter(&mut n, OutputFormat::ShortAssetId);
        n.tick();
        let sent = &n.queue().transport().sent;
        assert!(!sent.is_empty());
        assert_eq!(sent[0][0], MeshMsgType::FilterSummary as u8);
    }

    #[test]
    fn mac_report_filter_forwards_raw_mac() {
        let mut n = node(1);
        install_filter(&mut n, OutputFormat::MacReport);
        n.on_scan(ScannedDevice::new(TAG, -50, 37, &[]));
        n.tick();

        assert_eq!(n.tracker().records().count(), 0);
        assert_eq!(
            n.forwarder().uart().of(UartOpcode::AssetInfoMac),
            ["{\"type\":\"asset_mac\",\"mac\":\"C0:FF:EE:00:00:01\",\"stone\":1,\"rssi\":-50,\"ch\":37}\n"]
        );
    }

    #[test]
    fn scans_ignored_until_committed() {
        let mut n = node(1);
        n.on_scan(ScannedDevice::new(TAG, -50, 37, &[]));
        assert_eq!(n.tracker().records().count(), 0);
        assert!(n.sink().events.is_empty());
    }

    #[test]
    fn every_timed_out_asset_is_reported() {
        let mut config = NodeConfig::new();
        config.personal_timeout_ticks = 3;
        config.winning_timeout_ticks = 3;
        let mut n = node_with(1, config);
        install(&mut n, OutputFormat::ShortAssetId, MatchKind::Prefix, &TAG[..5]);

        for last in 0..TRACKER_RECORD_COUNT as u8 {
            let mut mac = TAG;
            mac[5] = last;
            n.on_scan(ScannedDevice::new(mac, -60, 37, &[]));
        }
        assert_eq!(n.tracker().records().count(), TRACKER_RECORD_COUNT);
        assert_eq!(n.sink().switches(), [SwitchState::On; TRACKER_RECORD_COUNT]);

        // All of them time out in the same tick
        for _ in 0..3 {
            n.tick();
        }
        let offs = n
            .sink()
            .switches()
            .iter()
            .filter(|s| **s == SwitchState::Off)
            .count();
        assert_eq!(offs, TRACKER_RECORD_COUNT);
        assert_eq!(
            n.forwarder().uart().of(UartOpcode::NearestTimeout).len(),
            TRACKER_RECORD_COUNT
        );
        assert_eq!(n.tracker().records().count(), 0);
    }

    // ── Two-node election ──

    #[test]
    fn two_nodes_hand_over_asset() {
        let mut a = node(1);
        let mut b = node(2);
        install_filter(&mut a, OutputFormat::ShortAssetId);
        install_filter(&mut b, OutputFormat::ShortAssetId);
        let x = short_asset_id(&TAG);

        // A sees X first
        a.on_scan(ScannedDevice::new(TAG, -60, 37, &[]));
        assert_eq!(a.sink().switches(), [SwitchState::On]);
        deliver(&mut a, &mut b);

        let rec = b.tracker().record(x).unwrap();
        assert_eq!(rec.winner, Some(Winner { stone: 1, rssi: -60 }));
        assert!(b.sink().switches().is_empty());
        // Identical filter sets do not diverge
        assert!(b.forwarder().uart().of(UartOpcode::FilterDivergence).is_empty());

        // B sees X closer and takes over
        b.on_scan(ScannedDevice::new(TAG, -40, 38, &[]));
        assert_eq!(b.sink().switches(), [SwitchState::On]);
        deliver(&mut b, &mut a);

        assert_eq!(a.sink().switches(), [SwitchState::On, SwitchState::Off]);
        let rec = a.tracker().record(x).unwrap();
        assert_eq!(rec.winner, Some(Winner { stone: 2, rssi: -40 }));
        assert_eq!(
            a.forwarder().uart().of(UartOpcode::NearestUpdate).last().copied(),
            Some(format!("{{\"type\":\"nearest\",\"id\":\"{}\",\"winner\":2,\"rssi\":-40}}\n", x.to_hex()).as_str())
        );
    }

    #[test]
    fn newer_foreign_filter_set_is_reported() {
        let mut a = node(1);
        let mut b = node(2);
        install_filter(&mut a, OutputFormat::ShortAssetId);
        install_filter(&mut a, OutputFormat::MacReport);
        install_filter(&mut b, OutputFormat::ShortAssetId);

        deliver(&mut a, &mut b);
        let reports = b.forwarder().uart().of(UartOpcode::FilterDivergence);
        assert!(!reports.is_empty());
        assert!(reports[0].contains("\"stone\":1,\"version\":2"));
    }

    #[test]
    fn stone_id_change_reaches_components() {
        let mut n = node(1);
        n.set_config(ConfigKey::StoneId, 5).unwrap();
        assert_eq!(n.my_id(), 5);
        assert_eq!(n.store().get(ConfigKey::StoneId), Some(5));
    }
}
