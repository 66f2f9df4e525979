/// Communication layer: UART NDJSON transport to the host.
///
/// Asset reports, nearest-node updates and command results are streamed
/// as newline-delimited JSON. Filter management commands arrive on the
/// same link, one JSON object per line.
use crate::protocol::{ChunkData, ControlCommand, RawCommand, UartMessage, UartOpcode, MAX_MSG_LEN};

/// Output side of the UART link.
pub trait UartSink {
    fn write_message(&mut self, opcode: UartOpcode, data: &[u8]);
}

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a UartMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &UartMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Serialize `msg` and hand it to the sink with its opcode.
pub fn write_uart(sink: &mut impl UartSink, msg: &UartMessage) {
    let mut buf = [0u8; MAX_MSG_LEN];
    match serialize_message(msg, &mut buf) {
        Some(len) => sink.write_message(msg.opcode(), &buf[..len]),
        None => log::warn!("failed to serialize uart message {:?}", msg.opcode()),
    }
}

/// Deserialize a ControlCommand from a JSON byte slice.
pub fn parse_command(data: &[u8]) -> Option<ControlCommand> {
    // Strip trailing newline/whitespace
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    match raw.cmd.as_str() {
        "upload_filter" => {
            let hex_data = raw.data?;
            let mut bytes = [0u8; crate::protocol::MAX_CHUNK_SIZE];
            let len = hex_data.len() / 2;
            hex::decode_to_slice(hex_data.as_bytes(), &mut bytes[..len]).ok()?;
            Some(ControlCommand::UploadFilter {
                filter_id: raw.filter_id?,
                total_size: raw.total_size?,
                offset: raw.offset.unwrap_or(0),
                data: ChunkData::from_slice(&bytes[..len]).ok()?,
            })
        }
        "remove_filter" => Some(ControlCommand::RemoveFilter {
            filter_id: raw.filter_id?,
        }),
        "commit" => Some(ControlCommand::CommitFilterChanges),
        "get_filter_summaries" => Some(ControlCommand::GetFilterSummaries),
        other => {
            log::warn!("unknown command '{}'", other);
            None
        }
    }
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Host command reader.
/// Accumulates bytes until a newline is found, then yields the line.
/// A line longer than the buffer is dropped as a whole.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
            discarding: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let len = self.pos;
            let complete = len > 0 && !self.discarding;
            self.pos = 0;
            self.discarding = false;
            complete.then(|| &self.buf[..len])
        } else if self.discarding {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            log::warn!("command line longer than {} bytes, dropping it", MAX_MSG_LEN);
            self.pos = 0;
            self.discarding = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|&b| !matches!(b, b' ' | b'\n' | b'\r' | b'\t'))
        .map_or(0, |i| i + 1);
    &data[..end]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::protocol::{format_mac, MacString, ShortAssetId};

    /// Collects everything written to the UART.
    #[derive(Default)]
    pub(crate) struct RecordingUart {
        pub lines: std::vec::Vec<(UartOpcode, std::string::String)>,
    }

    impl UartSink for RecordingUart {
        fn write_message(&mut self, opcode: UartOpcode, data: &[u8]) {
            let text = core::str::from_utf8(data).unwrap().to_owned();
            self.lines.push((opcode, text));
        }
    }

    impl RecordingUart {
        pub fn of(&self, opcode: UartOpcode) -> std::vec::Vec<&str> {
            self.lines
                .iter()
                .filter(|(op, _)| *op == opcode)
                .map(|(_, l)| l.as_str())
                .collect()
        }
    }

    // ── Serialization ──

    #[test]
    fn serialize_asset_mac() {
        let mut mac = MacString::new();
        format_mac(&[0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22], &mut mac);
        let msg = UartMessage::AssetMac {
            mac: &mac,
            stone: 3,
            rssi: -60,
            ch: 37,
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = serialize_message(&msg, &mut buf).unwrap();
        assert_eq!(
            core::str::from_utf8(&buf[..len]).unwrap(),
            "{\"type\":\"asset_mac\",\"mac\":\"AA:BB:CC:00:11:22\",\"stone\":3,\"rssi\":-60,\"ch\":37}\n"
        );
    }

    #[test]
    fn serialize_command_result() {
        let msg = UartMessage::CommandResult {
            cmd: "commit",
            code: ResultCode::InconsistentState,
        };
        let mut buf = [0u8; MAX_MSG_LEN];
        let len = serialize_message(&msg, &mut buf).unwrap();
        assert_eq!(
            core::str::from_utf8(&buf[..len]).unwrap(),
            "{\"type\":\"result\",\"cmd\":\"commit\",\"code\":\"inconsistent_state\"}\n"
        );
    }

    #[test]
    fn write_uart_tags_opcode() {
        let id = ShortAssetId([1, 2, 3]).to_hex();
        let mut uart = RecordingUart::default();
        write_uart(&mut uart, &UartMessage::Timeout { id: &id });
        assert_eq!(uart.of(UartOpcode::NearestTimeout), ["{\"type\":\"timeout\",\"id\":\"010203\"}\n"]);
    }

    #[test]
    fn serialize_into_small_buffer_fails() {
        let msg = UartMessage::CommandResult {
            cmd: "commit",
            code: ResultCode::Ok,
        };
        let mut buf = [0u8; 8];
        assert!(serialize_message(&msg, &mut buf).is_none());
    }

    // ── Command parsing ──

    #[test]
    fn parse_upload() {
        let cmd = parse_command(
            b"{\"cmd\":\"upload_filter\",\"filter_id\":2,\"total_size\":20,\"offset\":4,\"data\":\"00ff10\"}\n",
        )
        .unwrap();
        assert_eq!(
            cmd,
            ControlCommand::UploadFilter {
                filter_id: 2,
                total_size: 20,
                offset: 4,
                data: ChunkData::from_slice(&[0x00, 0xFF, 0x10]).unwrap(),
            }
        );
    }

    #[test]
    fn parse_simple_commands() {
        assert_eq!(
            parse_command(b"{\"cmd\":\"remove_filter\",\"filter_id\":7}"),
            Some(ControlCommand::RemoveFilter { filter_id: 7 })
        );
        assert_eq!(
            parse_command(b"{\"cmd\":\"commit\"}\r\n"),
            Some(ControlCommand::CommitFilterChanges)
        );
        assert_eq!(
            parse_command(b"{\"cmd\":\"get_filter_summaries\"}"),
            Some(ControlCommand::GetFilterSummaries)
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(parse_command(b""), None);
        assert_eq!(parse_command(b"  \n"), None);
        assert_eq!(parse_command(b"not json"), None);
        assert_eq!(parse_command(b"{\"cmd\":\"reboot\"}"), None);
        // Missing filter id
        assert_eq!(parse_command(b"{\"cmd\":\"remove_filter\"}"), None);
        // Odd hex length
        assert_eq!(
            parse_command(b"{\"cmd\":\"upload_filter\",\"filter_id\":1,\"total_size\":4,\"data\":\"abc\"}"),
            None
        );
        // Not hex
        assert_eq!(
            parse_command(b"{\"cmd\":\"upload_filter\",\"filter_id\":1,\"total_size\":4,\"data\":\"zz\"}"),
            None
        );
    }

    // ── LineReader ──

    #[test]
    fn line_reader_splits_lines() {
        let mut reader = LineReader::new();
        let mut lines = std::vec::Vec::new();
        for &b in b"{\"cmd\":\"commit\"}\r\n\n{\"cmd\":\"x\"}\n" {
            if let Some(line) = reader.feed(b) {
                lines.push(line.to_vec());
            }
        }
        assert_eq!(lines, [b"{\"cmd\":\"commit\"}".to_vec(), b"{\"cmd\":\"x\"}".to_vec()]);
    }

    #[test]
    fn line_reader_drops_overlong_line() {
        let mut reader = LineReader::new();
        for _ in 0..MAX_MSG_LEN {
            assert!(reader.feed(b'a').is_none());
        }
        // The tail of the long line is not a line of its own
        for &b in b"{\"cmd\":\"commit\"}" {
            assert!(reader.feed(b).is_none());
        }
        assert_eq!(reader.feed(b'\r'), None);
        assert_eq!(reader.feed(b'\n'), None);

        let mut lines = std::vec::Vec::new();
        for &b in b"{\"cmd\":\"commit\"}\n" {
            if let Some(line) = reader.feed(b) {
                lines.push(line.to_vec());
            }
        }
        assert_eq!(lines, [b"{\"cmd\":\"commit\"}".to_vec()]);
    }

    #[test]
    fn line_reader_accepts_full_buffer() {
        let mut reader = LineReader::new();
        for _ in 0..MAX_MSG_LEN {
            reader.feed(b'a');
        }
        assert_eq!(reader.feed(b'\n').map(|l| l.len()), Some(MAX_MSG_LEN));
    }

    #[test]
    fn trim() {
        assert_eq!(trim_trailing_whitespace(b"ab \t\r\n"), b"ab");
        assert_eq!(trim_trailing_whitespace(b"\n\n"), b"");
    }
}
