/// Wire formats: mesh messages between nodes, JSON messages to the UART
/// host, and control commands from the controller.
///
/// Mesh packets are `[type][payload]`, little endian, at most
/// `MAX_MESH_PAYLOAD_SIZE` payload bytes so they are never segmented.
/// UART messages are single-line JSON documents built with `heapless`
/// types for no_std/no-alloc operation.
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::error::ResultCode;
use crate::rssi::{compress_channel, decompress_channel, CompressedRssi};

/// Node identifier. 0 means unknown.
pub type StoneId = u8;

/// Vendor opcode of the mesh model message.
pub const MESH_OPCODE_MSG: u16 = 0xC0;

/// Bluetooth SIG company id used for the vendor model.
pub const CROWNSTONE_COMPANY_ID: u16 = 0x038E;

/// Largest unsegmented access payload minus the vendor opcode and type byte.
pub const MAX_MESH_PAYLOAD_SIZE: usize = 10;

pub type MeshPayload = Vec<u8, MAX_MESH_PAYLOAD_SIZE>;

/// Encoded packet: type byte plus payload.
pub type MeshPacket = Vec<u8, { MAX_MESH_PAYLOAD_SIZE + 1 }>;

/// Three-byte asset identifier derived by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortAssetId(pub [u8; 3]);

/// Hex form of a short asset id ("a1b2c3")
pub type AssetIdString = String<6>;

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

impl ShortAssetId {
    /// Id used to find queued mesh items for this asset. Distinct per asset.
    pub fn queue_id(&self) -> u64 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0]) as u64
    }

    pub fn to_hex(&self) -> AssetIdString {
        let mut out = [0u8; 6];
        let mut s = AssetIdString::new();
        if hex::encode_to_slice(self.0, &mut out).is_ok() {
            if let Ok(text) = core::str::from_utf8(&out) {
                let _ = s.push_str(text);
            }
        }
        s
    }
}

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" string
pub fn format_mac(mac: &[u8; 6], buf: &mut MacString) {
    use core::fmt::Write;
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

// ── Mesh messages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeshMsgType {
    AssetInfoMac = 0x20,
    AssetInfoId = 0x21,
    FilterSummary = 0x22,
}

impl MeshMsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x20 => Some(MeshMsgType::AssetInfoMac),
            0x21 => Some(MeshMsgType::AssetInfoId),
            0x22 => Some(MeshMsgType::FilterSummary),
            _ => None,
        }
    }
}

/// An asset relayed by MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetReportMac {
    pub rssi: CompressedRssi,
    pub mac: [u8; 6],
}

/// An asset reported by short id, also the nearest-node election report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetReportId {
    pub asset_id: ShortAssetId,
    pub filter_bitmask: u8,
    pub rssi: i8,
    /// Advertising channel (37..=39), 0 when unknown
    pub channel: u8,
}

/// Master filter state announced after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSummaryMsg {
    pub master_version: u16,
    pub master_crc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshReport {
    Mac(AssetReportMac),
    Id(AssetReportId),
    FilterSummary(FilterSummaryMsg),
}

impl MeshReport {
    pub fn msg_type(&self) -> MeshMsgType {
        match self {
            MeshReport::Mac(_) => MeshMsgType::AssetInfoMac,
            MeshReport::Id(_) => MeshMsgType::AssetInfoId,
            MeshReport::FilterSummary(_) => MeshMsgType::FilterSummary,
        }
    }

    pub fn encode(&self) -> MeshPayload {
        let mut out = MeshPayload::new();
        // Every message fits in MAX_MESH_PAYLOAD_SIZE, pushes cannot fail.
        match self {
            MeshReport::Mac(m) => {
                let _ = out.push(m.rssi.raw());
                let _ = out.extend_from_slice(&m.mac);
            }
            MeshReport::Id(m) => {
                let _ = out.extend_from_slice(&m.asset_id.0);
                let _ = out.push(m.filter_bitmask);
                let _ = out.push(m.rssi as u8);
                let _ = out.push(compress_channel(m.channel));
            }
            MeshReport::FilterSummary(m) => {
                let _ = out.extend_from_slice(&m.master_version.to_le_bytes());
                let _ = out.extend_from_slice(&m.master_crc.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(msg_type: MeshMsgType, payload: &[u8]) -> Option<Self> {
        match msg_type {
            MeshMsgType::AssetInfoMac => {
                let [rssi, mac @ ..] = payload else {
                    return None;
                };
                Some(MeshReport::Mac(AssetReportMac {
                    rssi: CompressedRssi::from_raw(*rssi),
                    mac: mac.try_into().ok()?,
                }))
            }
            MeshMsgType::AssetInfoId => {
                let [a, b, c, mask, rssi, channel] = payload else {
                    return None;
                };
                Some(MeshReport::Id(AssetReportId {
                    asset_id: ShortAssetId([*a, *b, *c]),
                    filter_bitmask: *mask,
                    rssi: *rssi as i8,
                    channel: decompress_channel(*channel),
                }))
            }
            MeshMsgType::FilterSummary => {
                let [v0, v1, c0, c1] = payload else {
                    return None;
                };
                Some(MeshReport::FilterSummary(FilterSummaryMsg {
                    master_version: u16::from_le_bytes([*v0, *v1]),
                    master_crc: u16::from_le_bytes([*c0, *c1]),
                }))
            }
        }
    }
}

/// A mesh message delivered by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    pub src: StoneId,
    pub msg_type: u8,
    pub payload: MeshPayload,
    pub rssi: i8,
    pub hops: u8,
}

impl MeshMessage {
    /// Split a received `[type][payload]` packet.
    pub fn decode(src: StoneId, packet: &[u8], rssi: i8, hops: u8) -> Option<Self> {
        let (&msg_type, payload) = packet.split_first()?;
        Some(Self {
            src,
            msg_type,
            payload: Vec::from_slice(payload).ok()?,
            rssi,
            hops,
        })
    }

    pub fn report(&self) -> Option<MeshReport> {
        MeshReport::decode(MeshMsgType::from_u8(self.msg_type)?, &self.payload)
    }
}

// ── UART messages ──────────────────────────────────────────────────────

/// Opcodes of the messages written to the UART host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UartOpcode {
    AssetInfoMac = 0x0190,
    AssetInfoId = 0x0191,
    NearestUpdate = 0x0192,
    NearestTimeout = 0x0193,
    FilterDivergence = 0x0194,
    CommandResult = 0x0195,
    FilterSummaries = 0x0196,
}

/// Per-filter summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub id: u8,
    pub version: u16,
    pub crc: u16,
}

/// Maximum number of filters the parser can hold.
pub const MAX_FILTER_IDS: usize = 8;

pub type FilterSummaryList = Vec<FilterSummary, MAX_FILTER_IDS>;

/// Messages written to the UART host
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum UartMessage<'a> {
    /// Asset relayed by MAC, seen by `stone`
    #[serde(rename = "asset_mac")]
    AssetMac {
        mac: &'a MacString,
        stone: StoneId,
        rssi: i8,
        ch: u8,
    },
    /// Asset reported by short id, seen by `stone`
    #[serde(rename = "asset_id")]
    AssetId {
        id: &'a AssetIdString,
        stone: StoneId,
        mask: u8,
        rssi: i8,
        ch: u8,
    },
    /// Locally believed nearest node changed
    #[serde(rename = "nearest")]
    Nearest {
        id: &'a AssetIdString,
        winner: StoneId,
        rssi: i8,
    },
    /// Winning record for an asset timed out
    #[serde(rename = "timeout")]
    Timeout { id: &'a AssetIdString },
    /// A peer announced a newer, different filter set
    #[serde(rename = "filter_divergence")]
    FilterDivergence {
        stone: StoneId,
        version: u16,
        crc: u16,
        local_version: u16,
        local_crc: u16,
    },
    /// Result of a control command
    #[serde(rename = "result")]
    CommandResult { cmd: &'static str, code: ResultCode },
    /// Reply to get_filter_summaries
    #[serde(rename = "filter_summaries")]
    FilterSummaries {
        version: u16,
        crc: u16,
        #[serde(rename = "modifying")]
        modification_in_progress: bool,
        filters: &'a FilterSummaryList,
    },
}

impl UartMessage<'_> {
    pub fn opcode(&self) -> UartOpcode {
        match self {
            UartMessage::AssetMac { .. } => UartOpcode::AssetInfoMac,
            UartMessage::AssetId { .. } => UartOpcode::AssetInfoId,
            UartMessage::Nearest { .. } => UartOpcode::NearestUpdate,
            UartMessage::Timeout { .. } => UartOpcode::NearestTimeout,
            UartMessage::FilterDivergence { .. } => UartOpcode::FilterDivergence,
            UartMessage::CommandResult { .. } => UartOpcode::CommandResult,
            UartMessage::FilterSummaries { .. } => UartOpcode::FilterSummaries,
        }
    }
}

// ── Control commands ───────────────────────────────────────────────────

/// Largest filter chunk accepted in one upload command.
pub const MAX_CHUNK_SIZE: usize = 64;

pub type ChunkData = Vec<u8, MAX_CHUNK_SIZE>;

/// Filter management commands from the controller.
///
/// Deserialized manually via [`RawCommand`] in `comm::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    UploadFilter {
        filter_id: u8,
        total_size: u16,
        offset: u16,
        data: ChunkData,
    },
    RemoveFilter {
        filter_id: u8,
    },
    CommitFilterChanges,
    GetFilterSummaries,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::UploadFilter { .. } => "upload_filter",
            ControlCommand::RemoveFilter { .. } => "remove_filter",
            ControlCommand::CommitFilterChanges => "commit",
            ControlCommand::GetFilterSummaries => "get_filter_summaries",
        }
    }
}

/// Wire format for control commands: a flat struct that `serde_json_core` can
/// deserialize without `deserialize_any`. Converted to [`ControlCommand`] in
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: String<24>,
    #[serde(default)]
    pub filter_id: Option<u8>,
    #[serde(default)]
    pub total_size: Option<u16>,
    #[serde(default)]
    pub offset: Option<u16>,
    /// Hex-encoded chunk bytes
    #[serde(default)]
    pub data: Option<String<{ MAX_CHUNK_SIZE * 2 }>>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 384;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Mesh messages ───────────────────────────────────────────────

    #[test]
    fn asset_id_report_layout() {
        let report = MeshReport::Id(AssetReportId {
            asset_id: ShortAssetId([0xA1, 0xB2, 0xC3]),
            filter_bitmask: 0b101,
            rssi: -60,
            channel: 38,
        });
        let payload = report.encode();
        assert_eq!(payload.as_slice(), &[0xA1, 0xB2, 0xC3, 0b101, (-60i8) as u8, 2]);
        assert_eq!(
            MeshReport::decode(MeshMsgType::AssetInfoId, &payload),
            Some(report)
        );
    }

    #[test]
    fn mac_report_layout() {
        let rssi = CompressedRssi::new(-70, 39);
        let report = MeshReport::Mac(AssetReportMac {
            rssi,
            mac: [1, 2, 3, 4, 5, 6],
        });
        let payload = report.encode();
        assert_eq!(payload.len(), 7);
        assert_eq!(payload[0], rssi.raw());
        assert_eq!(report.msg_type(), MeshMsgType::AssetInfoMac);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(MeshReport::decode(MeshMsgType::AssetInfoId, &[1, 2, 3]).is_none());
        assert!(MeshReport::decode(MeshMsgType::AssetInfoMac, &[1, 2, 3]).is_none());
        assert!(MeshReport::decode(MeshMsgType::FilterSummary, &[]).is_none());
    }

    #[test]
    fn received_packet_splits_type() {
        let packet = [0x22, 0x05, 0x00, 0x34, 0x12];
        let msg = MeshMessage::decode(7, &packet, -80, 2).unwrap();
        assert_eq!(msg.src, 7);
        assert_eq!(
            msg.report(),
            Some(MeshReport::FilterSummary(FilterSummaryMsg {
                master_version: 5,
                master_crc: 0x1234,
            }))
        );
        assert!(MeshMessage::decode(7, &[], -80, 0).is_none());
    }

    #[test]
    fn unknown_type_has_no_report() {
        let msg = MeshMessage::decode(7, &[0x99, 1, 2], -80, 0).unwrap();
        assert!(msg.report().is_none());
    }

    // ── UART messages ───────────────────────────────────────────────

    #[test]
    fn asset_id_hex() {
        assert_eq!(ShortAssetId([0xA1, 0x0B, 0xFF]).to_hex().as_str(), "a10bff");
    }

    #[test]
    fn serialize_nearest_message() {
        let id = ShortAssetId([1, 2, 3]).to_hex();
        let msg = UartMessage::Nearest {
            id: &id,
            winner: 4,
            rssi: -52,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"nearest""#));
        assert!(json.contains(r#""id":"010203""#));
        assert!(json.contains(r#""winner":4"#));
        assert_eq!(msg.opcode(), UartOpcode::NearestUpdate);
    }

    #[test]
    fn serialize_asset_mac_message() {
        let mut mac = MacString::new();
        format_mac(&[0xB4, 0x1E, 0x52, 0xAB, 0xCD, 0xEF], &mut mac);
        let msg = UartMessage::AssetMac {
            mac: &mac,
            stone: 12,
            rssi: -45,
            ch: 37,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"asset_mac""#));
        assert!(json.contains(r#""mac":"B4:1E:52:AB:CD:EF""#));
        assert!(json.contains(r#""stone":12"#));
    }

    #[test]
    fn serialize_result_message() {
        let msg = UartMessage::CommandResult {
            cmd: "commit",
            code: ResultCode::InconsistentState,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""code":"inconsistent_state""#));
    }

    #[test]
    fn serialize_filter_summaries() {
        let mut filters = FilterSummaryList::new();
        let _ = filters.push(FilterSummary {
            id: 1,
            version: 2,
            crc: 0xBEEF,
        });
        let msg = UartMessage::FilterSummaries {
            version: 3,
            crc: 0x1234,
            modification_in_progress: false,
            filters: &filters,
        };
        let mut buf = [0u8; 256];
        let len = serde_json_core::to_slice(&msg, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""filters":[{"id":1,"version":2,"crc":48879}]"#));
        assert!(json.contains(r#""modifying":false"#));
    }

    // ── Version constant ────────────────────────────────────────────

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(
            parts.len(),
            3,
            "VERSION should be semver (major.minor.patch)"
        );
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
