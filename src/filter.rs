/// Tracking filter payloads and advertisement matching.
///
/// A filter payload is a compact matcher description uploaded by the
/// controller:
///
/// ```text
/// [0]      protocol     must be 0
/// [1..3]   version      u16 LE
/// [3]      input        0 = MAC, 1 = AD field (type in [4]), 2 = manufacturer data
/// [4]      input_arg    AD type for input 1
/// [5]      output       0 = MAC report, 1 = short asset id
/// [6]      min_rssi     i8, -128 disables the floor
/// [7]      match_kind   0 = exact, 1 = prefix, 2 = range, 3 = cuckoo
/// [8]      entry_len    1..=31, 2 for cuckoo
/// [9..]    entries      k * entry_len bytes, k >= 1
/// ```
///
/// Range entries come in `(lo, hi)` pairs; the first `entry_len` bytes of
/// the field must lie in `lo..=hi`, compared byte-wise. For cuckoo the
/// entries are one encoded [`CuckooFilter`] queried with the whole field.
///
/// Filters are evaluated in place; the arena owns the bytes.
use crate::cuckoo::CuckooFilter;
use crate::error::{Error, Result};
use crate::protocol::ShortAssetId;
use crate::scanner::ScannedDevice;
use crate::util::hash24;

pub const FILTER_PROTOCOL: u8 = 0;
pub const FILTER_HEADER_LEN: usize = 9;
pub const MAX_ENTRY_LEN: usize = 31;

/// `min_rssi` value that disables the RSSI floor.
pub const NO_RSSI_FLOOR: i8 = i8::MIN;

/// Which advertisement field a filter looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterInput {
    MacAddress,
    AdData { ad_type: u8 },
    ManufacturerData,
}

/// How an accepted advertisement is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Relay the MAC address to the hub, no nearest-node election.
    MacReport,
    /// Track by short asset id and run the nearest-node election.
    ShortAssetId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
    Range,
    Cuckoo,
}

/// Parsed view over a filter payload.
#[derive(Debug, Clone, Copy)]
pub struct TrackingFilter<'a> {
    pub version: u16,
    pub input: FilterInput,
    pub output: OutputFormat,
    pub min_rssi: i8,
    pub match_kind: MatchKind,
    entry_len: usize,
    entries: &'a [u8],
}

impl<'a> TrackingFilter<'a> {
    /// Validate and parse a complete payload.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() <= FILTER_HEADER_LEN || payload[0] != FILTER_PROTOCOL {
            return Err(Error::InvalidArgs);
        }

        let version = u16::from_le_bytes([payload[1], payload[2]]);
        let input = match payload[3] {
            0 => FilterInput::MacAddress,
            1 => FilterInput::AdData {
                ad_type: payload[4],
            },
            2 => FilterInput::ManufacturerData,
            _ => return Err(Error::InvalidArgs),
        };
        let output = match payload[5] {
            0 => OutputFormat::MacReport,
            1 => OutputFormat::ShortAssetId,
            _ => return Err(Error::InvalidArgs),
        };
        let min_rssi = payload[6] as i8;
        let match_kind = match payload[7] {
            0 => MatchKind::Exact,
            1 => MatchKind::Prefix,
            2 => MatchKind::Range,
            3 => MatchKind::Cuckoo,
            _ => return Err(Error::InvalidArgs),
        };
        let entry_len = payload[8] as usize;
        if entry_len == 0 || entry_len > MAX_ENTRY_LEN {
            return Err(Error::InvalidArgs);
        }

        let entries = &payload[FILTER_HEADER_LEN..];
        match match_kind {
            MatchKind::Exact | MatchKind::Prefix if entries.len() % entry_len != 0 => {
                return Err(Error::InvalidArgs)
            }
            MatchKind::Range if entries.len() % (2 * entry_len) != 0 => {
                return Err(Error::InvalidArgs)
            }
            MatchKind::Cuckoo => {
                if entry_len != 2 {
                    return Err(Error::InvalidArgs);
                }
                CuckooFilter::new(entries)?;
            }
            _ => {}
        }
        if input == FilterInput::MacAddress && match_kind == MatchKind::Exact && entry_len != 6 {
            return Err(Error::InvalidArgs);
        }

        Ok(Self {
            version,
            input,
            output,
            min_rssi,
            match_kind,
            entry_len,
            entries,
        })
    }

    /// Read only the version field, for summaries of filters that may still
    /// be incomplete.
    pub fn peek_version(payload: &[u8]) -> u16 {
        match payload {
            [_, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        }
    }

    /// Entries, range pairs or stored fingerprints, depending on the kind.
    pub fn entry_count(&self) -> usize {
        match self.match_kind {
            MatchKind::Exact | MatchKind::Prefix => self.entries.len() / self.entry_len,
            MatchKind::Range => self.entries.len() / (2 * self.entry_len),
            MatchKind::Cuckoo => CuckooFilter::new(self.entries).map_or(0, |f| f.len()),
        }
    }

    /// Evaluate this filter against a scanned advertisement.
    ///
    /// Returns the advertisement field that matched.
    pub fn matches<'d>(&self, device: &'d ScannedDevice) -> Option<&'d [u8]> {
        if self.min_rssi != NO_RSSI_FLOOR && device.rssi < self.min_rssi {
            return None;
        }

        let field = self.extract(device)?;
        let len = self.entry_len;
        let hit = match self.match_kind {
            MatchKind::Exact => self.entries.chunks_exact(len).any(|entry| field == entry),
            MatchKind::Prefix => self.entries.chunks_exact(len).any(|entry| field.starts_with(entry)),
            MatchKind::Range => field.get(..len).is_some_and(|key| {
                self.entries.chunks_exact(2 * len).any(|pair| {
                    let (lo, hi) = pair.split_at(len);
                    lo <= key && key <= hi
                })
            }),
            MatchKind::Cuckoo => CuckooFilter::new(self.entries).is_ok_and(|f| f.contains(field)),
        };
        hit.then_some(field)
    }

    fn extract<'d>(&self, device: &'d ScannedDevice) -> Option<&'d [u8]> {
        match self.input {
            FilterInput::MacAddress => Some(&device.mac[..]),
            FilterInput::AdData { ad_type } => device.find_ad(ad_type),
            FilterInput::ManufacturerData => device.manufacturer_data(),
        }
    }
}

/// Derive the short asset id from the field a filter matched on.
///
/// Every node computes the same id for the same advertisement.
pub fn short_asset_id(field: &[u8]) -> ShortAssetId {
    ShortAssetId(hash24(field))
}

/// Test and tooling helper: encode a filter payload into `buf`.
/// Returns the number of bytes written.
#[allow(clippy::too_many_arguments)]
pub fn encode_filter(
    buf: &mut [u8],
    version: u16,
    input: FilterInput,
    output: OutputFormat,
    min_rssi: i8,
    match_kind: MatchKind,
    entry_len: u8,
    entries: &[u8],
) -> Option<usize> {
    let total = FILTER_HEADER_LEN + entries.len();
    if buf.len() < total {
        return None;
    }
    let (input_code, input_arg) = match input {
        FilterInput::MacAddress => (0, 0),
        FilterInput::AdData { ad_type } => (1, ad_type),
        FilterInput::ManufacturerData => (2, 0),
    };
    let v = version.to_le_bytes();
    buf[..FILTER_HEADER_LEN].copy_from_slice(&[
        FILTER_PROTOCOL,
        v[0],
        v[1],
        input_code,
        input_arg,
        match output {
            OutputFormat::MacReport => 0,
            OutputFormat::ShortAssetId => 1,
        },
        min_rssi as u8,
        match match_kind {
            MatchKind::Exact => 0,
            MatchKind::Prefix => 1,
            MatchKind::Range => 2,
            MatchKind::Cuckoo => 3,
        },
        entry_len,
    ]);
    buf[FILTER_HEADER_LEN..total].copy_from_slice(entries);
    Some(total)
}
