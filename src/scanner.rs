/// Scanned BLE advertisements and AD structure parsing.
///
/// AD structure format: [length] [type] [data...]
/// Types the filters care about:
///   0x02/0x03 = Incomplete/Complete list of 16-bit service UUIDs
///   0x08/0x09 = Shortened/Complete local name
///   0x16      = Service data (16-bit UUID)
///   0xFF      = Manufacturer specific data (first 2 bytes = company ID, little-endian)
use heapless::Vec;

/// Maximum legacy advertising payload.
pub const MAX_ADV_DATA_LEN: usize = 31;

pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// A scanned advertisement as delivered by the scanner collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub mac: [u8; 6],
    pub rssi: i8,
    /// Advertising channel (37..=39), 0 when unknown
    pub channel: u8,
    pub data: Vec<u8, MAX_ADV_DATA_LEN>,
}

impl ScannedDevice {
    /// Build from raw report fields. Advertising data beyond 31 bytes is
    /// truncated.
    pub fn new(mac: [u8; 6], rssi: i8, channel: u8, ad_data: &[u8]) -> Self {
        let len = ad_data.len().min(MAX_ADV_DATA_LEN);
        let mut data = Vec::new();
        let _ = data.extend_from_slice(&ad_data[..len]);
        Self {
            mac,
            rssi,
            channel,
            data,
        }
    }

    pub fn ad_structures(&self) -> AdStructures<'_> {
        AdStructures {
            data: &self.data,
            pos: 0,
        }
    }

    /// Payload of the first AD structure of the given type.
    pub fn find_ad(&self, ad_type: u8) -> Option<&[u8]> {
        self.ad_structures()
            .find(|&(t, _)| t == ad_type)
            .map(|(_, data)| data)
    }

    /// Manufacturer specific data including the leading company id.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.find_ad(AD_TYPE_MANUFACTURER_DATA)
            .filter(|data| data.len() >= 2)
    }

    /// Manufacturer company ID, 0 if not present.
    pub fn manufacturer_id(&self) -> u16 {
        self.manufacturer_data()
            .map(|data| u16::from_le_bytes([data[0], data[1]]))
            .unwrap_or(0)
    }
}

/// Iterator over `(ad_type, data)` pairs. Stops at the first malformed
/// structure.
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        let len = *data.get(self.pos)? as usize;
        if len == 0 || self.pos + 1 + len > data.len() {
            self.pos = data.len();
            return None;
        }

        let ad_type = data[self.pos + 1];
        let payload = &data[self.pos + 2..self.pos + 1 + len];
        self.pos += 1 + len;
        Some((ad_type, payload))
    }
}
