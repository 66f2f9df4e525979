/// One-byte RSSI + advertising channel encoding used in records and on
/// the mesh.
///
/// Layout: bits 0..2 channel (0 unknown, 1..=3 for channels 37..=39),
/// bits 2..8 the absolute RSSI halved, saturating at 63 (-126 dBm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressedRssi(u8);

/// Lowest RSSI a compressed value can hold.
pub const MIN_RSSI: i8 = -126;

impl CompressedRssi {
    pub fn new(rssi: i8, channel: u8) -> Self {
        let abs = (rssi as i16).clamp(MIN_RSSI as i16, 0).unsigned_abs();
        let halved = (abs / 2).min(63) as u8;
        Self((halved << 2) | compress_channel(channel))
    }

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// RSSI in dBm, always even.
    pub fn rssi(&self) -> i8 {
        -(((self.0 >> 2) as i16) * 2) as i8
    }

    /// Advertising channel (37, 38, 39), or 0 when unknown.
    pub fn channel(&self) -> u8 {
        decompress_channel(self.0 & 0x03)
    }
}

pub fn compress_channel(channel: u8) -> u8 {
    match channel {
        37 => 1,
        38 => 2,
        39 => 3,
        _ => 0,
    }
}

pub fn decompress_channel(compressed: u8) -> u8 {
    match compressed {
        1 => 37,
        2 => 38,
        3 => 39,
        _ => 0,
    }
}
