/// Small numeric helpers: CRC-16, lollipop sequence numbers and the
/// 24-bit hash used for short asset ids.

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), bitwise.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0xFFFF, data)
}

/// Continue a CRC-16 computation over more data.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// FNV-1a folded down to 24 bits.
pub fn hash24(data: &[u8]) -> [u8; 3] {
    let mut h: u32 = 0x811C_9DC5;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    let folded = (h >> 24) ^ (h & 0x00FF_FFFF);
    let bytes = folded.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

/// Lollipop sequence number.
///
/// `0` is the stick: the value of a counter that was never incremented.
/// Incrementing walks the circle `1..=u16::MAX` and wraps back to 1, so
/// a reset is always distinguishable from a wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lollipop(u16);

impl Lollipop {
    pub const INITIAL: u16 = 0;
    const CIRCLE_START: u16 = 1;
    const CIRCLE_SIZE: u32 = u16::MAX as u32;

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }

    pub const fn is_initial(&self) -> bool {
        self.0 == Self::INITIAL
    }

    pub fn increment(&mut self) -> u16 {
        self.0 = Self::next(self.0);
        self.0
    }

    pub const fn next(value: u16) -> u16 {
        if value == u16::MAX {
            Self::CIRCLE_START
        } else {
            value + 1
        }
    }

    /// True when `self` is newer than `other`.
    ///
    /// The stick is older than any value on the circle. On the circle the
    /// value that is less than half a revolution ahead is the newer one.
    pub fn is_newer_than(&self, other: &Lollipop) -> bool {
        match (self.is_initial(), other.is_initial()) {
            (true, _) => false,
            (false, true) => true,
            (false, false) => {
                let a = (self.0 - Self::CIRCLE_START) as u32;
                let b = (other.0 - Self::CIRCLE_START) as u32;
                let diff = (a + Self::CIRCLE_SIZE - b) % Self::CIRCLE_SIZE;
                diff != 0 && diff < Self::CIRCLE_SIZE / 2
            }
        }
    }
}
