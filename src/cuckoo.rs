/// Cuckoo filter: compact approximate membership over byte keys.
///
/// Encoded form, little endian:
///
/// ```text
/// [0]      bucket_count_log2   1 << this buckets, at most 7
/// [1]      nests_per_bucket    fingerprints per bucket, at least 1
/// [2..]    fingerprints        u16 each, bucket after bucket, 0 = empty
/// ```
///
/// A key hashes to a fingerprint and a primary bucket. The alternative
/// bucket is the primary one XORed with a hash of the fingerprint, so each
/// bucket can be derived from the other while moving fingerprints around.
/// Lookups answer "maybe present" or "certainly absent".
use crate::error::{Error, Resource, Result};
use crate::util::{crc16, crc16_update};

pub const CUCKOO_HEADER_LEN: usize = 2;
pub const MAX_BUCKET_COUNT_LOG2: u8 = 7;

/// Displacements tried before an insert gives up.
const MAX_KICK_ATTEMPTS: usize = 100;

pub type Fingerprint = u16;

/// Encoded size of a filter with the given dimensions.
pub const fn cuckoo_size(bucket_count_log2: u8, nests_per_bucket: u8) -> usize {
    CUCKOO_HEADER_LEN + (1usize << bucket_count_log2) * nests_per_bucket as usize * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExtendedFingerprint {
    fingerprint: Fingerprint,
    bucket_a: usize,
    bucket_b: usize,
}

/// View over an encoded filter.
#[derive(Debug, Clone, Copy)]
pub struct CuckooFilter<B> {
    data: B,
    bucket_count: usize,
    nests: usize,
}

impl<B: AsRef<[u8]>> CuckooFilter<B> {
    /// Wrap an encoded filter, checking its length against the header.
    pub fn new(data: B) -> Result<Self> {
        let (log2, nests) = match data.as_ref() {
            [log2, nests, ..] => (*log2, *nests),
            _ => return Err(Error::InvalidArgs),
        };
        if log2 > MAX_BUCKET_COUNT_LOG2 || nests == 0 {
            return Err(Error::InvalidArgs);
        }
        if data.as_ref().len() != cuckoo_size(log2, nests) {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            data,
            bucket_count: 1 << log2,
            nests: nests as usize,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of stored fingerprints.
    pub fn len(&self) -> usize {
        (0..self.bucket_count)
            .flat_map(|bucket| (0..self.nests).map(move |nest| (bucket, nest)))
            .filter(|&(bucket, nest)| self.get(bucket, nest) != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let efp = self.fingerprint_of(key);
        self.bucket_holds(efp.bucket_a, efp.fingerprint)
            || self.bucket_holds(efp.bucket_b, efp.fingerprint)
    }

    fn fingerprint_of(&self, key: &[u8]) -> ExtendedFingerprint {
        // 0 marks an empty nest
        let fingerprint = match crc16(key) {
            0 => 1,
            fp => fp,
        };
        self.extend(fingerprint, crc16_update(0, key) as usize)
    }

    /// Both buckets a fingerprint found in `bucket` may live in.
    fn extend(&self, fingerprint: Fingerprint, bucket: usize) -> ExtendedFingerprint {
        let mask = self.bucket_count - 1;
        let bucket_a = bucket & mask;
        let bucket_b = (bucket_a ^ crc16_update(0, &fingerprint.to_le_bytes()) as usize) & mask;
        ExtendedFingerprint {
            fingerprint,
            bucket_a,
            bucket_b,
        }
    }

    fn offset(&self, bucket: usize, nest: usize) -> usize {
        CUCKOO_HEADER_LEN + (bucket * self.nests + nest) * 2
    }

    fn get(&self, bucket: usize, nest: usize) -> Fingerprint {
        let at = self.offset(bucket, nest);
        let bytes = self.data.as_ref();
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn bucket_holds(&self, bucket: usize, fingerprint: Fingerprint) -> bool {
        (0..self.nests).any(|nest| self.get(bucket, nest) == fingerprint)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> CuckooFilter<B> {
    /// Turn `data` into an empty filter. Its length must match the
    /// dimensions.
    pub fn init(mut data: B, bucket_count_log2: u8, nests_per_bucket: u8) -> Result<Self> {
        let bytes = data.as_mut();
        if bucket_count_log2 > MAX_BUCKET_COUNT_LOG2
            || nests_per_bucket == 0
            || bytes.len() != cuckoo_size(bucket_count_log2, nests_per_bucket)
        {
            return Err(Error::InvalidArgs);
        }
        bytes.fill(0);
        bytes[0] = bucket_count_log2;
        bytes[1] = nests_per_bucket;
        Self::new(data)
    }

    /// Insert a key. When both of its buckets are full, residents are
    /// pushed to their other bucket; after too many moves the insert fails
    /// and the last displaced fingerprint is lost.
    pub fn add(&mut self, key: &[u8]) -> Result<()> {
        let efp = self.fingerprint_of(key);
        if self.place(efp.bucket_a, efp.fingerprint) || self.place(efp.bucket_b, efp.fingerprint) {
            return Ok(());
        }

        let mut fingerprint = efp.fingerprint;
        let mut bucket = efp.bucket_b;
        for kick in 0..MAX_KICK_ATTEMPTS {
            let nest = kick % self.nests;
            let evicted = self.get(bucket, nest);
            self.set(bucket, nest, fingerprint);
            fingerprint = evicted;
            bucket = self.extend(fingerprint, bucket).bucket_b;
            if self.place(bucket, fingerprint) {
                return Ok(());
            }
        }
        log::warn!("cuckoo filter full after {} kicks", MAX_KICK_ATTEMPTS);
        Err(Error::CapacityExceeded(Resource::CuckooFilter))
    }

    fn set(&mut self, bucket: usize, nest: usize, fingerprint: Fingerprint) {
        let at = self.offset(bucket, nest);
        self.data.as_mut()[at..at + 2].copy_from_slice(&fingerprint.to_le_bytes());
    }

    fn place(&mut self, bucket: usize, fingerprint: Fingerprint) -> bool {
        match (0..self.nests).find(|&nest| self.get(bucket, nest) == 0) {
            Some(nest) => {
                self.set(bucket, nest, fingerprint);
                true
            }
            None => false,
        }
    }
}
