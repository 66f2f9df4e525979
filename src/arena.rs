/// Contiguous byte arena holding every allocated filter payload.
///
/// Payloads are laid out back to back in `filter_id` order with no gaps.
/// The index mirrors that order, so `index[i].offset` is the sum of the
/// sizes before it. Allocation and deallocation shift trailing payloads
/// inside a single call.
use heapless::Vec;

use crate::error::{Error, Resource, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSlot {
    pub filter_id: u8,
    pub offset: usize,
    pub size: usize,
    /// CRC over the payload, valid once committed.
    pub crc: u16,
    pub committed: bool,
}

pub struct FilterArena<const CAP: usize, const MAX: usize> {
    buf: [u8; CAP],
    index: Vec<FilterSlot, MAX>,
}

impl<const CAP: usize, const MAX: usize> FilterArena<CAP, MAX> {
    pub const fn new() -> Self {
        Self {
            buf: [0; CAP],
            index: Vec::new(),
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.index.last().map_or(0, |s| s.offset + s.size)
    }

    pub fn free(&self) -> usize {
        CAP - self.used()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn slots(&self) -> &[FilterSlot] {
        &self.index
    }

    pub fn slots_mut(&mut self) -> &mut [FilterSlot] {
        &mut self.index
    }

    pub fn find(&self, filter_id: u8) -> Option<&FilterSlot> {
        self.index.iter().find(|s| s.filter_id == filter_id)
    }

    fn position(&self, filter_id: u8) -> Option<usize> {
        self.index.iter().position(|s| s.filter_id == filter_id)
    }

    /// Reserve `size` zeroed bytes for a new filter, keeping id order.
    pub fn allocate(&mut self, filter_id: u8, size: usize) -> Result<&FilterSlot> {
        if size == 0 || self.find(filter_id).is_some() {
            return Err(Error::InvalidArgs);
        }
        if self.index.is_full() || size > self.free() {
            return Err(Error::CapacityExceeded(Resource::FilterArena));
        }

        let used = self.used();
        let pos = self
            .index
            .iter()
            .position(|s| s.filter_id > filter_id)
            .unwrap_or(self.index.len());
        let offset = self.index.get(pos).map_or(used, |s| s.offset);

        // Open a gap for the new payload
        self.buf.copy_within(offset..used, offset + size);
        self.buf[offset..offset + size].fill(0);
        for slot in self.index[pos..].iter_mut() {
            slot.offset += size;
        }

        let slot = FilterSlot {
            filter_id,
            offset,
            size,
            crc: 0,
            committed: false,
        };
        self.index
            .insert(pos, slot)
            .map_err(|_| Error::CapacityExceeded(Resource::FilterArena))?;
        Ok(&self.index[pos])
    }

    /// Release a filter and close the gap it leaves. Returns the freed size.
    pub fn deallocate(&mut self, filter_id: u8) -> Result<usize> {
        let pos = self.position(filter_id).ok_or(Error::NotFound)?;
        let used = self.used();
        let FilterSlot { offset, size, .. } = self.index.remove(pos);

        self.buf.copy_within(offset + size..used, offset);
        self.buf[used - size..used].fill(0);
        for slot in self.index[pos..].iter_mut() {
            slot.offset -= size;
        }
        Ok(size)
    }

    pub fn payload(&self, filter_id: u8) -> Option<&[u8]> {
        self.find(filter_id)
            .map(|s| &self.buf[s.offset..s.offset + s.size])
    }

    /// Copy `data` into the payload of `filter_id` at `offset`.
    pub fn write(&mut self, filter_id: u8, offset: usize, data: &[u8]) -> Result<()> {
        let slot = *self.find(filter_id).ok_or(Error::NotFound)?;
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgs)?;
        if end > slot.size {
            return Err(Error::InvalidArgs);
        }
        self.buf[slot.offset + offset..slot.offset + end].copy_from_slice(data);
        Ok(())
    }

    /// Iterate `(slot, payload)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&FilterSlot, &[u8])> {
        self.index
            .iter()
            .map(move |s| (s, &self.buf[s.offset..s.offset + s.size]))
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.buf.fill(0);
    }
}

impl<const CAP: usize, const MAX: usize> Default for FilterArena<CAP, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Arena = FilterArena<64, 4>;

    fn fill(arena: &mut Arena, id: u8, size: usize, byte: u8) {
        arena.allocate(id, size).unwrap();
        let data = [byte; 64];
        arena.write(id, 0, &data[..size]).unwrap();
    }

    fn assert_contiguous(arena: &Arena) {
        let mut expected = 0;
        let mut last_id = None;
        for slot in arena.slots() {
            assert_eq!(slot.offset, expected, "gap before filter {}", slot.filter_id);
            if let Some(prev) = last_id {
                assert!(slot.filter_id > prev, "index not sorted");
            }
            expected += slot.size;
            last_id = Some(slot.filter_id);
        }
        assert_eq!(arena.used(), expected);
    }

    #[test]
    fn allocate_appends_in_order() {
        let mut arena = Arena::new();
        fill(&mut arena, 1, 10, 0x11);
        fill(&mut arena, 2, 12, 0x22);
        assert_eq!(arena.used(), 22);
        assert_eq!(arena.free(), 42);
        assert_contiguous(&arena);
    }

    #[test]
    fn allocate_in_middle_shifts_trailing_payloads() {
        let mut arena = Arena::new();
        fill(&mut arena, 1, 4, 0x11);
        fill(&mut arena, 5, 6, 0x55);
        fill(&mut arena, 3, 5, 0x33);

        assert_contiguous(&arena);
        assert_eq!(arena.payload(5), Some(&[0x55; 6][..]));
        assert_eq!(arena.payload(3), Some(&[0x33; 5][..]));
        let ids: Vec<u8, 4> = arena.slots().iter().map(|s| s.filter_id).collect();
        assert_eq!(ids.as_slice(), &[1, 3, 5]);
    }

    #[test]
    fn deallocate_compacts() {
        let mut arena = Arena::new();
        fill(&mut arena, 1, 8, 0x11);
        fill(&mut arena, 2, 10, 0x22);
        fill(&mut arena, 3, 12, 0x33);
        let before: Vec<u8, 64> = Vec::from_slice(arena.payload(3).unwrap()).unwrap();
        let used_before = arena.used();

        let freed = arena.deallocate(2).unwrap();

        assert_eq!(freed, 10);
        assert_eq!(used_before - arena.used(), 10);
        assert_eq!(arena.find(3).unwrap().offset, 8);
        assert_eq!(arena.payload(3).unwrap(), before.as_slice());
        assert_contiguous(&arena);
    }

    #[test]
    fn deallocate_unknown_is_not_found() {
        let mut arena = Arena::new();
        assert_eq!(arena.deallocate(9), Err(Error::NotFound));
    }

    #[test]
    fn budget_is_enforced() {
        let mut arena = Arena::new();
        fill(&mut arena, 1, 60, 0x11);
        assert_eq!(
            arena.allocate(2, 5).unwrap_err(),
            Error::CapacityExceeded(Resource::FilterArena)
        );
        assert!(arena.allocate(2, 4).is_ok());
    }

    #[test]
    fn filter_count_is_enforced() {
        let mut arena = Arena::new();
        for id in 0..4 {
            fill(&mut arena, id, 2, id);
        }
        assert_eq!(
            arena.allocate(9, 2).unwrap_err(),
            Error::CapacityExceeded(Resource::FilterArena)
        );
    }

    #[test]
    fn write_out_of_bounds_is_rejected() {
        let mut arena = Arena::new();
        arena.allocate(1, 4).unwrap();
        assert_eq!(arena.write(1, 2, &[1, 2, 3]), Err(Error::InvalidArgs));
        assert_eq!(arena.write(7, 0, &[1]), Err(Error::NotFound));
        // Rewriting the same chunk is harmless
        arena.write(1, 0, &[9, 9]).unwrap();
        arena.write(1, 0, &[9, 9]).unwrap();
        assert_eq!(arena.payload(1), Some(&[9, 9, 0, 0][..]));
    }

    #[test]
    fn duplicate_allocation_is_invalid() {
        let mut arena = Arena::new();
        arena.allocate(1, 4).unwrap();
        assert_eq!(arena.allocate(1, 4).unwrap_err(), Error::InvalidArgs);
    }
}
