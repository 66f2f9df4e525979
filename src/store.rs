/// Fixed-capacity keyed record table.
///
/// Slots are tagged (`Empty | Occupied`) so a default-constructed record is
/// never mistaken for a live one. The table is front-loaded: every slot in
/// use lies in `[0, size)`, and iteration never looks past `size`.
use heapless::Vec;

/// A record that can be stored in a [`RecordStore`].
pub trait Keyed {
    type Key: Copy + PartialEq;

    fn key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<Rec> {
    Empty,
    Occupied(Rec),
}

impl<Rec> Slot<Rec> {
    pub fn as_ref(&self) -> Option<&Rec> {
        match self {
            Slot::Occupied(rec) => Some(rec),
            Slot::Empty => None,
        }
    }

    pub fn as_mut(&mut self) -> Option<&mut Rec> {
        match self {
            Slot::Occupied(rec) => Some(rec),
            Slot::Empty => None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        matches!(self, Slot::Occupied(_))
    }
}

pub struct RecordStore<Rec: Keyed, const N: usize> {
    /// `slots.len()` is the current logical size.
    slots: Vec<Slot<Rec>, N>,
}

impl<Rec: Keyed, const N: usize> RecordStore<Rec, N> {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of slots ever handed out since the last clear.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn lookup(&self, key: Rec::Key) -> Option<&Rec> {
        self.iter().find(|rec| rec.key() == key)
    }

    pub fn lookup_mut(&mut self, key: Rec::Key) -> Option<&mut Rec> {
        self.iter_mut().find(|rec| rec.key() == key)
    }

    /// Returns the record for `key`, creating it with `init` in the first
    /// free slot if it does not exist. `None` means the table is full.
    pub fn get_or_create(
        &mut self,
        key: Rec::Key,
        init: impl FnOnce() -> Rec,
    ) -> Option<&mut Rec> {
        let mut found = None;
        let mut first_empty = None;
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                Slot::Occupied(rec) if rec.key() == key => {
                    found = Some(i);
                    break;
                }
                Slot::Empty if first_empty.is_none() => first_empty = Some(i),
                _ => {}
            }
        }

        let index = match (found, first_empty) {
            (Some(i), _) => i,
            (None, Some(i)) => {
                self.slots[i] = Slot::Occupied(init());
                i
            }
            (None, None) => {
                self.slots.push(Slot::Occupied(init())).ok()?;
                self.slots.len() - 1
            }
        };
        self.slots[index].as_mut()
    }

    /// Empties the slot holding `key`. Returns the removed record.
    pub fn remove(&mut self, key: Rec::Key) -> Option<Rec> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|rec| rec.key() == key))?;
        let removed = core::mem::replace(&mut self.slots[index], Slot::Empty);
        self.shrink();
        match removed {
            Slot::Occupied(rec) => Some(rec),
            Slot::Empty => None,
        }
    }

    /// Empties every slot whose record fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&mut Rec) -> bool) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(rec) = slot {
                if !keep(rec) {
                    *slot = Slot::Empty;
                }
            }
        }
        self.shrink();
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of occupied slots, recomputed on every call.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    pub fn is_full(&self) -> bool {
        self.count() == N
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rec> {
        self.slots.iter().filter_map(Slot::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Rec> {
        self.slots.iter_mut().filter_map(Slot::as_mut)
    }

    /// Drops trailing empty slots so `size` stays tight.
    fn shrink(&mut self) {
        while matches!(self.slots.last(), Some(Slot::Empty)) {
            self.slots.pop();
        }
    }
}

impl<Rec: Keyed, const N: usize> Default for RecordStore<Rec, N> {
    fn default() -> Self {
        Self::new()
    }
}
