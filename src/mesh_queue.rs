/// Best-effort multicast queue in front of the mesh transport.
///
/// A small ring of slots, each either empty or armed with a packet and a
/// number of remaining transmissions. Every tick a burst of packets is
/// sent, priority packets first. After each send the next-to-send index
/// moves past the sent slot so distinct messages are interleaved instead
/// of one message burning all of its repeats back to back.
use crate::config::{QUEUE_BURST_COUNT, QUEUE_PROCESS_INTERVAL_MS, TICK_INTERVAL_MS};
use crate::error::{Error, Resource, Result};
use crate::event::{Event, EventBus, EventListener};
use crate::protocol::{
    MeshMsgType, MeshPacket, MeshPayload, MeshReport, StoneId, CROWNSTONE_COMPANY_ID,
    MAX_MESH_PAYLOAD_SIZE, MESH_OPCODE_MSG,
};

/// Repeat count is a 6-bit field.
pub const MAX_REPEATS: u8 = 63;

/// Default number of slots.
pub const MESH_QUEUE_SIZE: usize = 8;

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    Busy,
    Failed,
}

/// Outbound side of the mesh radio.
pub trait MeshTransport {
    fn transmit(
        &mut self,
        opcode: u16,
        packet: &[u8],
        company_id: u16,
    ) -> core::result::Result<(), TransmitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMeta {
    /// Free to use id to find similar items, e.g. the asset a report is about.
    pub id: u64,
    pub msg_type: MeshMsgType,
    /// 0 for broadcast
    pub target_id: StoneId,
    pub priority: bool,
    pub reliable: bool,
    /// Number of transmissions, 1..=63
    pub repeats: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshQueueItem {
    pub meta: QueueMeta,
    pub payload: MeshPayload,
}

impl MeshQueueItem {
    /// Unreliable broadcast of a mesh report.
    pub fn broadcast(report: &MeshReport, id: u64, repeats: u8, priority: bool) -> Self {
        Self {
            meta: QueueMeta {
                id,
                msg_type: report.msg_type(),
                target_id: 0,
                priority,
                reliable: false,
                repeats,
            },
            payload: report.encode(),
        }
    }
}

#[derive(Debug, Clone)]
struct Armed {
    meta: QueueMeta,
    packet: MeshPacket,
    repeats_left: u8,
}

#[derive(Debug, Clone)]
enum QueueSlot {
    Empty,
    Armed(Armed),
}

pub struct MeshQueue<T: MeshTransport, const N: usize = MESH_QUEUE_SIZE> {
    transport: T,
    slots: [QueueSlot; N],
    next: usize,
}

impl<T: MeshTransport, const N: usize> MeshQueue<T, N> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            slots: core::array::from_fn(|_| QueueSlot::Empty),
            next: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Number of armed slots.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, QueueSlot::Armed(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy an item into an empty slot and make it the next one to send.
    ///
    /// Empty slots are searched backward from the current next-to-send
    /// index, so the item that was about to go out is sent right after
    /// the new one.
    pub fn enqueue(&mut self, item: &MeshQueueItem) -> Result<()> {
        if item.payload.len() > MAX_MESH_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        if item.meta.reliable || item.meta.target_id != 0 {
            // Unreliable multicast only
            return Err(Error::InvalidArgs);
        }
        if item.meta.repeats == 0 || item.meta.repeats > MAX_REPEATS {
            return Err(Error::InvalidArgs);
        }

        for i in (self.next + 1..=self.next + N).rev() {
            let index = i % N;
            if matches!(self.slots[index], QueueSlot::Empty) {
                let mut packet = MeshPacket::new();
                packet
                    .push(item.meta.msg_type as u8)
                    .map_err(|_| Error::PayloadTooLarge)?;
                packet
                    .extend_from_slice(&item.payload)
                    .map_err(|_| Error::PayloadTooLarge)?;

                self.slots[index] = QueueSlot::Armed(Armed {
                    meta: item.meta,
                    packet,
                    repeats_left: item.meta.repeats,
                });
                log::debug!("mesh queue: added type={:?} id={} at {}", item.meta.msg_type, item.meta.id, index);
                self.next = index;
                return Ok(());
            }
        }

        log::warn!("mesh queue is full");
        Err(Error::CapacityExceeded(Resource::MeshQueue))
    }

    /// Disarm every queued item with the given type and id.
    pub fn remove(&mut self, msg_type: MeshMsgType, id: u64) -> Result<()> {
        let mut found = false;
        for slot in self.slots.iter_mut() {
            if let QueueSlot::Armed(armed) = slot {
                if armed.meta.msg_type == msg_type && armed.meta.id == id {
                    *slot = QueueSlot::Empty;
                    found = true;
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    fn next_to_send(&self, priority_only: bool) -> Option<usize> {
        (self.next..self.next + N).map(|i| i % N).find(|&index| {
            matches!(&self.slots[index], QueueSlot::Armed(a) if !priority_only || a.meta.priority)
        })
    }

    /// Send one packet. Returns false when nothing is queued.
    fn send_one(&mut self) -> bool {
        let Some(index) = self
            .next_to_send(true)
            .or_else(|| self.next_to_send(false))
        else {
            return false;
        };

        let QueueSlot::Armed(armed) = &mut self.slots[index] else {
            return false;
        };

        if let Err(err) = self
            .transport
            .transmit(MESH_OPCODE_MSG, &armed.packet, CROWNSTONE_COMPANY_ID)
        {
            // The repeat is spent anyway, the queue is best effort.
            log::warn!("mesh transmit failed: {:?}", err);
        }
        armed.repeats_left -= 1;
        log::debug!(
            "mesh queue: sent ind={} left={} type={:?} id={}",
            index,
            armed.repeats_left,
            armed.meta.msg_type,
            armed.meta.id
        );
        if armed.repeats_left == 0 {
            self.slots[index] = QueueSlot::Empty;
        }

        self.next = (index + 1) % N;
        true
    }

    /// Send up to `max` packets. Returns how many were sent.
    pub fn drain_burst(&mut self, max: usize) -> usize {
        let mut sent = 0;
        while sent < max && self.send_one() {
            sent += 1;
        }
        sent
    }

    /// Called every tick; sends a burst on each queue interval.
    pub fn tick(&mut self, tick_count: u32) -> usize {
        let interval = (QUEUE_PROCESS_INTERVAL_MS / TICK_INTERVAL_MS).max(1);
        if tick_count % interval == 0 {
            self.drain_burst(QUEUE_BURST_COUNT)
        } else {
            0
        }
    }
}

impl<T: MeshTransport, const N: usize> EventListener for MeshQueue<T, N> {
    fn handle_event(&mut self, event: &Event, _bus: &mut EventBus) {
        match event {
            Event::MeshSend(item) => {
                if let Err(err) = self.enqueue(item) {
                    log::warn!("dropping mesh msg type={:?}: {}", item.meta.msg_type, err);
                }
            }
            Event::MeshRemove { msg_type, id } => {
                let _ = self.remove(*msg_type, *id);
            }
            Event::PeriodicTick(tick_count) => {
                self.tick(*tick_count);
            }
            _ => {}
        }
    }
}
