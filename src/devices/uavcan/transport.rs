//! UAVCAN v0 transport layer over classic CAN frames.
//!
//! Handles the 29-bit identifier composition for broadcast, anonymous
//! and service transfers, the tail byte state machine, multi-frame
//! reassembly with the signature-seeded transfer CRC, and a bounded
//! transmission queue. The arena is static: a fixed set of reassembly
//! slots and a fixed-depth frame queue.

use heapless::{Deque, FnvIndexMap, Vec};

use crate::devices::uavcan::dsdl;
use crate::error::Error;
use crate::hal::can::CanFrame;
use crate::hal::time::Microseconds;

/// Largest reassembled transfer payload this node ever handles (a
/// FileRead response with a full 256-byte window, plus headroom).
pub const MAX_TRANSFER_PAYLOAD: usize = 384;

/// Reassembly slots; one per concurrent remote transfer.
const RX_SESSIONS: usize = 8;

/// Depth of the frame transmission queue. Sized for the largest
/// outgoing transfer (a full-path FileRead request) plus housekeeping
/// traffic.
const TX_QUEUE_DEPTH: usize = 64;

/// Incomplete transfers older than this are dropped by the 1 Hz
/// housekeeping pass.
pub const TRANSFER_TIMEOUT: Microseconds = Microseconds(2_000_000);

const TAIL_START_OF_TRANSFER: u8 = 0x80;
const TAIL_END_OF_TRANSFER: u8 = 0x40;
const TAIL_TOGGLE: u8 = 0x20;
const TAIL_TRANSFER_ID_MASK: u8 = 0x1F;

const SERVICE_NOT_MESSAGE: u32 = 1 << 7;
const REQUEST_NOT_RESPONSE: u32 = 1 << 15;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    MessageBroadcast,
    ServiceRequest,
    ServiceResponse,
}

/// A fully reassembled incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub kind: TransferKind,
    pub data_type_id: u16,
    pub source_node_id: u8,
    pub transfer_id: u8,
    pub payload: Vec<u8, MAX_TRANSFER_PAYLOAD>,
}

/// CRC-16-CCITT-FALSE seeded with the data type signature, as required
/// for multi-frame transfers.
pub(crate) struct TransferCrc {
    value: u16,
}

impl TransferCrc {
    pub(crate) fn new(data_type_signature: u64) -> Self {
        let mut crc = TransferCrc { value: 0xFFFF };
        crc.add(&data_type_signature.to_le_bytes());
        crc
    }

    pub(crate) fn add(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.value ^= u16::from(byte) << 8;
            for _ in 0..8 {
                if self.value & 0x8000 != 0 {
                    self.value = (self.value << 1) ^ 0x1021;
                } else {
                    self.value <<= 1;
                }
            }
        }
    }

    pub(crate) fn get(&self) -> u16 { self.value }
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct SessionKey {
    source_node_id: u8,
    kind: TransferKind,
    data_type_id: u16,
}

struct RxSession {
    key: SessionKey,
    transfer_id: u8,
    next_toggle: bool,
    expected_crc: u16,
    payload: Vec<u8, MAX_TRANSFER_PAYLOAD>,
    updated_at: Microseconds,
}

/// Protocol state keeper: one per node.
pub struct Transport {
    local_node_id: u8,
    discriminator: u16,
    tx: Deque<CanFrame, TX_QUEUE_DEPTH>,
    sessions: [Option<RxSession>; RX_SESSIONS],
    transfer_ids: FnvIndexMap<u32, u8, 16>,
}

impl Transport {
    /// `discriminator` seeds the 14-bit field used in anonymous frame
    /// identifiers; it should come from a device-unique source.
    pub fn new(discriminator: u16) -> Self {
        Transport {
            local_node_id: 0,
            discriminator: discriminator & 0x3FFF,
            tx: Deque::new(),
            sessions: [const { None }; RX_SESSIONS],
            transfer_ids: FnvIndexMap::new(),
        }
    }

    /// The allocated node ID, zero while still anonymous.
    pub fn local_node_id(&self) -> u8 { self.local_node_id }

    pub fn set_local_node_id(&mut self, node_id: u8) {
        debug_assert!((1..=127).contains(&node_id));
        self.local_node_id = node_id;
    }

    /// Queues a broadcast transfer. While the node is anonymous the
    /// transfer must fit a single frame.
    pub fn broadcast(
        &mut self,
        data_type: &dsdl::DataType,
        priority: u8,
        payload: &[u8],
    ) -> Result<(), Error> {
        let transfer_id = self.next_transfer_id(TransferKind::MessageBroadcast, data_type.id, 0);
        let can_id = if self.local_node_id == 0 {
            if payload.len() > 7 {
                return Err(Error::ProtocolError);
            }
            (u32::from(priority) << 24)
                | (u32::from(self.discriminator) << 10)
                | (u32::from(data_type.id & 0x3) << 8)
        } else {
            (u32::from(priority) << 24)
                | (u32::from(data_type.id) << 8)
                | u32::from(self.local_node_id)
        };
        self.enqueue_transfer(can_id, data_type.signature, payload, transfer_id)
    }

    /// Queues a service request, returning the transfer ID to match
    /// the response against.
    pub fn request(
        &mut self,
        data_type: &dsdl::DataType,
        priority: u8,
        destination: u8,
        payload: &[u8],
    ) -> Result<u8, Error> {
        let transfer_id =
            self.next_transfer_id(TransferKind::ServiceRequest, data_type.id, destination);
        let can_id = (u32::from(priority) << 24)
            | (u32::from(data_type.id & 0xFF) << 16)
            | REQUEST_NOT_RESPONSE
            | (u32::from(destination) << 8)
            | SERVICE_NOT_MESSAGE
            | u32::from(self.local_node_id);
        self.enqueue_transfer(can_id, data_type.signature, payload, transfer_id)?;
        Ok(transfer_id)
    }

    /// Queues the response to a received service request, echoing its
    /// transfer ID.
    pub fn respond(
        &mut self,
        data_type: &dsdl::DataType,
        priority: u8,
        request: &Transfer,
        payload: &[u8],
    ) -> Result<(), Error> {
        debug_assert_eq!(TransferKind::ServiceRequest, request.kind);
        let can_id = (u32::from(priority) << 24)
            | (u32::from(data_type.id & 0xFF) << 16)
            | (u32::from(request.source_node_id) << 8)
            | SERVICE_NOT_MESSAGE
            | u32::from(self.local_node_id);
        self.enqueue_transfer(can_id, data_type.signature, payload, request.transfer_id)
    }

    /// Next frame awaiting transmission.
    pub fn pop_tx(&mut self) -> Option<CanFrame> { self.tx.pop_front() }

    /// Returns a popped frame after the driver could not take it.
    pub fn defer_tx(&mut self, frame: CanFrame) { let _ = self.tx.push_front(frame); }

    pub fn tx_queue_len(&self) -> usize { self.tx.len() }

    /// Feeds one received frame into the reassembler, returning a
    /// transfer once complete. Frames for other destinations, unknown
    /// data types and corrupt transfers are dropped silently.
    pub fn accept(&mut self, frame: &CanFrame, now: Microseconds) -> Option<Transfer> {
        if !frame.is_extended() || frame.is_remote() {
            return None;
        }
        let id = frame.extended_id();
        let source_node_id = (id & 0x7F) as u8;
        let (kind, data_type_id) = if id & SERVICE_NOT_MESSAGE != 0 {
            let destination = ((id >> 8) & 0x7F) as u8;
            if destination != self.local_node_id {
                return None;
            }
            let kind = if id & REQUEST_NOT_RESPONSE != 0 {
                TransferKind::ServiceRequest
            } else {
                TransferKind::ServiceResponse
            };
            (kind, ((id >> 16) & 0xFF) as u16)
        } else if source_node_id == 0 {
            // Anonymous frames carry only the low two data type bits.
            (TransferKind::MessageBroadcast, ((id >> 8) & 0x3) as u16)
        } else {
            (TransferKind::MessageBroadcast, ((id >> 8) & 0xFFFF) as u16)
        };

        let data = frame.data();
        let (&tail, payload) = data.split_last()?;
        let start = tail & TAIL_START_OF_TRANSFER != 0;
        let end = tail & TAIL_END_OF_TRANSFER != 0;
        let toggle = tail & TAIL_TOGGLE != 0;
        let transfer_id = tail & TAIL_TRANSFER_ID_MASK;

        if start && end {
            if toggle {
                return None;
            }
            return Some(Transfer {
                kind,
                data_type_id,
                source_node_id,
                transfer_id,
                payload: Vec::from_slice(payload).ok()?,
            });
        }

        let key = SessionKey { source_node_id, kind, data_type_id };
        if start {
            // First frame: the first two payload bytes carry the
            // transfer CRC.
            if toggle || payload.len() < 2 {
                return None;
            }
            let expected_crc = u16::from_le_bytes([payload[0], payload[1]]);
            let session = RxSession {
                key,
                transfer_id,
                next_toggle: true,
                expected_crc,
                payload: Vec::from_slice(&payload[2..]).ok()?,
                updated_at: now,
            };
            *self.slot_for(key) = Some(session);
            return None;
        }

        let slot = self.sessions.iter_mut().find(|s| {
            s.as_ref().map(|session| session.key == key).unwrap_or(false)
        })?;
        let session = slot.as_mut()?;
        if session.transfer_id != transfer_id {
            *slot = None;
            return None;
        }
        if session.next_toggle != toggle {
            // Duplicate or reordered frame; drop it, keep the session.
            return None;
        }
        if session.payload.extend_from_slice(payload).is_err() {
            *slot = None;
            return None;
        }
        session.next_toggle = !session.next_toggle;
        session.updated_at = now;
        if !end {
            return None;
        }

        let session = slot.take()?;
        let signature = dsdl::signature_for(kind, data_type_id)?;
        let mut crc = TransferCrc::new(signature);
        crc.add(&session.payload);
        if crc.get() != session.expected_crc {
            return None;
        }
        Some(Transfer {
            kind,
            data_type_id,
            source_node_id,
            transfer_id: session.transfer_id,
            payload: session.payload,
        })
    }

    /// Drops incomplete transfers that have not progressed within
    /// [`TRANSFER_TIMEOUT`].
    pub fn expire_stale(&mut self, now: Microseconds) {
        for slot in self.sessions.iter_mut() {
            if let Some(session) = slot {
                if now - session.updated_at >= TRANSFER_TIMEOUT {
                    *slot = None;
                }
            }
        }
    }

    /// Finds the slot for a new session: an existing same-key slot, a
    /// free one, or failing those the stalest.
    fn slot_for(&mut self, key: SessionKey) -> &mut Option<RxSession> {
        let mut chosen = 0;
        let mut stalest = Microseconds(u64::MAX);
        for (index, slot) in self.sessions.iter().enumerate() {
            match slot {
                Some(session) if session.key == key => {
                    chosen = index;
                    break;
                }
                Some(session) if session.updated_at < stalest => {
                    stalest = session.updated_at;
                    chosen = index;
                }
                None if stalest > Microseconds(0) => {
                    stalest = Microseconds(0);
                    chosen = index;
                }
                _ => {}
            }
        }
        &mut self.sessions[chosen]
    }

    fn next_transfer_id(&mut self, kind: TransferKind, data_type_id: u16, destination: u8) -> u8 {
        let key = ((kind as u32) << 24) | (u32::from(data_type_id) << 8) | u32::from(destination);
        let counter = self.transfer_ids.get(&key).copied().unwrap_or(0);
        let _ = self.transfer_ids.insert(key, (counter + 1) & TAIL_TRANSFER_ID_MASK);
        counter
    }

    /// Splits a transfer into frames and queues them all, or none on
    /// queue exhaustion.
    fn enqueue_transfer(
        &mut self,
        can_id: u32,
        signature: u64,
        payload: &[u8],
        transfer_id: u8,
    ) -> Result<(), Error> {
        if payload.len() <= 7 {
            if self.tx.is_full() {
                return Err(Error::DriverError);
            }
            let mut data = Vec::<u8, 8>::from_slice(payload).map_err(|_| Error::ProtocolError)?;
            let tail = TAIL_START_OF_TRANSFER | TAIL_END_OF_TRANSFER | transfer_id;
            data.push(tail).ok();
            let _ = self.tx.push_back(CanFrame::new_extended(can_id, &data));
            return Ok(());
        }

        let frames_needed = 1 + (payload.len() - 5).div_ceil(7);
        if TX_QUEUE_DEPTH - self.tx.len() < frames_needed {
            return Err(Error::DriverError);
        }

        let mut crc = TransferCrc::new(signature);
        crc.add(payload);

        let mut data = Vec::<u8, 8>::new();
        data.extend_from_slice(&crc.get().to_le_bytes()).ok();
        data.extend_from_slice(&payload[..5]).ok();
        data.push(TAIL_START_OF_TRANSFER | transfer_id).ok();
        let _ = self.tx.push_back(CanFrame::new_extended(can_id, &data));

        let mut toggle = true;
        let mut remaining = &payload[5..];
        while !remaining.is_empty() {
            let take = remaining.len().min(7);
            let mut data = Vec::<u8, 8>::from_slice(&remaining[..take]).unwrap();
            remaining = &remaining[take..];
            let mut tail = transfer_id;
            if toggle {
                tail |= TAIL_TOGGLE;
            }
            if remaining.is_empty() {
                tail |= TAIL_END_OF_TRANSFER;
            }
            data.push(tail).ok();
            let _ = self.tx.push_back(CanFrame::new_extended(can_id, &data));
            toggle = !toggle;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::uavcan::dsdl;

    fn drain(transport: &mut Transport) -> std::vec::Vec<CanFrame> {
        let mut frames = std::vec::Vec::new();
        while let Some(frame) = transport.pop_tx() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn transfer_crc_is_seeded_by_the_signature() {
        // Plain CCITT-FALSE when the seed contribution is backed out
        // is not directly observable, so pin the composed value.
        let mut a = TransferCrc::new(dsdl::NODE_STATUS.signature);
        let mut b = TransferCrc::new(dsdl::NODE_STATUS.signature);
        a.add(b"payload");
        b.add(b"pay");
        b.add(b"load");
        assert_eq!(a.get(), b.get());

        let different_seed = TransferCrc::new(dsdl::FILE_READ.signature);
        assert_ne!(TransferCrc::new(dsdl::NODE_STATUS.signature).get(), different_seed.get());
    }

    #[test]
    fn single_frame_broadcast_layout() {
        let mut transport = Transport::new(0);
        transport.set_local_node_id(42);
        transport.broadcast(&dsdl::NODE_STATUS, 20, &[1, 2, 3]).unwrap();

        let frames = drain(&mut transport);
        assert_eq!(1, frames.len());
        let id = frames[0].extended_id();
        assert_eq!(20, id >> 24);
        assert_eq!(u32::from(dsdl::NODE_STATUS.id), (id >> 8) & 0xFFFF);
        assert_eq!(0, id & 0x80); // message, not service
        assert_eq!(42, id & 0x7F);
        // Tail: single frame, toggle clear, transfer id 0
        assert_eq!(&[1, 2, 3, 0xC0], frames[0].data());
    }

    #[test]
    fn broadcast_transfer_ids_increment_and_wrap() {
        let mut transport = Transport::new(0);
        transport.set_local_node_id(42);
        for expected in [0u8, 1, 2] {
            transport.broadcast(&dsdl::NODE_STATUS, 20, &[0]).unwrap();
            let frames = drain(&mut transport);
            assert_eq!(0xC0 | expected, *frames[0].data().last().unwrap());
        }
    }

    #[test]
    fn anonymous_broadcasts_are_single_frame_with_discriminator() {
        let mut transport = Transport::new(0x1ABC);
        transport
            .broadcast(&dsdl::DYNAMIC_NODE_ID_ALLOCATION, 29, &[0x01, 0x11, 0x22])
            .unwrap();
        let frames = drain(&mut transport);
        let id = frames[0].extended_id();
        assert_eq!(0, id & 0x7F); // anonymous source
        assert_eq!(0x1ABC, (id >> 10) & 0x3FFF);
        assert_eq!(u32::from(dsdl::DYNAMIC_NODE_ID_ALLOCATION.id & 0x3), (id >> 8) & 0x3);

        // And oversized anonymous payloads are refused
        assert_eq!(
            Err(Error::ProtocolError),
            transport.broadcast(&dsdl::DYNAMIC_NODE_ID_ALLOCATION, 29, &[0u8; 8])
        );
    }

    #[test]
    fn multi_frame_request_round_trips_through_a_peer() {
        let mut client = Transport::new(0);
        client.set_local_node_id(10);
        let mut server = Transport::new(0);
        server.set_local_node_id(125);

        let payload: std::vec::Vec<u8> = (0..64).collect();
        let transfer_id = client.request(&dsdl::FILE_READ, 24, 125, &payload).unwrap();

        let mut received = None;
        for frame in drain(&mut client) {
            received = server.accept(&frame, Microseconds(0)).or(received);
        }
        let request = received.expect("server should reassemble the request");
        assert_eq!(TransferKind::ServiceRequest, request.kind);
        assert_eq!(dsdl::FILE_READ.id, request.data_type_id);
        assert_eq!(10, request.source_node_id);
        assert_eq!(transfer_id, request.transfer_id);
        assert_eq!(payload.as_slice(), &request.payload[..]);

        // The response comes back under the same transfer id.
        server.respond(&dsdl::FILE_READ, 24, &request, b"\x00\x00data").unwrap();
        let mut response = None;
        for frame in drain(&mut server) {
            response = client.accept(&frame, Microseconds(0)).or(response);
        }
        let response = response.expect("client should reassemble the response");
        assert_eq!(TransferKind::ServiceResponse, response.kind);
        assert_eq!(125, response.source_node_id);
        assert_eq!(transfer_id, response.transfer_id);
        assert_eq!(b"\x00\x00data", &response.payload[..]);
    }

    #[test]
    fn service_frames_for_other_destinations_are_ignored() {
        let mut client = Transport::new(0);
        client.set_local_node_id(10);
        let mut bystander = Transport::new(0);
        bystander.set_local_node_id(99);

        client.request(&dsdl::FILE_READ, 24, 125, &[0u8; 6]).unwrap();
        for frame in drain(&mut client) {
            assert_eq!(None, bystander.accept(&frame, Microseconds(0)));
        }
    }

    #[test]
    fn corrupted_multi_frame_transfer_is_dropped() {
        let mut client = Transport::new(0);
        client.set_local_node_id(10);
        let mut server = Transport::new(0);
        server.set_local_node_id(125);

        client.request(&dsdl::FILE_READ, 24, 125, &[0xAA; 40]).unwrap();
        let mut frames = drain(&mut client);
        // Flip a payload bit in the middle frame
        let middle = frames[1];
        frames[1] = CanFrame::new_extended(middle.extended_id(), &{
            let mut data: std::vec::Vec<u8> = middle.data().to_vec();
            data[0] ^= 0x01;
            data
        });

        let mut received = None;
        for frame in frames {
            received = server.accept(&frame, Microseconds(0)).or(received);
        }
        assert_eq!(None, received);
    }

    #[test]
    fn stale_sessions_expire_but_fresh_ones_survive() {
        let mut client = Transport::new(0);
        client.set_local_node_id(10);
        let mut server = Transport::new(0);
        server.set_local_node_id(125);

        client.request(&dsdl::FILE_READ, 24, 125, &[0xBB; 40]).unwrap();
        let frames = drain(&mut client);
        let (last, head) = frames.split_last().unwrap();
        for frame in head {
            assert_eq!(None, server.accept(frame, Microseconds(0)));
        }

        // The unfinished session dies with the housekeeping pass...
        server.expire_stale(Microseconds(TRANSFER_TIMEOUT.0));
        assert_eq!(None, server.accept(last, Microseconds(TRANSFER_TIMEOUT.0)));

        // ...so the transfer must be resent in full to get through.
        client.request(&dsdl::FILE_READ, 24, 125, &[0xBB; 40]).unwrap();
        let mut received = None;
        for frame in drain(&mut client) {
            received = server.accept(&frame, Microseconds(0)).or(received);
        }
        assert!(received.is_some());
    }
}
