//! Single-node firmware update client for a UAVCAN v0 field bus.
//!
//! The node exists solely to fetch new application images: it detects
//! the bus bit rate by listening silently, obtains a node ID through
//! dynamic allocation, advertises itself with periodic status
//! broadcasts, and waits for a `BeginFirmwareUpdate` request. When one
//! arrives it pulls the named file from the update server in windowed
//! `FileRead` requests, feeding every window into the bootloader's
//! download sink.

pub mod dsdl;
pub mod transport;

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::String;
use heapless::Vec;

use crate::devices::bootloader::{Bootloader, DownloadSink, Downloader};
use crate::devices::restart::RestartRequest;
use crate::devices::uavcan::dsdl::{NodeHealth, NodeMode, MAX_FILE_PATH};
use crate::devices::uavcan::transport::{Transfer, TransferKind, Transport, MAX_TRANSFER_PAYLOAD};
use crate::error::Error;
use crate::hal::can::{AcceptanceFilter, CanInterface, Mode, FLAG_EFF, FLAG_ERR, FLAG_RTR};
use crate::hal::storage::StorageBackend;
use crate::hal::time::{Clock, Microseconds, Milliseconds};
use crate::utilities::rand::XorShift64;

/// Probed during bit rate detection, in order. The first four are the
/// standard rates; 100 kbps is added for its popularity in the field.
const STANDARD_BIT_RATES: [u32; 5] = [1_000_000, 500_000, 250_000, 125_000, 100_000];

/// Work bounds of a single [`UavcanNode::poll`] call.
const RX_FRAMES_PER_POLL: usize = 10;
const TX_FRAMES_PER_POLL: usize = 10;

const RECEIVE_TIMEOUT: Milliseconds = Milliseconds(1);
const BIT_RATE_LISTEN_TIMEOUT: Milliseconds = Milliseconds(1100);
const DRIVER_RETRY_PAUSE: Milliseconds = Milliseconds(1000);

// Allocation request pacing (Rule C): a fresh random deadline per
// attempt, shortened after the allocator echoes a matching prefix.
const ALLOCATION_REQUEST_PERIOD: (u64, u64) = (600_000, 1_000_000);
const ALLOCATION_FOLLOWUP_PERIOD: (u64, u64) = (0, 400_000);

const FILE_READ_TIMEOUT: Microseconds = Microseconds(1_000_000);
const FILE_READ_ATTEMPTS: usize = 3;

// Transfer priorities, out of 32 levels with zero the most urgent.
const NODE_STATUS_PRIORITY: u8 = 20;
const ALLOCATION_PRIORITY: u8 = 29;
const SERVICE_PRIORITY: u8 = 24;

/// Static identity of the node plus optional pre-set protocol state;
/// zeroed fields are discovered at run time instead.
pub struct NodeOptions {
    /// Node name reported by GetNodeInfo, at most 80 bytes.
    pub name: &'static str,
    pub hardware_version: (u8, u8),
    pub unique_id: [u8; 16],
    /// Bus bit rate if known; zero requests autodetection.
    pub bit_rate: u32,
    /// Local node ID if known; zero requests dynamic allocation.
    pub node_id: u8,
    /// Update server if known; zero waits for a request.
    pub server_node_id: u8,
    /// Remote file path used together with `server_node_id`.
    pub file_path: &'static str,
}

impl NodeOptions {
    pub fn new(name: &'static str, unique_id: [u8; 16]) -> Self {
        NodeOptions {
            name,
            hardware_version: (1, 0),
            unique_id,
            bit_rate: 0,
            node_id: 0,
            server_node_id: 0,
            file_path: "",
        }
    }
}

struct PendingRead {
    transfer_id: u8,
    response: Option<Vec<u8, MAX_TRANSFER_PAYLOAD>>,
}

/// The firmware update node. A long-lived cooperative task: construct
/// once, then [`UavcanNode::run`] until a restart is requested.
pub struct UavcanNode<'a, I, S, C, M>
where
    I: CanInterface,
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
{
    iface: I,
    clock: C,
    bootloader: &'a Bootloader<S, C, M>,
    restart: &'a RestartRequest,
    transport: Transport,
    rng: XorShift64,
    options: NodeOptions,
    bit_rate: u32,
    server_node_id: u8,
    file_path: String<MAX_FILE_PATH>,
    health: NodeHealth,
    mode: NodeMode,
    /// How much of the unique ID the allocator has confirmed so far.
    uid_offset: usize,
    next_allocation_attempt_at: Microseconds,
    next_status_at: Microseconds,
    started_at: Microseconds,
    download_cancelled: bool,
    pending_read: Option<PendingRead>,
}

impl<'a, I, S, C, M> UavcanNode<'a, I, S, C, M>
where
    I: CanInterface,
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
    Error: From<S::Error>,
{
    pub fn new(
        iface: I,
        clock: C,
        bootloader: &'a Bootloader<S, C, M>,
        restart: &'a RestartRequest,
        options: NodeOptions,
    ) -> Self {
        let mut rng = XorShift64::seeded_from(&options.unique_id);
        let mut transport = Transport::new((rng.next_u64() & 0x3FFF) as u16);
        if (1..=127).contains(&options.node_id) {
            transport.set_local_node_id(options.node_id);
        }
        let server_node_id =
            if (1..=127).contains(&options.server_node_id) { options.server_node_id } else { 0 };
        let mut file_path = String::new();
        if server_node_id != 0 {
            let path = options.file_path;
            file_path.push_str(&path[..path.len().min(MAX_FILE_PATH)]).ok();
        }
        let started_at = clock.now();
        UavcanNode {
            iface,
            bootloader,
            restart,
            transport,
            rng,
            bit_rate: options.bit_rate,
            server_node_id,
            file_path,
            health: NodeHealth::Ok,
            mode: NodeMode::Maintenance,
            uid_offset: 0,
            next_allocation_attempt_at: started_at,
            next_status_at: started_at + Milliseconds(1000),
            started_at,
            download_cancelled: false,
            pending_read: None,
            options,
            clock,
        }
    }

    /// The bus bit rate, zero until detected.
    pub fn bit_rate(&self) -> u32 { self.bit_rate }

    /// The local node ID, zero until allocated.
    pub fn local_node_id(&self) -> u8 { self.transport.local_node_id() }

    /// Runs the node until a restart is requested: bit rate detection,
    /// node ID allocation, then the maintenance/update loop.
    pub fn run(&mut self) {
        if self.bit_rate == 0 {
            self.detect_bit_rate();
        }
        if self.restart.is_requested() {
            return;
        }

        if self.transport.local_node_id() == 0 {
            self.allocate_node_id();
        }
        if self.restart.is_requested() {
            return;
        }

        self.install_service_filter();

        while !self.restart.is_requested() {
            self.poll();
            if self.server_node_id == 0 {
                continue;
            }

            self.mode = NodeMode::SoftwareUpdate;
            self.health = NodeHealth::Ok;
            self.download_cancelled = false;

            let bootloader = self.bootloader;
            let result = bootloader.upgrade(&mut *self);

            self.health = if result.is_ok() { NodeHealth::Ok } else { NodeHealth::Error };
            self.mode = NodeMode::Maintenance;
            // Back to waiting; the server re-requests if it wants more.
            self.server_node_id = 0;
            self.file_path.clear();
        }
    }

    /// Listens silently on each candidate bit rate until any frame is
    /// heard.
    fn detect_bit_rate(&mut self) {
        let mut index = 0;
        while !self.restart.is_requested() && self.bit_rate == 0 {
            let candidate = STANDARD_BIT_RATES[index];
            index = (index + 1) % STANDARD_BIT_RATES.len();

            if self
                .iface
                .configure(candidate, Mode::Silent, AcceptanceFilter::accept_all())
                .is_ok()
            {
                match self.iface.receive(BIT_RATE_LISTEN_TIMEOUT) {
                    Ok(Some(_)) => self.bit_rate = candidate,
                    Ok(None) => {}
                    Err(_) => self.clock.sleep(DRIVER_RETRY_PAUSE),
                }
            } else {
                self.clock.sleep(DRIVER_RETRY_PAUSE);
            }
        }
    }

    /// Obtains a node ID by echo-matching the unique ID against an
    /// allocator, up to six bytes per round.
    fn allocate_node_id(&mut self) {
        // Accept only anonymous allocation messages while anonymous
        // ourselves; transmission aborts on error so that colliding
        // nodes back off instead of wedging the bus.
        let filter = AcceptanceFilter {
            id: 0x0000_0100 | FLAG_EFF,
            mask: 0x0000_03FF | FLAG_EFF | FLAG_RTR | FLAG_ERR,
        };
        loop {
            if self.restart.is_requested() {
                return;
            }
            if self
                .iface
                .configure(self.bit_rate, Mode::AutomaticTxAbortOnError, filter)
                .is_ok()
            {
                break;
            }
            self.clock.sleep(DRIVER_RETRY_PAUSE);
        }

        self.next_allocation_attempt_at = self.clock.now() + self.allocation_jitter();
        while !self.restart.is_requested() && self.transport.local_node_id() == 0 {
            self.poll();
            if self.transport.local_node_id() == 0
                && self.clock.now() >= self.next_allocation_attempt_at
            {
                let end = (self.uid_offset + dsdl::ALLOCATION_UID_CHUNK).min(16);
                let payload = dsdl::encode_allocation_request(
                    self.uid_offset == 0,
                    &self.options.unique_id[self.uid_offset..end],
                );
                let _ = self.transport.broadcast(
                    &dsdl::DYNAMIC_NODE_ID_ALLOCATION,
                    ALLOCATION_PRIORITY,
                    &payload,
                );
                self.next_allocation_attempt_at = self.clock.now() + self.allocation_jitter();
            }
        }
    }

    fn allocation_jitter(&mut self) -> Microseconds {
        let (low, high) = ALLOCATION_REQUEST_PERIOD;
        Microseconds(self.rng.in_range(low, high))
    }

    /// Accept only service transfers addressed to us from here on.
    fn install_service_filter(&mut self) {
        let filter = AcceptanceFilter {
            id: (u32::from(self.transport.local_node_id()) << 8) | 0x80 | FLAG_EFF,
            mask: 0x7F80 | FLAG_EFF | FLAG_RTR | FLAG_ERR,
        };
        loop {
            if self.restart.is_requested() {
                return;
            }
            if self.iface.configure(self.bit_rate, Mode::Normal, filter).is_ok() {
                return;
            }
            self.clock.sleep(DRIVER_RETRY_PAUSE);
        }
    }

    /// One bounded slice of protocol work: a handful of received
    /// frames, a handful of transmissions, and the 1 Hz housekeeping.
    pub fn poll(&mut self) {
        for _ in 0..RX_FRAMES_PER_POLL {
            match self.iface.receive(RECEIVE_TIMEOUT) {
                Ok(Some(frame)) => {
                    let now = self.clock.now();
                    if let Some(transfer) = self.transport.accept(&frame, now) {
                        self.handle_transfer(&transfer);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        for _ in 0..TX_FRAMES_PER_POLL {
            let Some(frame) = self.transport.pop_tx() else { break };
            match self.iface.send(&frame, Milliseconds(0)) {
                Ok(true) => {}
                Ok(false) => {
                    // Transmit queue full; try again next poll.
                    self.transport.defer_tx(frame);
                    break;
                }
                Err(_) => break,
            }
        }

        let now = self.clock.now();
        if now >= self.next_status_at {
            self.next_status_at = self.next_status_at + Milliseconds(1000);
            self.transport.expire_stale(now);
            if self.transport.local_node_id() != 0 {
                let uptime_sec = ((now - self.started_at).0 / 1_000_000) as u32;
                let payload = dsdl::encode_node_status(uptime_sec, self.health, self.mode);
                let _ =
                    self.transport.broadcast(&dsdl::NODE_STATUS, NODE_STATUS_PRIORITY, &payload);
            }
        }
    }

    fn handle_transfer(&mut self, transfer: &Transfer) {
        match (transfer.kind, transfer.data_type_id) {
            (TransferKind::MessageBroadcast, 1) => {
                if self.transport.local_node_id() == 0 {
                    self.handle_allocation(transfer);
                }
            }
            (TransferKind::ServiceRequest, 1) => self.handle_get_node_info(transfer),
            (TransferKind::ServiceRequest, 40) => self.handle_begin_firmware_update(transfer),
            (TransferKind::ServiceRequest, 5) => self.handle_restart(transfer),
            (TransferKind::ServiceResponse, 48) => self.handle_file_read_response(transfer),
            _ => {}
        }
    }

    fn handle_allocation(&mut self, transfer: &Transfer) {
        // Rule C: any allocation traffic re-rolls our next attempt, so
        // two bootstrapping nodes cannot stay synchronised.
        self.next_allocation_attempt_at = self.clock.now() + self.allocation_jitter();

        // Anonymous frames are other nodes' requests, not echoes.
        if transfer.source_node_id == 0 {
            return;
        }
        let Some(allocation) = dsdl::decode_allocation(&transfer.payload) else { return };
        let echoed = allocation.unique_id;
        if echoed.is_empty() {
            return;
        }
        if echoed != &self.options.unique_id[..echoed.len().min(16)] {
            self.uid_offset = 0;
            return;
        }
        if echoed.len() == 16 {
            if (1..=127).contains(&allocation.node_id) {
                self.transport.set_local_node_id(allocation.node_id);
            }
        } else {
            self.uid_offset = echoed.len();
            let (low, high) = ALLOCATION_FOLLOWUP_PERIOD;
            self.next_allocation_attempt_at =
                self.clock.now() + Microseconds(self.rng.in_range(low, high));
        }
    }

    fn handle_get_node_info(&mut self, request: &Transfer) {
        let now = self.clock.now();
        let uptime_sec = ((now - self.started_at).0 / 1_000_000) as u32;
        let payload = dsdl::encode_node_info_response(&dsdl::NodeInfo {
            status: dsdl::encode_node_status(uptime_sec, self.health, self.mode),
            software_version: self.bootloader.app_info(),
            hardware_version: self.options.hardware_version,
            unique_id: &self.options.unique_id,
            name: self.options.name,
        });
        let _ = self.transport.respond(&dsdl::GET_NODE_INFO, SERVICE_PRIORITY, request, &payload);
    }

    fn handle_begin_firmware_update(&mut self, request: &Transfer) {
        let error = match dsdl::decode_begin_firmware_update(&request.payload) {
            Some(_) if self.server_node_id != 0 => {
                // The server restarted the session mid-download; the
                // running transfer winds down as cancelled.
                self.download_cancelled = true;
                dsdl::FIRMWARE_UPDATE_IN_PROGRESS
            }
            Some(update) => {
                self.server_node_id = if (1..=127).contains(&update.source_node_id) {
                    update.source_node_id
                } else {
                    request.source_node_id
                };
                self.file_path = update.path;
                dsdl::FIRMWARE_UPDATE_OK
            }
            None => dsdl::FIRMWARE_UPDATE_UNKNOWN_ERROR,
        };
        let payload = dsdl::encode_begin_firmware_update_response(error);
        let _ = self.transport.respond(
            &dsdl::BEGIN_FIRMWARE_UPDATE,
            SERVICE_PRIORITY,
            request,
            &payload,
        );
    }

    fn handle_restart(&mut self, request: &Transfer) {
        let ok = dsdl::decode_restart_request(&request.payload) == Some(dsdl::RESTART_MAGIC);
        let payload = dsdl::encode_restart_response(ok);
        let _ = self.transport.respond(&dsdl::RESTART_NODE, SERVICE_PRIORITY, request, &payload);
        if ok {
            self.restart.request();
        }
    }

    fn handle_file_read_response(&mut self, response: &Transfer) {
        if response.source_node_id != self.server_node_id {
            return;
        }
        let Some(pending) = self.pending_read.as_mut() else { return };
        if pending.transfer_id != response.transfer_id || pending.response.is_some() {
            return;
        }
        pending.response = Some(response.payload.clone());
    }

    /// Fetches one window of the remote file, retrying a few times
    /// before declaring the protocol dead.
    fn read_window(&mut self, offset: u64) -> Result<Vec<u8, { dsdl::FILE_READ_WINDOW }>, Error> {
        for _ in 0..FILE_READ_ATTEMPTS {
            if self.restart.is_requested() || self.download_cancelled {
                return Err(Error::TransferCancelledByRemote);
            }

            let request = dsdl::encode_file_read_request(offset, &self.file_path);
            let transfer_id = self.transport.request(
                &dsdl::FILE_READ,
                SERVICE_PRIORITY,
                self.server_node_id,
                &request,
            )?;
            self.pending_read = Some(PendingRead { transfer_id, response: None });

            let deadline = self.clock.now() + FILE_READ_TIMEOUT;
            while self.clock.now() < deadline {
                self.poll();
                if self.restart.is_requested() || self.download_cancelled {
                    self.pending_read = None;
                    return Err(Error::TransferCancelledByRemote);
                }
                let done =
                    self.pending_read.as_ref().map(|p| p.response.is_some()).unwrap_or(false);
                if !done {
                    continue;
                }

                let payload = self.pending_read.take().and_then(|p| p.response).unwrap();
                let response =
                    dsdl::decode_file_read_response(&payload).ok_or(Error::ProtocolError)?;
                if response.error < 0 {
                    return Err(Error::RemoteRefusedToProvideFile);
                }
                return Vec::from_slice(response.data).map_err(|_| Error::ProtocolError);
            }
            self.pending_read = None;
        }
        Err(Error::ProtocolError)
    }
}

impl<I, S, C, M> Downloader for UavcanNode<'_, I, S, C, M>
where
    I: CanInterface,
    S: StorageBackend,
    C: Clock,
    M: RawMutex,
    Error: From<S::Error>,
{
    /// Reads the remote file window by window until an empty response
    /// signals EOF, streaming each window into the sink.
    fn download(&mut self, sink: &mut dyn DownloadSink) -> Result<(), Error> {
        let mut offset = 0u64;
        loop {
            let window = self.read_window(offset)?;
            if window.is_empty() {
                return Ok(());
            }
            sink.handle_chunk(&window)?;
            offset += window.len() as u64;
        }
    }
}
