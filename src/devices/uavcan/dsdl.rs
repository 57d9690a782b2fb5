//! Data type registry and payload codecs.
//!
//! Covers exactly the UAVCAN v0 messages and services the update node
//! speaks. Encodings are byte-oriented except where the standard packs
//! sub-byte fields (node status, allocation head, restart response);
//! those are composed by hand with the leading bits zero-filled.

use heapless::{String, Vec};
use nom::bytes::complete::take;
use nom::number::complete::le_i16;
use nom::IResult;

use crate::devices::image::AppInfo;
use crate::devices::uavcan::transport::TransferKind;

/// Identification of a protocol data type: the numeric ID and the
/// 64-bit DSDL signature that seeds multi-frame transfer CRCs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataType {
    pub id: u16,
    pub signature: u64,
}

pub const NODE_STATUS: DataType = DataType { id: 341, signature: 0x0F08_68D0_C1A7_C6F1 };
pub const DYNAMIC_NODE_ID_ALLOCATION: DataType =
    DataType { id: 1, signature: 0x0B2A_8126_20A1_1D40 };
pub const GET_NODE_INFO: DataType = DataType { id: 1, signature: 0xEE46_8A81_21C4_6A9E };
pub const BEGIN_FIRMWARE_UPDATE: DataType = DataType { id: 40, signature: 0xB7D7_25DF_7272_4126 };
pub const FILE_READ: DataType = DataType { id: 48, signature: 0x8DCD_CA93_9F33_F678 };
pub const RESTART_NODE: DataType = DataType { id: 5, signature: 0x569E_0539_4A30_17F0 };

/// Signature lookup for the types this node accepts; unknown types are
/// not received at all.
pub fn signature_for(kind: TransferKind, data_type_id: u16) -> Option<u64> {
    match kind {
        TransferKind::MessageBroadcast => match data_type_id {
            341 => Some(NODE_STATUS.signature),
            1 => Some(DYNAMIC_NODE_ID_ALLOCATION.signature),
            _ => None,
        },
        TransferKind::ServiceRequest | TransferKind::ServiceResponse => match data_type_id {
            1 => Some(GET_NODE_INFO.signature),
            40 => Some(BEGIN_FIRMWARE_UPDATE.signature),
            48 => Some(FILE_READ.signature),
            5 => Some(RESTART_NODE.signature),
            _ => None,
        },
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeHealth {
    Ok = 0,
    Error = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeMode {
    Maintenance = 2,
    SoftwareUpdate = 3,
}

pub const NODE_STATUS_PAYLOAD_SIZE: usize = 7;

/// uptime (32 bits, LE), then a byte of 2-bit health and 3-bit mode
/// with the trailing sub-mode bits zero, then the vendor status word.
pub fn encode_node_status(
    uptime_sec: u32,
    health: NodeHealth,
    mode: NodeMode,
) -> [u8; NODE_STATUS_PAYLOAD_SIZE] {
    let mut payload = [0u8; NODE_STATUS_PAYLOAD_SIZE];
    payload[..4].copy_from_slice(&uptime_sec.to_le_bytes());
    payload[4] = ((health as u8) << 6) | ((mode as u8) << 3);
    payload
}

/// Unique-ID bytes carried per allocation request.
pub const ALLOCATION_UID_CHUNK: usize = 6;

/// Request payload: the 7-bit preferred node ID (zero: any) packed
/// above the first-part flag, then the unique-ID chunk.
pub fn encode_allocation_request(first_part: bool, uid_chunk: &[u8]) -> Vec<u8, 7> {
    debug_assert!(uid_chunk.len() <= ALLOCATION_UID_CHUNK);
    let mut payload = Vec::new();
    payload.push(u8::from(first_part)).ok();
    payload.extend_from_slice(uid_chunk).ok();
    payload
}

/// A received allocation broadcast: either another node's request or
/// an allocator's (partial) echo of a unique ID.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation<'a> {
    pub node_id: u8,
    pub first_part: bool,
    pub unique_id: &'a [u8],
}

pub fn decode_allocation(payload: &[u8]) -> Option<Allocation<'_>> {
    let (&head, unique_id) = payload.split_first()?;
    if unique_id.len() > 16 {
        return None;
    }
    Some(Allocation { node_id: head >> 1, first_part: head & 1 != 0, unique_id })
}

pub const MAX_NODE_NAME: usize = 80;

/// Everything the GetNodeInfo response carries.
pub struct NodeInfo<'a> {
    pub status: [u8; NODE_STATUS_PAYLOAD_SIZE],
    /// Software version block; `None` when no application is resident.
    pub software_version: Option<AppInfo>,
    pub hardware_version: (u8, u8),
    pub unique_id: &'a [u8; 16],
    pub name: &'a str,
}

/// Optional-field flags: both the VCS commit and the image CRC fields
/// of the software version are populated.
const SOFTWARE_VERSION_FLAGS: u8 = 3;

pub fn encode_node_info_response(info: &NodeInfo) -> Vec<u8, 128> {
    debug_assert!(info.name.len() <= MAX_NODE_NAME);
    let mut payload = Vec::new();
    payload.extend_from_slice(&info.status).ok();

    let (major, minor, vcs_commit, image_crc) = match info.software_version {
        Some(app) => (app.major_version, app.minor_version, app.vcs_commit, app.image_crc),
        None => (0, 0, 0, 0),
    };
    payload.push(major).ok();
    payload.push(minor).ok();
    payload.push(SOFTWARE_VERSION_FLAGS).ok();
    payload.extend_from_slice(&vcs_commit.to_le_bytes()).ok();
    payload.extend_from_slice(&image_crc.to_le_bytes()).ok();

    payload.push(info.hardware_version.0).ok();
    payload.push(info.hardware_version.1).ok();
    payload.extend_from_slice(info.unique_id).ok();
    // Empty certificate of authenticity
    payload.push(0).ok();

    payload.extend_from_slice(&info.name.as_bytes()[..info.name.len().min(MAX_NODE_NAME)]).ok();
    payload
}

pub const MAX_FILE_PATH: usize = 200;

/// Firmware update error codes of the BeginFirmwareUpdate response.
pub const FIRMWARE_UPDATE_OK: u8 = 0;
pub const FIRMWARE_UPDATE_IN_PROGRESS: u8 = 2;
pub const FIRMWARE_UPDATE_UNKNOWN_ERROR: u8 = 255;

#[derive(Debug, PartialEq, Eq)]
pub struct FirmwareUpdateRequest {
    pub source_node_id: u8,
    pub path: String<MAX_FILE_PATH>,
}

pub fn decode_begin_firmware_update(payload: &[u8]) -> Option<FirmwareUpdateRequest> {
    let (&source_node_id, path) = payload.split_first()?;
    if path.len() > MAX_FILE_PATH {
        return None;
    }
    let path = String::from(core::str::from_utf8(path).ok()?);
    Some(FirmwareUpdateRequest { source_node_id, path })
}

pub fn encode_begin_firmware_update_response(error: u8) -> [u8; 1] { [error] }

/// Request: a 40-bit file offset, then the path as the tail array.
pub fn encode_file_read_request(offset: u64, path: &str) -> Vec<u8, 205> {
    debug_assert!(path.len() <= MAX_FILE_PATH);
    let mut payload = Vec::new();
    payload.extend_from_slice(&offset.to_le_bytes()[..5]).ok();
    payload.extend_from_slice(&path.as_bytes()[..path.len().min(MAX_FILE_PATH)]).ok();
    payload
}

/// Largest data window a FileRead response may carry.
pub const FILE_READ_WINDOW: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub struct FileReadResponse<'a> {
    /// Negative values are remote filesystem errors.
    pub error: i16,
    pub data: &'a [u8],
}

fn parse_file_read_response(input: &[u8]) -> IResult<&[u8], i16> { le_i16(input) }

pub fn decode_file_read_response(payload: &[u8]) -> Option<FileReadResponse<'_>> {
    let (data, error) = parse_file_read_response(payload).ok()?;
    if data.len() > FILE_READ_WINDOW {
        return None;
    }
    Some(FileReadResponse { error, data })
}

/// The magic number authorising a restart.
pub const RESTART_MAGIC: u64 = 0xACCE551B1E;

fn parse_restart_magic(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, bytes) = take(5usize)(input)?;
    let mut magic = [0u8; 8];
    magic[..5].copy_from_slice(bytes);
    Ok((input, u64::from_le_bytes(magic)))
}

pub fn decode_restart_request(payload: &[u8]) -> Option<u64> {
    parse_restart_magic(payload).ok().map(|(_, magic)| magic)
}

pub fn encode_restart_response(ok: bool) -> [u8; 1] { [if ok { 1 << 7 } else { 0 }] }
