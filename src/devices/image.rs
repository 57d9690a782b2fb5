//! Application image descriptor and integrity scan.
//!
//! A bootable application carries a 32-byte descriptor somewhere in
//! its first storage region, aligned to 8 bytes. The descriptor names
//! the image size and the CRC-64/WE of the image with the stored CRC
//! field itself zeroed out. [`locate_descriptor`] walks the storage
//! until it finds a descriptor that is both well-formed and backed by
//! a matching image checksum.

use nom::bytes::complete::{tag, take};
use nom::number::complete::{le_u32, le_u64, le_u8};
use nom::IResult;
use static_assertions::const_assert_eq;

use crate::hal::storage::StorageBackend;
use crate::utilities::crc::Crc64We;

/// Marker preceding the application info block.
pub const DESCRIPTOR_SIGNATURE: [u8; 8] = *b"APDesc00";

/// Images are padded to this multiple, and descriptors aligned to it.
pub const IMAGE_PADDING: u32 = 8;

/// On-storage size of [`AppDescriptor`].
pub const DESCRIPTOR_SIZE: usize = 32;
const APP_INFO_SIZE: usize = 18;
const RESERVED_SIZE: usize = 6;
const_assert_eq!(DESCRIPTOR_SIZE, DESCRIPTOR_SIGNATURE.len() + APP_INFO_SIZE + RESERVED_SIZE);

/// Offset of the stored image CRC within the descriptor.
const CRC_FIELD_OFFSET: usize = 8;
const CRC_FIELD_SIZE: usize = 8;

/// Scan reads are issued in chunks of this size; backend read latency
/// dominates the scan, so reads must never be issued byte by byte.
/// This is also the largest slice fed to the CRC without yielding.
pub const SCAN_CHUNK_SIZE: usize = 1024;

/// Description of the application image currently stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppInfo {
    pub image_crc: u64,
    pub image_size: u32,
    pub vcs_commit: u32,
    pub major_version: u8,
    pub minor_version: u8,
}

/// The signature-bearing structure embedded in the application image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppDescriptor {
    pub app_info: AppInfo,
}

fn parse_app_info(input: &[u8]) -> IResult<&[u8], AppInfo> {
    let (input, image_crc) = le_u64(input)?;
    let (input, image_size) = le_u32(input)?;
    let (input, vcs_commit) = le_u32(input)?;
    let (input, major_version) = le_u8(input)?;
    let (input, minor_version) = le_u8(input)?;
    Ok((input, AppInfo { image_crc, image_size, vcs_commit, major_version, minor_version }))
}

impl AppDescriptor {
    /// Parses a descriptor from its on-storage representation. The
    /// reserved bytes are ignored on read.
    pub fn parse(input: &[u8]) -> IResult<&[u8], AppDescriptor> {
        let (input, _) = tag(&DESCRIPTOR_SIGNATURE[..])(input)?;
        let (input, app_info) = parse_app_info(input)?;
        let (input, _) = take(RESERVED_SIZE)(input)?;
        Ok((input, AppDescriptor { app_info }))
    }

    /// The on-storage representation. Reserved bytes are written as
    /// zero.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut bytes = [0u8; DESCRIPTOR_SIZE];
        bytes[..8].copy_from_slice(&DESCRIPTOR_SIGNATURE);
        bytes[8..16].copy_from_slice(&self.app_info.image_crc.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.app_info.image_size.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.app_info.vcs_commit.to_le_bytes());
        bytes[24] = self.app_info.major_version;
        bytes[25] = self.app_info.minor_version;
        bytes
    }

    /// Structural validity: size within bounds and padded. Does not
    /// touch the image itself; see [`locate_descriptor`] for the CRC
    /// check.
    pub fn is_valid(&self, max_image_size: u32) -> bool {
        self.app_info.image_size > 0
            && self.app_info.image_size <= max_image_size
            && self.app_info.image_size % IMAGE_PADDING == 0
    }
}

/// Walks the backend from offset zero in 8-byte steps looking for the
/// first authentic descriptor, returning it with its byte offset.
///
/// A 64-bit signature can collide with unrelated data, so a candidate
/// that fails validation or the image CRC never aborts the scan; the
/// scan only terminates when a read fails or comes back short. The
/// `max_image_size` bound prunes colliding garbage before the (costly)
/// CRC pass.
pub fn locate_descriptor<S>(
    backend: &mut S,
    max_image_size: u32,
    chunk: &mut [u8; SCAN_CHUNK_SIZE],
) -> Option<(AppDescriptor, usize)>
where
    S: StorageBackend,
{
    let mut offset = 0usize;
    loop {
        let mut signature = [0u8; 8];
        match backend.read(offset, &mut signature) {
            Ok(n) if n == signature.len() => {}
            _ => return None,
        }
        if signature != DESCRIPTOR_SIGNATURE {
            offset += IMAGE_PADDING as usize;
            continue;
        }

        let mut raw = [0u8; DESCRIPTOR_SIZE];
        match backend.read(offset, &mut raw) {
            Ok(n) if n == raw.len() => {}
            _ => return None,
        }
        match AppDescriptor::parse(&raw) {
            Ok((_, descriptor)) if descriptor.is_valid(max_image_size) => {
                if verify_image_crc(backend, offset, &descriptor, chunk) {
                    return Some((descriptor, offset));
                }
            }
            _ => {}
        }
        offset += IMAGE_PADDING as usize;
    }
}

/// Computes the image CRC with the stored CRC field replaced by zeros
/// and compares it against the descriptor's claim. Reads are chunked;
/// a failed read simply truncates the computation, which cannot
/// produce a false positive.
fn verify_image_crc<S>(
    backend: &mut S,
    descriptor_offset: usize,
    descriptor: &AppDescriptor,
    chunk: &mut [u8; SCAN_CHUNK_SIZE],
) -> bool
where
    S: StorageBackend,
{
    let crc_field_offset = descriptor_offset + CRC_FIELD_OFFSET;
    let image_size = descriptor.app_info.image_size as usize;
    let mut crc = Crc64We::new();

    let mut position = 0usize;
    while position < crc_field_offset {
        let wanted = (crc_field_offset - position).min(chunk.len());
        match backend.read(position, &mut chunk[..wanted]) {
            Ok(n) if n > 0 => {
                crc.update(&chunk[..n]);
                position += n;
            }
            _ => break,
        }
    }

    crc.update(&[0u8; CRC_FIELD_SIZE]);

    let mut position = crc_field_offset + CRC_FIELD_SIZE;
    while position < image_size {
        let wanted = (image_size - position).min(chunk.len());
        match backend.read(position, &mut chunk[..wanted]) {
            Ok(n) if n > 0 => {
                crc.update(&chunk[..n]);
                position += n;
            }
            _ => break,
        }
    }

    crc.finalize() == descriptor.app_info.image_crc
}
