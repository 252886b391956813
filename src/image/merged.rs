//! Merged-binary container format.
//!
//! A merged binary packs several independently-typed firmware images into one
//! file so a single artifact can update the whole module. Segments follow
//! each other with no padding:
//!
//! ```text
//! +--------------------+
//! |  Header (16 bytes) |
//! +--------------------+
//! |  Payload (L bytes) |
//! +--------------------+
//! |  Header (16 bytes) |
//! +--------------------+
//! |        ...         |
//! +--------------------+
//! ```
//!
//! Header layout, little-endian:
//!
//! ```text
//! header_version(1) | reserved(1) | type_code(2) | length L(4) |
//! reserved(4) | reserved(2) | checksum(2)
//! ```
//!
//! The checksum is CRC16-CCITT over the 16-byte header with the checksum
//! field zeroed, followed by the L payload bytes.

use crate::error::{Error, Result};
use crate::protocol::crc::{crc16_update, crc16_xmodem};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Segment header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Header version written by [`append`].
pub const HEADER_VERSION: u8 = 0;

/// Byte offset of the checksum field within a segment header.
const CHECKSUM_OFFSET: usize = 14;

/// Image type carried by a container segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SegmentType {
    /// System firmware image.
    SystemImage = 1,
    /// User application image.
    UserApp = 2,
    /// Network information blob.
    NetworkInfo = 3,
    /// Second part of a split system image.
    SystemImagePart2 = 4,
}

impl SegmentType {
    /// Decode a wire type code. Unknown codes are a container error.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::SystemImage),
            2 => Some(Self::UserApp),
            3 => Some(Self::NetworkInfo),
            4 => Some(Self::SystemImagePart2),
            _ => None,
        }
    }

    /// Wire type code for this segment type.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Human-readable name, as printed by content listings.
    pub fn name(self) -> &'static str {
        match self {
            Self::SystemImage => "system image",
            Self::UserApp => "user application",
            Self::NetworkInfo => "network information",
            Self::SystemImagePart2 => "system image part 2",
        }
    }
}

/// One parsed container segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Image type.
    pub seg_type: SegmentType,
    /// Payload length in bytes.
    pub length: u32,
    /// Stored (and verified) CRC16 checksum.
    pub checksum: u16,
    /// Byte offset of the payload within the container.
    pub payload_offset: usize,
}

/// A parsed and checksum-verified merged binary.
pub struct MergedImage {
    segments: Vec<Segment>,
    data: Vec<u8>,
}

impl MergedImage {
    /// Load and verify a merged binary from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading merged binary from: {}", path.display());

        let mut data = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    /// Parse and verify a merged binary from raw bytes.
    ///
    /// Every segment is checked: an unknown type code, a checksum mismatch,
    /// or a truncated trailing segment invalidates the whole container. A
    /// container shorter than one header is invalid too.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() <= HEADER_LEN {
            return Err(Error::InvalidContainer(
                "file too small for a segment header".into(),
            ));
        }

        let mut segments = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if data.len() - offset < HEADER_LEN {
                return Err(Error::InvalidContainer(format!(
                    "truncated header at offset {offset}"
                )));
            }

            let header = &data[offset..offset + HEADER_LEN];
            let mut cursor = &header[2..];
            let type_code = cursor.read_u16::<LittleEndian>()?;
            let length = cursor.read_u32::<LittleEndian>()?;
            let checksum = u16::from_le_bytes([header[14], header[15]]);

            let seg_type = SegmentType::from_code(type_code).ok_or_else(|| {
                Error::InvalidContainer(format!(
                    "unknown segment type {type_code} at offset {offset}"
                ))
            })?;

            let payload_offset = offset + HEADER_LEN;
            let end = payload_offset + length as usize;
            if end > data.len() {
                return Err(Error::InvalidContainer(format!(
                    "truncated {} segment: need {} bytes, {} remain",
                    seg_type.name(),
                    length,
                    data.len() - payload_offset
                )));
            }

            let mut zeroed = [0u8; HEADER_LEN];
            zeroed.copy_from_slice(header);
            zeroed[CHECKSUM_OFFSET] = 0;
            zeroed[CHECKSUM_OFFSET + 1] = 0;
            let actual = crc16_update(crc16_xmodem(&zeroed), &data[payload_offset..end]);
            if actual != checksum {
                return Err(Error::CrcMismatch {
                    expected: checksum,
                    actual,
                });
            }

            debug!(
                "  segment {}: {} ({} bytes)",
                segments.len() + 1,
                seg_type.name(),
                length
            );
            segments.push(Segment {
                seg_type,
                length,
                checksum,
                payload_offset,
            });
            offset = end;
        }

        Ok(Self { segments, data })
    }

    /// The verified segments, in file order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Payload bytes of a segment.
    pub fn payload(&self, segment: &Segment) -> &[u8] {
        &self.data[segment.payload_offset..segment.payload_offset + segment.length as usize]
    }

    /// Iterate `(type, payload)` pairs in file order.
    pub fn extract(&self) -> impl Iterator<Item = (SegmentType, &[u8])> {
        self.segments
            .iter()
            .map(|segment| (segment.seg_type, self.payload(segment)))
    }

    /// Find the first segment of the given type.
    pub fn find(&self, seg_type: SegmentType) -> Option<&Segment> {
        self.segments.iter().find(|s| s.seg_type == seg_type)
    }
}

impl std::fmt::Debug for MergedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedImage")
            .field("segments", &self.segments)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Whether a file on disk is a valid merged binary.
pub fn is_valid<P: AsRef<Path>>(path: P) -> bool {
    MergedImage::from_file(path).is_ok()
}

/// Append one segment to a writer positioned at the end of a container.
///
/// Writes the header with a zero checksum, then the payload, then seeks back
/// and patches the checksum field — a single pass with a fixed 16-byte
/// overhead per segment.
pub fn append<W: Write + Seek>(out: &mut W, seg_type: SegmentType, payload: &[u8]) -> Result<()> {
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidContainer("payload larger than 4 GiB".into()))?;

    let mut header = [0u8; HEADER_LEN];
    header[0] = HEADER_VERSION;
    {
        let mut cursor = &mut header[2..];
        cursor.write_u16::<LittleEndian>(seg_type.code())?;
        cursor.write_u32::<LittleEndian>(length)?;
    }

    out.write_all(&header)?;
    out.write_all(payload)?;

    let checksum = crc16_update(crc16_xmodem(&header), payload);
    let back = i64::try_from(payload.len() + HEADER_LEN - CHECKSUM_OFFSET)
        .map_err(|_| Error::InvalidContainer("payload larger than 4 GiB".into()))?;
    out.seek(SeekFrom::Current(-back))?;
    out.write_u16::<LittleEndian>(checksum)?;
    out.seek(SeekFrom::End(0))?;

    debug!(
        "appended {} segment ({} bytes, crc {:#06x})",
        seg_type.name(),
        length,
        checksum
    );
    Ok(())
}

/// Build an in-memory container from `(type, payload)` pairs.
pub fn build(segments: &[(SegmentType, &[u8])]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    for &(seg_type, payload) in segments {
        append(&mut cursor, seg_type, payload)?;
    }
    Ok(cursor.into_inner())
}
