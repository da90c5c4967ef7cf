//! File transfer header codec
//!
//! Layout (big-endian):
//!
//! ```text
//! magic "RVFT" | u16 header length | u16 type | u64 cookie
//! u16 files_left | u16 total_files | u16 parts_left | u16 total_parts
//! u64 total_size | u64 file_size | u32 mod_time | u32 checksum
//! u64 bytes_received | u32 received_checksum
//! u16 segment count | (u16 length, UTF-8 bytes) per segment
//! ```
//!
//! The header length covers the whole header, magic included.

use crate::checksum::EMPTY_CHECKSUM;
use crate::control::SessionId;
use crate::error::{Result, RendezvousError};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Magic bytes that open every header
pub const HEADER_MAGIC: [u8; 4] = *b"RVFT";

/// Size of a header with no name segments
pub const FIXED_HEADER_LEN: usize = 62;

/// Largest header accepted from a peer
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// Header type codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    /// Sender offers a file
    Send = 0x0101,
    /// Receiver wants the whole file
    Ack = 0x0202,
    /// Receiver stored the file
    Received = 0x0204,
    /// Receiver already has a prefix of the file
    Resume = 0x0205,
    /// Sender confirms the offset it will stream from
    ResumeSend = 0x0106,
}

impl HeaderType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0101 => Some(Self::Send),
            0x0202 => Some(Self::Ack),
            0x0204 => Some(Self::Received),
            0x0205 => Some(Self::Resume),
            0x0106 => Some(Self::ResumeSend),
            _ => None,
        }
    }
}

/// One file transfer header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferHeader {
    pub header_type: HeaderType,
    pub cookie: SessionId,
    pub files_left: u16,
    pub total_files: u16,
    pub parts_left: u16,
    pub total_parts: u16,
    pub total_size: u64,
    pub file_size: u64,
    /// Modification time in seconds since the Unix epoch
    pub mod_time: u32,
    pub checksum: u32,
    pub bytes_received: u64,
    pub received_checksum: u32,
    /// Relative name, one entry per path segment
    pub name: Vec<String>,
}

impl FileTransferHeader {
    /// Empty header of the given type
    pub fn new(header_type: HeaderType, cookie: SessionId) -> Self {
        Self {
            header_type,
            cookie,
            files_left: 0,
            total_files: 0,
            parts_left: 0,
            total_parts: 0,
            total_size: 0,
            file_size: 0,
            mod_time: 0,
            checksum: EMPTY_CHECKSUM,
            bytes_received: 0,
            received_checksum: EMPTY_CHECKSUM,
            name: Vec::new(),
        }
    }

    /// Reply header that keeps the counters and file fields of `self`
    pub fn reply(&self, header_type: HeaderType) -> Self {
        Self {
            header_type,
            ..self.clone()
        }
    }

    /// Name segments joined with `/`
    pub fn display_name(&self) -> String {
        self.name.join("/")
    }

    /// Validate the name and turn it into a relative local path
    pub fn relative_path(&self) -> Result<PathBuf> {
        if self.name.is_empty() {
            return Err(RendezvousError::protocol("File name has no segments"));
        }
        let mut path = PathBuf::new();
        for segment in &self.name {
            validate_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Serialize the header
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + 32);
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&(self.header_type as u16).to_be_bytes());
        buf.extend_from_slice(&self.cookie.0.to_be_bytes());
        buf.extend_from_slice(&self.files_left.to_be_bytes());
        buf.extend_from_slice(&self.total_files.to_be_bytes());
        buf.extend_from_slice(&self.parts_left.to_be_bytes());
        buf.extend_from_slice(&self.total_parts.to_be_bytes());
        buf.extend_from_slice(&self.total_size.to_be_bytes());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.mod_time.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.bytes_received.to_be_bytes());
        buf.extend_from_slice(&self.received_checksum.to_be_bytes());

        let count = u16::try_from(self.name.len())
            .map_err(|_| RendezvousError::protocol("Too many name segments"))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for segment in &self.name {
            let len = u16::try_from(segment.len())
                .map_err(|_| RendezvousError::protocol("Name segment too long"))?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(segment.as_bytes());
        }

        if buf.len() > MAX_HEADER_LEN {
            return Err(RendezvousError::protocol(format!(
                "Header of {} bytes exceeds {}",
                buf.len(),
                MAX_HEADER_LEN
            )));
        }
        let len = buf.len() as u16;
        buf[4..6].copy_from_slice(&len.to_be_bytes());
        Ok(buf)
    }

    /// Write the header and flush
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| RendezvousError::connection("peer", e))
    }

    /// Read one header
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; 6];
        reader
            .read_exact(&mut prefix)
            .map_err(|e| RendezvousError::connection("peer", e))?;
        if prefix[..4] != HEADER_MAGIC {
            return Err(RendezvousError::protocol(format!(
                "Bad header magic {:02x?}",
                &prefix[..4]
            )));
        }
        let len = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
        if !(FIXED_HEADER_LEN..=MAX_HEADER_LEN).contains(&len) {
            return Err(RendezvousError::protocol(format!("Bad header length {}", len)));
        }

        let mut rest = vec![0u8; len - prefix.len()];
        reader
            .read_exact(&mut rest)
            .map_err(|e| RendezvousError::connection("peer", e))?;
        Self::decode_body(&rest)
    }

    fn decode_body(data: &[u8]) -> Result<Self> {
        let mut r = Fields { data, pos: 0 };
        let raw_type = r.u16()?;
        let header_type = HeaderType::from_u16(raw_type)
            .ok_or_else(|| RendezvousError::protocol(format!("Unknown header type {:#06x}", raw_type)))?;

        let mut header = Self {
            header_type,
            cookie: SessionId(r.u64()?),
            files_left: r.u16()?,
            total_files: r.u16()?,
            parts_left: r.u16()?,
            total_parts: r.u16()?,
            total_size: r.u64()?,
            file_size: r.u64()?,
            mod_time: r.u32()?,
            checksum: r.u32()?,
            bytes_received: r.u64()?,
            received_checksum: r.u32()?,
            name: Vec::new(),
        };

        let count = r.u16()?;
        for _ in 0..count {
            let len = r.u16()? as usize;
            let bytes = r.take(len)?;
            let segment = std::str::from_utf8(bytes)
                .map_err(|_| RendezvousError::protocol("Name segment is not UTF-8"))?;
            header.name.push(segment.to_string());
        }
        if r.pos != data.len() {
            return Err(RendezvousError::protocol("Trailing bytes after header"));
        }
        Ok(header)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0');
    if bad {
        return Err(RendezvousError::protocol(format!("Unsafe name segment '{}'", segment)));
    }
    Ok(())
}

struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(RendezvousError::protocol("Truncated header"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_header() -> FileTransferHeader {
        let mut header = FileTransferHeader::new(HeaderType::Send, SessionId(0x0102_0304_0506_0708));
        header.files_left = 2;
        header.total_files = 2;
        header.parts_left = 1;
        header.total_parts = 1;
        header.total_size = 300;
        header.file_size = 100;
        header.mod_time = 1_700_000_000;
        header.checksum = 0xABCD_0000;
        header.name = vec!["docs".to_string(), "report.txt".to_string()];
        header
    }

    #[test]
    fn test_fixed_layout() {
        let header = FileTransferHeader::new(HeaderType::Ack, SessionId(1));
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), FIXED_HEADER_LEN);
        assert_eq!(&bytes[..4], b"RVFT");
        assert_eq!(&bytes[4..6], &(FIXED_HEADER_LEN as u16).to_be_bytes());
        assert_eq!(&bytes[6..8], &[0x02, 0x02]);
        assert_eq!(&bytes[8..16], &1u64.to_be_bytes());
    }

    #[test]
    fn test_read_back_with_segments() {
        let header = send_header();
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), FIXED_HEADER_LEN + 2 + 4 + 2 + 10);

        let decoded = FileTransferHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.display_name(), "docs/report.txt");
        assert_eq!(decoded.relative_path().unwrap(), PathBuf::from("docs").join("report.txt"));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = send_header().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            FileTransferHeader::read_from(&mut bytes.as_slice()),
            Err(RendezvousError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = send_header().encode().unwrap();
        bytes[6..8].copy_from_slice(&0x0999u16.to_be_bytes());
        assert!(FileTransferHeader::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_unsafe_segments_rejected() {
        for bad in ["..", ".", "", "a/b", "a\\b"] {
            let mut header = send_header();
            header.name = vec!["ok".to_string(), bad.to_string()];
            assert!(header.relative_path().is_err(), "accepted {:?}", bad);
        }

        let mut header = send_header();
        header.name.clear();
        assert!(header.relative_path().is_err());
    }

    #[test]
    fn test_reply_keeps_fields() {
        let header = send_header();
        let reply = header.reply(HeaderType::Received);
        assert_eq!(reply.header_type, HeaderType::Received);
        assert_eq!(reply.file_size, header.file_size);
        assert_eq!(reply.name, header.name);
    }
}
