//! Blob framing for region payloads.
//!
//! Every region written by this crate starts with a fixed header followed by
//! the payload bytes:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  magic (8 bytes)                             │
//! │  version (u32 LE, major.minor packed)        │
//! │  len (u32 LE, payload length)                │
//! ├──────────────────────────────────────────────┤
//! │  payload (len bytes)                         │
//! ├──────────────────────────────────────────────┤
//! │  unused capacity                             │
//! └──────────────────────────────────────────────┘
//! ```

use crate::LayoutError;

/// Size of [`BlobHeader`] on the wire.
pub const BLOB_HEADER_LEN: usize = 16;

/// Current layout version (major.minor packed into u32).
/// Major = high 16 bits, minor = low 16 bits.
pub const LAYOUT_VERSION: u32 = 1 << 16; // v1.0

/// Header preceding the payload in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Identifies what kind of region this is.
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl BlobHeader {
    /// Create a header for a payload of `len` bytes.
    pub fn new(magic: [u8; 8], len: u32) -> Self {
        Self {
            magic,
            version: LAYOUT_VERSION,
            len,
        }
    }

    /// Encode into the on-wire representation.
    pub fn to_bytes(&self) -> [u8; BLOB_HEADER_LEN] {
        let mut out = [0u8; BLOB_HEADER_LEN];
        out[..8].copy_from_slice(&self.magic);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode from the on-wire representation.
    pub fn from_bytes(bytes: &[u8; BLOB_HEADER_LEN]) -> Self {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let len = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Self {
            magic,
            version,
            len,
        }
    }

    /// Validate against the expected magic and the space left in the region.
    pub fn validate(&self, expected_magic: &[u8; 8], available: usize) -> Result<(), LayoutError> {
        if &self.magic != expected_magic {
            return Err(LayoutError::InvalidMagic);
        }
        let major = self.version >> 16;
        let our_major = LAYOUT_VERSION >> 16;
        if major != our_major {
            return Err(LayoutError::IncompatibleVersion {
                expected: LAYOUT_VERSION,
                found: self.version,
            });
        }
        if self.len as usize > available {
            return Err(LayoutError::Truncated {
                len: self.len as usize,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 8] = *b"TESTBLOB";

    #[test]
    fn header_bytes_are_little_endian() {
        let bytes = BlobHeader::new(MAGIC, 0x0102_0304).to_bytes();
        assert_eq!(&bytes[..8], b"TESTBLOB");
        assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(BlobHeader::from_bytes(&bytes).len, 0x0102_0304);
    }

    #[test]
    fn validate_rejects_foreign_magic() {
        let header = BlobHeader::new(*b"OTHERMAG", 4);
        assert_eq!(header.validate(&MAGIC, 64), Err(LayoutError::InvalidMagic));
    }

    #[test]
    fn validate_rejects_major_version_mismatch() {
        let mut header = BlobHeader::new(MAGIC, 4);
        header.version = 2 << 16;
        assert!(matches!(
            header.validate(&MAGIC, 64),
            Err(LayoutError::IncompatibleVersion { .. })
        ));

        // Minor bumps are compatible.
        header.version = LAYOUT_VERSION | 3;
        assert!(header.validate(&MAGIC, 64).is_ok());
    }

    #[test]
    fn validate_rejects_length_past_capacity() {
        let header = BlobHeader::new(MAGIC, 65);
        assert_eq!(
            header.validate(&MAGIC, 64),
            Err(LayoutError::Truncated {
                len: 65,
                available: 64
            })
        );
    }
}
