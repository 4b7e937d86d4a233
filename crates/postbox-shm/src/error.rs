use std::fmt;
use std::io;

/// Errors from shared-memory operations.
#[derive(Debug)]
pub enum ShmError {
    /// I/O error from the OS.
    Io(io::Error),
    /// No region with this name exists.
    NotFound(String),
    /// A region with this name already exists.
    AlreadyExists(String),
    /// The name cannot be used as a shared-memory object name.
    InvalidName(String),
    /// The region contents do not have the expected layout.
    Layout(LayoutError),
    /// A blob does not fit in the region.
    TooLarge { len: usize, capacity: usize },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::NotFound(name) => write!(f, "shared memory region not found: {}", name),
            Self::AlreadyExists(name) => {
                write!(f, "shared memory region already exists: {}", name)
            }
            Self::InvalidName(name) => write!(f, "invalid shared memory name: {:?}", name),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::TooLarge { len, capacity } => {
                write!(f, "blob of {} bytes exceeds capacity of {} bytes", len, capacity)
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for ShmError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

/// Errors from validating a region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The magic bytes do not match the expected region kind.
    InvalidMagic,
    /// The region was written by an incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// The header claims more bytes than the region holds.
    Truncated { len: usize, available: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible layout version: expected {:#x}, found {:#x}",
                expected, found
            ),
            Self::Truncated { len, available } => write!(
                f,
                "header claims {} bytes but only {} are available",
                len, available
            ),
        }
    }
}

impl std::error::Error for LayoutError {}
