use thiserror::Error;

/// A structural corruption report: a named subsystem, optionally the
/// offending block number, and a human-readable message.
///
/// Every invariant violation in the B-tree layer
/// surfaces as one of these. The reference checker treats these as
/// fatal and aborts the process; this crate propagates them as `Err`
/// instead and leaves the abort decision to the caller (see `apfsck`).
#[derive(Error, Debug)]
#[error("{subsystem}: {message}{}", .block.map(|b| format!(" (block {b})")).unwrap_or_default())]
pub struct Structural {
    pub subsystem: &'static str,
    pub block: Option<u64>,
    pub message: String,
}

impl Structural {
    pub fn new(subsystem: &'static str, message: impl Into<String>) -> Self {
        Structural { subsystem, block: None, message: message.into() }
    }

    pub fn at_block(subsystem: &'static str, block: u64, message: impl Into<String>) -> Self {
        Structural { subsystem, block: Some(block), message: message.into() }
    }
}

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("no volume found in container")]
    NoVolume,

    /// A proven Invariant violation — the checker's primary output.
    #[error(transparent)]
    Structural(#[from] Structural),

    /// A feature the checker recognizes but deliberately does not
    /// validate (e.g. non-empty snapshot metadata, encrypted volumes).
    /// Kept distinct from `Structural` so callers can tell "your FS
    /// uses something we don't validate" from "your FS is broken".
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl ApfsError {
    pub fn structural(subsystem: &'static str, message: impl Into<String>) -> Self {
        ApfsError::Structural(Structural::new(subsystem, message))
    }

    pub fn structural_at(subsystem: &'static str, block: u64, message: impl Into<String>) -> Self {
        ApfsError::Structural(Structural::at_block(subsystem, block, message))
    }
}

pub type Result<T> = std::result::Result<T, ApfsError>;
