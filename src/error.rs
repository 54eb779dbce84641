//! Error types for relift.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which kind of output region ran out of space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Code,
    Data,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code => write!(f, "code"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Errors that can occur while rewriting a PE image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("malformed PE image: {0}")]
    MalformedPe(&'static str),

    #[error("instruction at RVA 0x{rva:X} cannot be decoded")]
    DecodeFailure { rva: u32 },

    #[error("target RVA 0x{rva:X} lies outside all discovered blocks")]
    IncompleteCoverage { rva: u32 },

    #[error("branch targeting RVA 0x{rva:X} exceeds its displacement range")]
    BranchOutOfRange { rva: u32 },

    #[error("RIP-relative displacement targeting RVA 0x{rva:X} exceeds 32 bits")]
    DispOutOfRange { rva: u32 },

    #[error("no remaining {0} region can hold the next write")]
    OutOfSpace(RegionKind),

    #[error("{0} forward references survived emission")]
    UnresolvedForwardRef(usize),

    #[error("resolver returned a null address for {module}!{routine}")]
    ImportResolveFailure { module: String, routine: String },

    #[error("invalid symbol id {0}")]
    InvalidSymbol(u32),

    #[error("block {0} can no longer be modified")]
    BlockFinalized(u32),

    #[error("disassembly has not run yet")]
    NotDisassembled,

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
