use thiserror::Error;

/// Fatal error taxonomy for the recovery core.
///
/// `Corruption` and `ProtocolError` are fatal at the call site that raised
/// them; localized on-disk damage that this crate knows how to route around
/// (a bad directory block, a bad hashval) is reported through
/// [`crate::context::RepairDiagnostic`] instead of this type.
#[derive(Error, Debug)]
pub enum RepairError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("out of memory")]
    OutOfMemory,
    #[error("bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("parse error: {0}")]
    Parse(&'static str),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("CRC mismatch in {0}")]
    CrcMismatch(&'static str),
}

pub type Result<T> = std::result::Result<T, RepairError>;
