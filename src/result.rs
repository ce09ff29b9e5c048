//! Error types and the related `Result<T>`

use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// An error from underlying I/O, including the upstream byte source
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive contained data we can't make sense of,
    /// and skipping ahead won't help (e.g., corrupt gzip framing).
    #[error("Invalid archive: {0}")]
    InvalidArchive(&'static str),

    /// The archive (or one of its entries) uses an unsupported feature
    #[error("Unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Archive entry too large for address space")]
    InsufficientAddressSpace,
}
