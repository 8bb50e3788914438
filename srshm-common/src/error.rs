//! Error taxonomy shared by every crate in the workspace.

use thiserror::Error;

/// Errors that can occur anywhere in the shared-memory substrate.
#[derive(Error, Debug)]
pub enum ShmError {
    /// An OS-level call (open, mmap, ftruncate, ...) failed.
    #[error("system error: {source}")]
    System {
        /// Underlying IO error.
        #[from]
        source: std::io::Error,
    },

    /// A `nix`-wrapped syscall (kill, pthread primitive setup, ...) failed.
    #[error("system call error: {source}")]
    Nix {
        /// Underlying nix error.
        #[from]
        source: nix::Error,
    },

    /// A region could not be grown because it would exceed the configured
    /// maximum size.
    #[error("out of memory: {what} would require {needed} bytes")]
    NoMemory {
        /// What was being allocated.
        what: String,
        /// Bytes that would have been needed.
        needed: u64,
    },

    /// A named entity (module, RPC, subscription, connection, ...) does not
    /// exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// A caller-supplied argument is structurally invalid (bad offset, empty
    /// name, zero-length buffer, ...).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable detail.
        message: String,
    },

    /// A caller-supplied value is structurally fine but violates a
    /// higher-level rule (dependency cycle, duplicate module, ...).
    #[error("validation failed: {message}")]
    Validation {
        /// Human-readable detail.
        message: String,
    },

    /// A lock could not be acquired within its timeout.
    #[error("resource busy")]
    Busy,

    /// The on-disk/shared-memory layout failed a consistency check.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Human-readable detail.
        message: String,
    },

    /// A region's header reports a layout version this build does not
    /// understand.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build was compiled against.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },
}

/// Result type used throughout the workspace.
pub type ShmResult<T> = Result<T, ShmError>;
