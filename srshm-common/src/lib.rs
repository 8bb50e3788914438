//! Shared constants, error taxonomy, and process-shared primitives for the
//! srshm workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - region naming and sizing constants
//! - [`error`] - the `ShmError` taxonomy shared by every crate
//! - [`config`] - per-repository configuration
//! - [`platform`] - OS-specific region mapping and liveness primitives
//! - [`region`] - the raw named, file-backed shared-memory region
//! - [`pshared`] - the process-shared reader/writer lock
//! - [`prelude`] - common re-exports for convenience
//!
//! Nothing in this crate knows about modules, subscriptions, or catalogs —
//! that layout lives in `srshm-core`.

pub mod config;
pub mod consts;
pub mod error;
pub mod platform;
pub mod prelude;
pub mod pshared;
pub mod region;

/// Initialize structured logging for a process hosting this substrate.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
