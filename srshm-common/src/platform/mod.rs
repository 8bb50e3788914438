//! OS-specific primitives the rest of the workspace builds on.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;
