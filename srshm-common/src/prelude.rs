//! Convenient re-exports for consumers of `srshm-common`.
//!
//! ```rust
//! use srshm_common::prelude::*;
//! ```

pub use crate::config::RepoConfig;
pub use crate::error::{ShmError, ShmResult};
pub use crate::pshared::{OwnerDeath, RawRwLock};
pub use crate::region::SharedRegion;
