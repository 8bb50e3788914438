//! # srshm-core
//!
//! The Main/Ext shared-memory substrate shared by every process attached to
//! one YANG configuration/operational datastore repository: the offset-based
//! allocator and defragmenter for Ext SHM, the fixed-stride module catalog
//! and its dependency closure in Main SHM, the subscription and RPC
//! registries addressed through it, connection liveness tracking, and the
//! process-shared lock hierarchy (spec §5) that serializes writers across
//! processes and recovers from one dying mid-mutation.
//!
//! ## Layout
//!
//! Two memory-mapped regions back one repository, both created fresh or
//! attached to by [`api::SrConnection::connect`]:
//!
//! - **Main SHM** ([`main_region`], [`layout`]): a [`layout::MainHeader`]
//!   followed by a fixed-stride array of [`layout::ModuleRecord`]s. Grows
//!   only by remap-and-append; existing records never move, so a reader can
//!   hold a pointer to one across a shared lock's hold (invariant I5).
//! - **Ext SHM** ([`ext`], [`alloc`]): a 16-byte header (`wasted` counter,
//!   `next_free` bump cursor) followed by a variable-length heap addressed
//!   by byte offset from its own base, where offset `0` is the absent
//!   sentinel (invariant I1). [`defrag`] periodically compacts it.
//!
//! ## Layers
//!
//! - [`layout`] — on-disk/on-shm struct definitions shared by both regions.
//! - [`ext`] / [`alloc`] — the Ext region wrapper and its offset allocator.
//! - [`main_region`] — the Main region wrapper (header + module array).
//! - [`connection`] — the connection liveness table and its evpipe arrays.
//! - [`subscriptions`] — per-module change/operational/notification
//!   subscription arrays.
//! - [`rpc`] — the global RPC operation-path registry and its subscribers.
//! - [`catalog`] — the module catalog builder and its inverse-dependency
//!   closure (invariant I4).
//! - [`defrag`] — the four-pass Ext compactor.
//! - [`lock`] — the process-shared lock hierarchy (spec §5) and the
//!   crash-recovery acquire path.
//! - [`recovery`] — the crash recovery sweep itself (spec §4.9).
//! - [`api`] — the public [`api::SrConnection`]/[`api::Session`] surface
//!   every other layer is reached through.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod api;
pub mod catalog;
pub mod connection;
pub mod defrag;
pub mod ext;
pub mod layout;
pub mod lock;
pub mod main_region;
pub mod recovery;
pub mod rpc;
pub mod subscriptions;

pub use api::{ExtStats, Session, SrConnection};
pub use catalog::{ModuleCatalog, ModuleInstallRequest, ModuleView};
pub use connection::ConnState;
pub use ext::ExtRegion;
pub use layout::{Datastore, MainHeader, ModuleFlags, ModuleRecord, DS_COUNT};
pub use lock::{with_lydmods_lock, with_main_lock_exclusive, with_main_lock_shared, ExtRemapLock};
pub use main_region::MainRegion;
pub use recovery::{recover_dead_connections, NoopOperationalStore, OperationalStore};
pub use rpc::{RpcEntry, RpcRegistry, RpcSubscriber};
pub use srshm_common::error::{ShmError, ShmResult};
