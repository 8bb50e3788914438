//! Main SHM layout: the header and the fixed-stride module record array.
//!
//! Every field that participates in the cross-process ABI (spec's closing
//! note on §3 and §6 — Main/Ext bytes are read by independently compiled
//! processes) is a fixed-width integer, never `usize`/`off_t`.

use bitflags::bitflags;
use srshm_common::pshared::RawRwLock;
use static_assertions::const_assert_eq;

/// Magic number stamped into a freshly created Main SHM header.
pub const MAIN_SHM_MAGIC: u32 = 0x5352_5348; // "SRSH"

/// Layout version this build produces and expects to find.
pub const MAIN_SHM_VERSION: u32 = 1;

bitflags! {
    /// Per-module flags, grounded in the original's `sr_mod_t.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u32 {
        /// Module keeps a notification replay buffer.
        const REPLAY_SUPPORT = 1 << 0;
    }
}

/// Datastore kinds a module can be enabled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Datastore {
    /// Persisted startup configuration.
    Startup = 0,
    /// Running configuration.
    Running = 1,
    /// Operational (read-only, overlay) datastore.
    Operational = 2,
}

/// Number of datastore kinds, matching the original's `sr_datastore_t`.
pub const DS_COUNT: usize = 3;

/// Main SHM header: lives at byte 0 of the Main region, followed directly by
/// `module_count` fixed-stride [`ModuleRecord`]s.
#[repr(C)]
pub struct MainHeader {
    /// `MAIN_SHM_MAGIC`, used to detect an unrelated or uninitialized file.
    pub magic: u32,
    /// `MAIN_SHM_VERSION`.
    pub version: u32,
    /// Guards the whole Main SHM array plus every Ext allocation a module
    /// record points into (spec §5 lock hierarchy, level 2).
    pub rwlock: RawRwLock,
    /// Guards the separate "lydmods" startup-data persistence step (spec §5
    /// lock hierarchy, level 3). Only ever taken exclusively.
    pub lydmods_lock: RawRwLock,
    /// Number of [`ModuleRecord`]s following this header.
    pub module_count: u32,
    /// Next session id to hand out; monotonically increasing, never reused
    /// within one Main SHM lifetime.
    pub next_sid: u32,
    /// Next connection id to hand out; monotonically increasing.
    pub next_conn_id: u64,
    /// Ext offset of the connection-state array (see [`crate::connection`]).
    pub conn_array_offset: u64,
    /// Number of live entries in the connection-state array.
    pub conn_count: u32,
    /// Ext offset of the global RPC-subscriber array.
    pub rpc_array_offset: u64,
    /// Number of entries in the RPC-subscriber array.
    pub rpc_count: u32,
}

/// A single module's fixed-stride record in Main SHM. Every array field is an
/// `(offset, count)` pair pointing into Ext SHM; `0` offset with `0` count
/// means "no entries", per the Ext absent-sentinel convention (spec I1).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModuleRecord {
    /// Ext offset of the module's NUL-terminated name.
    pub name_offset: u64,
    /// Ext offset of the module's NUL-terminated revision, or 0 if unset.
    pub revision_offset: u64,
    pub(crate) flags_bits: u32,
    /// Bitset of enabled datastores, index by [`Datastore`] as u8.
    pub ds_enabled: [bool; DS_COUNT],
    /// Ext offset of an array of `u64` name-offsets this module depends on.
    pub deps_offset: u64,
    /// Number of entries in the forward dependency array.
    pub deps_count: u32,
    /// Ext offset of an array of `u64` name-offsets of modules that depend
    /// on this one (transitive closure, rebuilt on every install/remove).
    pub inv_deps_offset: u64,
    /// Number of entries in the inverse dependency array.
    pub inv_deps_count: u32,
    /// Ext offset of the change-subscription array.
    pub change_sub_offset: u64,
    /// Number of entries in the change-subscription array.
    pub change_sub_count: u32,
    /// Ext offset of the operational-subscription array.
    pub oper_sub_offset: u64,
    /// Number of entries in the operational-subscription array.
    pub oper_sub_count: u32,
    /// Ext offset of the notification-subscription array.
    pub notif_sub_offset: u64,
    /// Number of entries in the notification-subscription array.
    pub notif_sub_count: u32,
}

impl ModuleRecord {
    /// Read the flag bitset.
    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags::from_bits_truncate(self.flags_bits)
    }

    /// Replace the flag bitset.
    pub fn set_flags(&mut self, flags: ModuleFlags) {
        self.flags_bits = flags.bits();
    }
}

const_assert_eq!(std::mem::size_of::<u32>(), 4);
