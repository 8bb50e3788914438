//! Public surface (spec §6): a process attaches via [`SrConnection::connect`],
//! opens a [`Session`] on it, and drives the catalog/subscription/RPC
//! operations through that session. Every returned value is owned — no Ext
//! offset ever crosses this boundary, matching the original's separation
//! between `sr_conn_ctx_t`/`sr_session_ctx_t` and the raw `sr_shm_t` they
//! wrap (`original_source/src/sysrepo_types.h`, `shm_main.c`).

use std::time::Duration;

use srshm_common::config::RepoConfig;
use srshm_common::consts::{EXT_HEADER_SIZE, EXT_SHM_MIN_SIZE};
use srshm_common::error::{ShmError, ShmResult};
use srshm_common::platform::current_pid;
use srshm_common::region::SharedRegion;

use crate::catalog::{self, ModuleCatalog, ModuleInstallRequest, ModuleView};
use crate::connection::ConnectionTable;
use crate::defrag::defrag;
use crate::ext::ExtRegion;
use crate::layout::Datastore;
use crate::lock::{with_main_lock_exclusive, with_main_lock_shared, ExtRemapLock};
use crate::main_region::MainRegion;
use crate::recovery::NoopOperationalStore;
use crate::rpc::{RpcEntry, RpcRegistry};
use crate::subscriptions::{
    add_change_sub, add_notif_sub, add_oper_sub, del_change_sub, del_notif_sub, del_oper_sub,
};

/// A live attachment to a repository's Main/Ext SHM, analogous to the
/// original's `sr_conn_ctx_t`. Owns both region mappings and the connection
/// record registered on its behalf.
pub struct SrConnection {
    main: MainRegion,
    ext: ExtRegion,
    ext_remap_lock: ExtRemapLock,
    conn_id: u64,
    lock_timeout: Duration,
    defrag_wasted_threshold: f64,
}

impl SrConnection {
    /// Attach to (creating if necessary) the repository described by
    /// `config`, registering a connection record for this process.
    pub fn connect(config: &RepoConfig) -> ShmResult<Self> {
        std::fs::create_dir_all(&config.runtime_dir)?;

        let main_path = config.main_path();
        let mut main = if main_path.exists() {
            MainRegion::attach(&main_path)?
        } else {
            MainRegion::create(&main_path)?
        };

        let ext_path = config.ext_path();
        let mut ext = if ext_path.exists() {
            ExtRegion::new(SharedRegion::attach(&ext_path)?)
        } else {
            let region = SharedRegion::create(&ext_path, EXT_SHM_MIN_SIZE as u64)?;
            let mut fresh = ExtRegion::new(region);
            fresh.set_next_free(EXT_HEADER_SIZE);
            fresh
        };

        let timeout = Duration::from_millis(config.lock_timeout_ms);
        let mut store = NoopOperationalStore;
        let conn_id = with_main_lock_exclusive(&mut main, &mut ext, timeout, &mut store, |main, ext| {
            ConnectionTable::new(main.header_mut(), ext).add_connection(current_pid())
        })?;

        Ok(Self {
            main,
            ext,
            ext_remap_lock: ExtRemapLock::new(),
            conn_id,
            lock_timeout: timeout,
            defrag_wasted_threshold: config.defrag_wasted_threshold,
        })
    }

    /// This connection's id, as registered in the connection table.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Detach cleanly: remove this connection's record so a later recovery
    /// sweep never mistakes it for a crashed peer.
    pub fn disconnect(mut self) -> ShmResult<()> {
        let conn_id = self.conn_id;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(
            &mut self.main,
            &mut self.ext,
            self.lock_timeout,
            &mut store,
            |main, ext| ConnectionTable::new(main.header_mut(), ext).remove_connection(conn_id),
        )
    }

    /// Open a session for catalog/subscription/RPC operations.
    pub fn session(&mut self) -> Session<'_> {
        Session { conn: self }
    }
}

/// Ext SHM space usage, for diagnostics. A scoped-down cousin of the
/// teacher's `evo_shared_memory::monitoring::MemoryStats` — this substrate
/// tracks exactly the two numbers its own `defrag_if_needed` threshold check
/// needs, not a full alerting subsystem.
#[derive(Debug, Clone, Copy)]
pub struct ExtStats {
    /// Total mapped size of Ext SHM, in bytes.
    pub total_bytes: u64,
    /// Bytes currently marked wasted (freed but not yet reclaimed).
    pub wasted_bytes: u64,
}

/// A working handle for one process's catalog/subscription/RPC operations,
/// analogous to the original's `sr_session_ctx_t`. Every mutating call takes
/// `main_shm.lock` for writing (running the recovery sweep first if the
/// previous writer died holding it) and opportunistically defrags Ext once
/// the wasted ratio crosses the configured threshold.
pub struct Session<'a> {
    conn: &'a mut SrConnection,
}

impl<'a> Session<'a> {
    /// Look up one module by name.
    pub fn find_module(&mut self, name: &str) -> ShmResult<Option<ModuleView>> {
        let timeout = self.conn.lock_timeout;
        let ext = &self.conn.ext;
        with_main_lock_shared(&mut self.conn.main, timeout, |main| {
            catalog::find_module(main, ext, name)
        })
    }

    /// List every installed module.
    pub fn list_modules(&mut self) -> ShmResult<Vec<ModuleView>> {
        let timeout = self.conn.lock_timeout;
        let ext = &self.conn.ext;
        with_main_lock_shared(&mut self.conn.main, timeout, |main| catalog::list_modules(main, ext))
    }

    /// Install a new module into the catalog.
    pub fn install_module(&mut self, req: ModuleInstallRequest) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            ModuleCatalog::new(main, ext).install_module(req)
        })?;
        self.defrag_if_needed()
    }

    /// Remove a module from the catalog.
    pub fn remove_module(&mut self, name: &str) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            ModuleCatalog::new(main, ext).remove_module(name)
        })?;
        self.defrag_if_needed()
    }

    /// Subscribe to configuration changes on `module`'s `ds` datastore.
    pub fn subscribe_change(
        &mut self,
        module: &str,
        ds: Datastore,
        priority: u32,
        opts: u32,
        xpath: Option<&str>,
    ) -> ShmResult<u32> {
        let timeout = self.conn.lock_timeout;
        let conn_id = self.conn.conn_id;
        let mut store = NoopOperationalStore;
        let sub_id = with_main_lock_exclusive(
            &mut self.conn.main,
            &mut self.conn.ext,
            timeout,
            &mut store,
            |main, ext| {
                let idx = module_index(main, ext, module)?;
                let rec = &mut main.modules_mut()[idx];
                add_change_sub(ext, rec, conn_id, ds, priority, opts, xpath)
            },
        )?;
        self.defrag_if_needed()?;
        Ok(sub_id)
    }

    /// Cancel a change subscription previously returned by
    /// [`Session::subscribe_change`].
    pub fn unsubscribe_change(&mut self, module: &str, sub_id: u32) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            let idx = module_index(main, ext, module)?;
            let rec = &mut main.modules_mut()[idx];
            del_change_sub(ext, rec, sub_id)
        })?;
        self.defrag_if_needed()
    }

    /// Subscribe to provide operational data for `xpath` under `module`.
    pub fn subscribe_oper(&mut self, module: &str, opts: u32, xpath: &str) -> ShmResult<u32> {
        let timeout = self.conn.lock_timeout;
        let conn_id = self.conn.conn_id;
        let mut store = NoopOperationalStore;
        let sub_id = with_main_lock_exclusive(
            &mut self.conn.main,
            &mut self.conn.ext,
            timeout,
            &mut store,
            |main, ext| {
                let idx = module_index(main, ext, module)?;
                let rec = &mut main.modules_mut()[idx];
                add_oper_sub(ext, rec, conn_id, opts, xpath)
            },
        )?;
        self.defrag_if_needed()?;
        Ok(sub_id)
    }

    /// Cancel an operational subscription.
    pub fn unsubscribe_oper(&mut self, module: &str, sub_id: u32) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            let idx = module_index(main, ext, module)?;
            let rec = &mut main.modules_mut()[idx];
            del_oper_sub(ext, rec, sub_id)
        })?;
        self.defrag_if_needed()
    }

    /// Subscribe to `module`'s notifications.
    pub fn subscribe_notif(&mut self, module: &str) -> ShmResult<u32> {
        let timeout = self.conn.lock_timeout;
        let conn_id = self.conn.conn_id;
        let mut store = NoopOperationalStore;
        let sub_id = with_main_lock_exclusive(
            &mut self.conn.main,
            &mut self.conn.ext,
            timeout,
            &mut store,
            |main, ext| {
                let idx = module_index(main, ext, module)?;
                let rec = &mut main.modules_mut()[idx];
                add_notif_sub(ext, rec, conn_id)
            },
        )?;
        self.defrag_if_needed()?;
        Ok(sub_id)
    }

    /// Cancel a notification subscription.
    pub fn unsubscribe_notif(&mut self, module: &str, sub_id: u32) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            let idx = module_index(main, ext, module)?;
            let rec = &mut main.modules_mut()[idx];
            del_notif_sub(ext, rec, sub_id)
        })?;
        self.defrag_if_needed()
    }

    /// Find a registered RPC's operation path entry.
    pub fn find_rpc(&mut self, op_path: &str) -> ShmResult<Option<RpcEntry>> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            RpcRegistry::new(main.header_mut(), ext).find_rpc(op_path)
        })
    }

    /// Subscribe to an RPC's operation path, registering it if unknown.
    pub fn subscribe_rpc(
        &mut self,
        op_path: &str,
        priority: u32,
        opts: u32,
        xpath: Option<&str>,
    ) -> ShmResult<u32> {
        let timeout = self.conn.lock_timeout;
        let conn_id = self.conn.conn_id;
        let mut store = NoopOperationalStore;
        let sub_id = with_main_lock_exclusive(
            &mut self.conn.main,
            &mut self.conn.ext,
            timeout,
            &mut store,
            |main, ext| {
                RpcRegistry::new(main.header_mut(), ext)
                    .add_subscription(op_path, conn_id, priority, opts, xpath)
            },
        )?;
        self.defrag_if_needed()?;
        Ok(sub_id)
    }

    /// Cancel an RPC subscription.
    pub fn unsubscribe_rpc(&mut self, op_path: &str, sub_id: u32) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            RpcRegistry::new(main.header_mut(), ext).del_subscription(op_path, sub_id)
        })?;
        self.defrag_if_needed()
    }

    /// Current Ext SHM space usage.
    pub fn ext_stats(&self) -> ExtStats {
        ExtStats {
            total_bytes: self.conn.ext.len(),
            wasted_bytes: self.conn.ext.wasted(),
        }
    }

    /// Force a defragmentation pass regardless of the configured threshold.
    pub fn defrag(&mut self) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let mut store = NoopOperationalStore;
        let remap_lock = &self.conn.ext_remap_lock;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            remap_lock.with_write(|| defrag(main, ext))
        })
    }

    fn defrag_if_needed(&mut self) -> ShmResult<()> {
        let timeout = self.conn.lock_timeout;
        let threshold = self.conn.defrag_wasted_threshold;
        let remap_lock_handle = &self.conn.ext_remap_lock;
        let mut store = NoopOperationalStore;
        with_main_lock_exclusive(&mut self.conn.main, &mut self.conn.ext, timeout, &mut store, |main, ext| {
            if ext.len() == 0 {
                return Ok(());
            }
            let ratio = ext.wasted() as f64 / ext.len() as f64;
            if ratio >= threshold {
                remap_lock_handle.with_write(|| defrag(main, ext))?;
            }
            Ok(())
        })
    }
}

fn module_index(main: &MainRegion, ext: &ExtRegion, name: &str) -> ShmResult<usize> {
    catalog::index_of(main, ext, name)?.ok_or_else(|| ShmError::NotFound {
        what: format!("module {name}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> RepoConfig {
        RepoConfig {
            runtime_dir: dir.to_path_buf(),
            name: "test".into(),
            lock_timeout_ms: 500,
            defrag_wasted_threshold: 0.9,
        }
    }

    #[test]
    fn connect_registers_a_connection_and_disconnect_removes_it() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let conn = SrConnection::connect(&cfg).unwrap();
        assert!(conn.conn_id() >= 1);
        conn.disconnect().unwrap();
    }

    #[test]
    fn install_find_and_remove_module_round_trip() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut conn = SrConnection::connect(&cfg).unwrap();
        let mut session = conn.session();

        session
            .install_module(ModuleInstallRequest {
                name: "ietf-interfaces".into(),
                revision: Some("2024-01-01".into()),
                flags: crate::layout::ModuleFlags::empty(),
                ds_enabled: [true, true, false],
                deps: vec![],
            })
            .unwrap();

        let found = session.find_module("ietf-interfaces").unwrap().unwrap();
        assert_eq!(found.name, "ietf-interfaces");

        session.remove_module("ietf-interfaces").unwrap();
        assert!(session.find_module("ietf-interfaces").unwrap().is_none());
    }

    #[test]
    fn subscribe_and_unsubscribe_change_round_trip() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut conn = SrConnection::connect(&cfg).unwrap();
        let mut session = conn.session();
        session
            .install_module(ModuleInstallRequest {
                name: "a".into(),
                revision: None,
                flags: crate::layout::ModuleFlags::empty(),
                ds_enabled: [true, false, false],
                deps: vec![],
            })
            .unwrap();

        let sub_id = session
            .subscribe_change("a", Datastore::Running, 0, 0, Some("/a:x"))
            .unwrap();
        session.unsubscribe_change("a", sub_id).unwrap();
    }

    #[test]
    fn subscribe_rpc_registers_and_finds_entry() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut conn = SrConnection::connect(&cfg).unwrap();
        let mut session = conn.session();

        let sub_id = session.subscribe_rpc("/a:op", 0, 0, None).unwrap();
        let entry = session.find_rpc("/a:op").unwrap().unwrap();
        assert_eq!(entry.sub_count, 1);
        session.unsubscribe_rpc("/a:op", sub_id).unwrap();
    }
}
