//! Crash recovery sweep (spec §4.9): reclaims everything a dead connection
//! left behind. A connection is dead once its owning pid no longer exists
//! (`srshm_common::platform::is_process_alive`); recovery then erases its
//! operational push data, drops its subscriptions of every kind, and removes
//! its connection record.
//!
//! Grounded in `sr_shmmain_state_recover` in
//! `original_source/src/shm_main.c`, which walks the connection table the
//! same way and delegates the data-erase step out to the caller (there, the
//! `lyd`/session layer; here, [`OperationalStore`]).

use srshm_common::error::ShmResult;

use crate::connection::ConnectionTable;
use crate::ext::ExtRegion;
use crate::layout::MainHeader;
use crate::rpc::RpcRegistry;
use crate::subscriptions::remove_all_for_connection;

/// Collaborator that owns operational push data keyed by connection. The
/// substrate itself has no notion of the data a connection pushed into the
/// operational datastore — only that it must be erased when the connection
/// is gone.
pub trait OperationalStore {
    /// Erase whatever operational data `conn_id` pushed.
    fn erase_for_connection(&mut self, conn_id: u64) -> ShmResult<()>;
}

/// An [`OperationalStore`] that does nothing, for callers with no
/// operational datastore integration.
pub struct NoopOperationalStore;

impl OperationalStore for NoopOperationalStore {
    fn erase_for_connection(&mut self, _conn_id: u64) -> ShmResult<()> {
        Ok(())
    }
}

/// Run one recovery sweep: find every connection whose process has died,
/// erase its operational data, drop every subscription and RPC subscriber it
/// owned, and remove its connection record. Returns the connection ids that
/// were recovered.
///
/// Caller must hold `main_shm.lock` for writing; this does not itself touch
/// the lock (that is `with_recovery`'s job — see [`crate::lock`]).
pub fn recover_dead_connections(
    header: &mut MainHeader,
    main_modules: &mut [crate::layout::ModuleRecord],
    ext: &mut ExtRegion,
    store: &mut impl OperationalStore,
) -> ShmResult<Vec<u64>> {
    let dead = {
        let table = ConnectionTable::new(header, ext);
        table.dead_connections()?
    };

    let mut recovered = Vec::with_capacity(dead.len());
    for conn in &dead {
        store.erase_for_connection(conn.conn_id)?;

        for module in main_modules.iter_mut() {
            remove_all_for_connection(ext, module, conn.conn_id)?;
        }

        {
            let mut rpc = RpcRegistry::new(header, ext);
            let entries = rpc.list()?;
            for entry in entries {
                let op_path = rpc.op_path(&entry)?;
                let subs = rpc.list_subscribers(&entry)?;
                for sub in subs.iter().filter(|s| s.conn_id == conn.conn_id) {
                    rpc.del_subscription(&op_path, sub.sub_id)?;
                }
            }
        }

        let mut table = ConnectionTable::new(header, ext);
        table.remove_connection(conn.conn_id)?;
        recovered.push(conn.conn_id);
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionTable;
    use crate::layout::{Datastore, MAIN_SHM_VERSION, ModuleRecord};
    use crate::subscriptions::add_change_sub;
    use srshm_common::consts::EXT_HEADER_SIZE;
    use srshm_common::region::SharedRegion;
    use tempfile::tempdir;

    fn new_header() -> MainHeader {
        let mut h: MainHeader = unsafe { std::mem::zeroed() };
        h.version = MAIN_SHM_VERSION;
        h
    }

    fn make_ext() -> ExtRegion {
        let dir = tempdir().unwrap();
        let region = SharedRegion::create(dir.path().join("ext.bin"), 4096).unwrap();
        std::mem::forget(dir);
        let mut ext = ExtRegion::new(region);
        ext.set_next_free(EXT_HEADER_SIZE);
        ext
    }

    #[test]
    fn sweep_drops_dead_connections_subscriptions_and_record() {
        let mut header = new_header();
        let mut ext = make_ext();

        let dead_pid = i32::MAX - 1;
        let conn_id = {
            let mut table = ConnectionTable::new(&mut header, &mut ext);
            table.add_connection(dead_pid).unwrap()
        };

        let mut module: ModuleRecord = unsafe { std::mem::zeroed() };
        add_change_sub(&mut ext, &mut module, conn_id, Datastore::Running, 0, 0, None).unwrap();
        let mut modules = vec![module];

        let mut store = NoopOperationalStore;
        let recovered =
            recover_dead_connections(&mut header, &mut modules, &mut ext, &mut store).unwrap();

        assert_eq!(recovered, vec![conn_id]);
        assert_eq!(modules[0].change_sub_count, 0);
        let table = ConnectionTable::new(&mut header, &mut ext);
        assert!(table.list().unwrap().is_empty());
    }

    #[test]
    fn sweep_leaves_live_connections_alone() {
        let mut header = new_header();
        let mut ext = make_ext();

        let conn_id = {
            let mut table = ConnectionTable::new(&mut header, &mut ext);
            table.add_connection(std::process::id() as i32).unwrap()
        };

        let mut modules = Vec::new();
        let mut store = NoopOperationalStore;
        let recovered =
            recover_dead_connections(&mut header, &mut modules, &mut ext, &mut store).unwrap();

        assert!(recovered.is_empty());
        let table = ConnectionTable::new(&mut header, &mut ext);
        assert_eq!(table.list().unwrap().len(), 1);
        let _ = conn_id;
    }
}
