//! The Ext SHM defragmenter (spec §4.5). Produces a fully dense replacement
//! buffer in a fixed pass order and atomically swaps it in under the
//! `ext_remap_lock` + `main_shm.lock` hold the caller is required to have
//! already taken.
//!
//! Pass order matters: module names (and every other string) are compacted
//! first, because the dependency-array and RPC-entry passes that follow
//! reference the *new* string offsets, not the old ones. Running it any
//! other order would defrag against stale addresses.
//!
//! Grounded in `sr_shmmain_ext_defrag` and its `sr_shmmain_defrag_copy_*`
//! helpers in `original_source/src/shm_main.c`, which walk the same way:
//! strings, then dependency arrays, then everything that points at a
//! string.

use std::collections::HashMap;

use srshm_common::consts::EXT_HEADER_SIZE;
use srshm_common::error::ShmResult;

use crate::ext::ExtRegion;
use crate::layout::ModuleRecord;
use crate::main_region::MainRegion;
use crate::rpc::{RpcEntry, RpcSubscriber};
use crate::subscriptions::{ChangeSub, NotifSub, OperSub};

/// Append-only scratch buffer the defragmenter builds the new dense Ext
/// content into before it is copied over the live region in one shot.
struct DefragBuilder {
    scratch: Vec<u8>,
    cursor: u64,
}

impl DefragBuilder {
    fn new() -> Self {
        Self {
            scratch: Vec::new(),
            cursor: EXT_HEADER_SIZE,
        }
    }

    fn write_str(&mut self, s: &str) -> u64 {
        let offset = self.cursor;
        self.scratch.extend_from_slice(s.as_bytes());
        self.scratch.push(0);
        self.cursor += s.len() as u64 + 1;
        offset
    }

    fn write_records<T: Copy>(&mut self, items: &[T]) -> u64 {
        if items.is_empty() {
            return 0;
        }
        let offset = self.cursor;
        let bytes = unsafe {
            std::slice::from_raw_parts(items.as_ptr() as *const u8, std::mem::size_of_val(items))
        };
        self.scratch.extend_from_slice(bytes);
        self.cursor += bytes.len() as u64;
        offset
    }
}

/// Run a full defragmentation pass over the catalog's Ext content, rewriting
/// the Ext region in place. Idempotent: running it twice in a row produces
/// the same total size the second time (spec §8).
pub fn defrag(main: &mut MainRegion, ext: &mut ExtRegion) -> ShmResult<()> {
    let mut records: Vec<ModuleRecord> = main.modules().to_vec();
    let mut builder = DefragBuilder::new();

    // Pass A: every string, keyed by its old offset so later passes can
    // remap references without caring what kind of string it was.
    let mut string_map: HashMap<u64, u64> = HashMap::new();
    let mut remap_string = |ext: &ExtRegion,
                             builder: &mut DefragBuilder,
                             map: &mut HashMap<u64, u64>,
                             old_offset: u64|
     -> ShmResult<u64> {
        if old_offset == 0 {
            return Ok(0);
        }
        if let Some(&new_offset) = map.get(&old_offset) {
            return Ok(new_offset);
        }
        let s = ext.read_str(old_offset)?.to_string();
        let new_offset = builder.write_str(&s);
        map.insert(old_offset, new_offset);
        Ok(new_offset)
    };

    for rec in &records {
        remap_string(ext, &mut builder, &mut string_map, rec.name_offset)?;
        remap_string(ext, &mut builder, &mut string_map, rec.revision_offset)?;
    }

    // Pass B: dependency arrays reference module name offsets, which Pass A
    // already relocated.
    for rec in &mut records {
        let deps = ext.read_u64_array(rec.deps_offset, rec.deps_count)?;
        let new_deps: Vec<u64> = deps.iter().map(|&o| string_map[&o]).collect();
        rec.deps_offset = builder.write_records(&new_deps);

        let inv_deps = ext.read_u64_array(rec.inv_deps_offset, rec.inv_deps_count)?;
        let new_inv_deps: Vec<u64> = inv_deps.iter().map(|&o| string_map[&o]).collect();
        rec.inv_deps_offset = builder.write_records(&new_inv_deps);
    }

    // Pass C: per-module subscription arrays, remapping each xpath string.
    for rec in &mut records {
        let change: Vec<ChangeSub> = ext.read_records(rec.change_sub_offset, rec.change_sub_count)?;
        let new_change: Vec<ChangeSub> = change
            .into_iter()
            .map(|mut s| {
                s.xpath_offset = string_map.get(&s.xpath_offset).copied().unwrap_or(0);
                s
            })
            .collect();
        rec.change_sub_offset = builder.write_records(&new_change);

        let oper: Vec<OperSub> = ext.read_records(rec.oper_sub_offset, rec.oper_sub_count)?;
        let new_oper: Vec<OperSub> = oper
            .into_iter()
            .map(|mut s| {
                s.xpath_offset = string_map.get(&s.xpath_offset).copied().unwrap_or(0);
                s
            })
            .collect();
        rec.oper_sub_offset = builder.write_records(&new_oper);

        let notif: Vec<NotifSub> = ext.read_records(rec.notif_sub_offset, rec.notif_sub_count)?;
        rec.notif_sub_offset = builder.write_records(&notif);
    }

    // Pass D: the global RPC array and each entry's subscriber array.
    let old_rpc_entries: Vec<RpcEntry> = ext.read_records(
        main.header().rpc_array_offset,
        main.header().rpc_count,
    )?;
    let mut new_rpc_entries = Vec::with_capacity(old_rpc_entries.len());
    for mut entry in old_rpc_entries {
        entry.op_path_offset = remap_string(ext, &mut builder, &mut string_map, entry.op_path_offset)?;

        let subs: Vec<RpcSubscriber> = ext.read_records(entry.sub_offset, entry.sub_count)?;
        let new_subs: Vec<RpcSubscriber> = subs
            .into_iter()
            .map(|mut s| {
                s.xpath_offset = string_map.get(&s.xpath_offset).copied().unwrap_or(0);
                s
            })
            .collect();
        entry.sub_offset = builder.write_records(&new_subs);
        new_rpc_entries.push(entry);
    }
    let new_rpc_offset = builder.write_records(&new_rpc_entries);

    // Swap the compacted buffer in.
    let new_total = builder.cursor;
    ext.remap(new_total)?;
    ext.as_bytes_mut()[EXT_HEADER_SIZE as usize..].copy_from_slice(&builder.scratch);
    ext.set_next_free(new_total);
    ext.reset_wasted();

    for (i, rec) in records.into_iter().enumerate() {
        main.modules_mut()[i] = rec;
    }
    main.header_mut().rpc_array_offset = new_rpc_offset;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModuleCatalog, ModuleInstallRequest};
    use crate::layout::ModuleFlags;
    use crate::rpc::RpcRegistry;
    use crate::subscriptions::{add_change_sub, del_change_sub};
    use srshm_common::region::SharedRegion;
    use tempfile::tempdir;

    fn setup() -> (MainRegion, ExtRegion, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let main = MainRegion::create(dir.path().join("main.bin")).unwrap();
        let mut ext = ExtRegion::new(SharedRegion::create(dir.path().join("ext.bin"), 4096).unwrap());
        ext.set_next_free(EXT_HEADER_SIZE);
        (main, ext, dir)
    }

    #[test]
    fn defrag_reduces_size_after_churn_and_preserves_data() {
        let (mut main, mut ext, _dir) = setup();
        {
            let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
            catalog
                .install_module(ModuleInstallRequest {
                    name: "ietf-interfaces".into(),
                    revision: Some("2024-01-01".into()),
                    flags: ModuleFlags::empty(),
                    ds_enabled: [true, true, false],
                    deps: vec![],
                })
                .unwrap();
        }

        // Churn: add then remove a bunch of subscriptions to waste bytes.
        for _ in 0..10 {
            let module_idx = 0;
            let mut rec = main.modules()[module_idx];
            let sub_id =
                add_change_sub(&mut ext, &mut rec, 1, crate::layout::Datastore::Running, 0, 0, Some("/x"))
                    .unwrap();
            main.modules_mut()[module_idx] = rec;
            let mut rec = main.modules()[module_idx];
            del_change_sub(&mut ext, &mut rec, sub_id).unwrap();
            main.modules_mut()[module_idx] = rec;
        }
        assert!(ext.wasted() > 0);

        let before_len = ext.len();
        defrag(&mut main, &mut ext).unwrap();
        assert_eq!(ext.wasted(), 0);
        assert!(ext.len() <= before_len);

        let catalog = ModuleCatalog::new(&mut main, &mut ext);
        let view = catalog.find_module("ietf-interfaces").unwrap().unwrap();
        assert_eq!(view.name, "ietf-interfaces");
        assert_eq!(view.revision.as_deref(), Some("2024-01-01"));
    }

    #[test]
    fn defrag_is_idempotent_on_size() {
        let (mut main, mut ext, _dir) = setup();
        {
            let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
            catalog
                .install_module(ModuleInstallRequest {
                    name: "a".into(),
                    revision: None,
                    flags: ModuleFlags::empty(),
                    ds_enabled: [true, false, false],
                    deps: vec![],
                })
                .unwrap();
        }
        defrag(&mut main, &mut ext).unwrap();
        let size_once = ext.len();
        defrag(&mut main, &mut ext).unwrap();
        assert_eq!(ext.len(), size_once);
    }

    #[test]
    fn defrag_preserves_rpc_registrations() {
        let (mut main, mut ext, _dir) = setup();
        {
            let mut reg = RpcRegistry::new(main.header_mut(), &mut ext);
            reg.add_subscription("/x:op", 1, 0, 0, Some("/x:op/leaf")).unwrap();
        }
        defrag(&mut main, &mut ext).unwrap();
        let reg = RpcRegistry::new(main.header_mut(), &mut ext);
        let entry = reg.find_rpc("/x:op").unwrap().unwrap();
        assert_eq!(entry.sub_count, 1);
    }
}
