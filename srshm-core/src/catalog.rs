//! Module catalog builder (spec §4.7): turns a YANG metadata tree handed in
//! by the external parser collaborator (spec §6) into Main/Ext content, and
//! keeps each module's inverse-dependency array an exact transitive closure
//! of the forward graph (invariant I4).
//!
//! Grounded in `sr_shmmain_add_modules`/`sr_shmmain_add_modules_deps`/
//! `sr_shmmain_del_modules_deps` in `original_source/src/shm_main.c`.

use std::collections::{HashMap, HashSet};

use srshm_common::error::{ShmError, ShmResult};

use crate::alloc::ExtAllocator;
use crate::ext::ExtRegion;
use crate::layout::{DS_COUNT, ModuleFlags, ModuleRecord};
use crate::main_region::MainRegion;

/// What the YANG metadata collaborator supplies to install one module.
/// Dependencies are named by module name; they must already be installed.
#[derive(Debug, Clone)]
pub struct ModuleInstallRequest {
    /// Module name, unique within the catalog.
    pub name: String,
    /// Revision date (`YYYY-MM-DD`), if the module declares one.
    pub revision: Option<String>,
    /// Module-level flags.
    pub flags: ModuleFlags,
    /// Which datastores this module is enabled for.
    pub ds_enabled: [bool; DS_COUNT],
    /// Names of modules this module imports/depends on.
    pub deps: Vec<String>,
}

/// An owned, copied-out view of one module. Never carries a raw offset —
/// spec §6 forbids leaking Ext addresses across the public interface.
#[derive(Debug, Clone)]
pub struct ModuleView {
    /// Module name.
    pub name: String,
    /// Revision date, if set.
    pub revision: Option<String>,
    /// Module-level flags.
    pub flags: ModuleFlags,
    /// Which datastores this module is enabled for.
    pub ds_enabled: [bool; DS_COUNT],
    /// Names of modules this module directly depends on.
    pub deps: Vec<String>,
    /// Names of modules that (transitively) depend on this one.
    pub inv_deps: Vec<String>,
}

/// Builds and maintains the module catalog across Main/Ext SHM.
pub struct ModuleCatalog<'a> {
    main: &'a mut MainRegion,
    ext: &'a mut ExtRegion,
}

impl<'a> ModuleCatalog<'a> {
    /// Borrow the Main/Ext regions to operate on. Caller must already hold
    /// `main_shm.lock` for writing for any mutating call.
    pub fn new(main: &'a mut MainRegion, ext: &'a mut ExtRegion) -> Self {
        Self { main, ext }
    }

    /// Index of the module named `name` in Main SHM's module array, if
    /// installed.
    pub fn index_of(&self, name: &str) -> ShmResult<Option<usize>> {
        index_of(self.main, self.ext, name)
    }

    /// Copy one module record out as an owned [`ModuleView`].
    pub fn view(&self, record: &ModuleRecord) -> ShmResult<ModuleView> {
        view(self.ext, record)
    }

    /// Look up a module by name.
    pub fn find_module(&self, name: &str) -> ShmResult<Option<ModuleView>> {
        find_module(self.main, self.ext, name)
    }

    /// List every installed module.
    pub fn list(&self) -> ShmResult<Vec<ModuleView>> {
        list_modules(self.main, self.ext)
    }

    /// Install a new module, rebuilding every module's inverse-dependency
    /// array afterward so I4 (transitive closure) holds immediately.
    pub fn install_module(&mut self, req: ModuleInstallRequest) -> ShmResult<()> {
        if self.index_of(&req.name)?.is_some() {
            return Err(ShmError::Validation {
                message: format!("module {} already installed", req.name),
            });
        }

        let mut dep_name_offsets = Vec::with_capacity(req.deps.len());
        for dep in &req.deps {
            let idx = self.index_of(dep)?.ok_or_else(|| ShmError::Validation {
                message: format!("module {} depends on unknown module {dep}", req.name),
            })?;
            dep_name_offsets.push(self.main.modules()[idx].name_offset);
        }

        let mut alloc = ExtAllocator::new(self.ext);
        let name_offset = alloc.alloc_str(&req.name)?;
        let revision_offset = match &req.revision {
            Some(r) => alloc.alloc_str(r)?,
            None => 0,
        };
        let deps_offset = alloc.alloc_u64_array(&dep_name_offsets)?;

        let record = ModuleRecord {
            name_offset,
            revision_offset,
            flags_bits: req.flags.bits(),
            ds_enabled: req.ds_enabled,
            deps_offset,
            deps_count: dep_name_offsets.len() as u32,
            inv_deps_offset: 0,
            inv_deps_count: 0,
            change_sub_offset: 0,
            change_sub_count: 0,
            oper_sub_offset: 0,
            oper_sub_count: 0,
            notif_sub_offset: 0,
            notif_sub_count: 0,
        };
        self.main.push_module(record)?;
        self.rebuild_inverse_deps()
    }

    /// Remove a module. Fails if any other module still lists it as a
    /// dependency (matching the original's refusal to remove a depended-on
    /// module out from under its dependents).
    pub fn remove_module(&mut self, name: &str) -> ShmResult<()> {
        let idx = self.index_of(name)?.ok_or_else(|| ShmError::NotFound {
            what: format!("module {name}"),
        })?;

        if self.main.modules()[idx].inv_deps_count > 0 {
            let dependents = self.view(&self.main.modules()[idx])?.inv_deps;
            return Err(ShmError::Validation {
                message: format!("module {name} is still depended on by {dependents:?}"),
            });
        }

        let record = self.main.swap_remove_module(idx);
        let name_len = if record.name_offset != 0 {
            self.ext.read_str(record.name_offset).unwrap_or("").len() as u64 + 1
        } else {
            0
        };
        let revision_len = if record.revision_offset != 0 {
            self.ext.read_str(record.revision_offset).unwrap_or("").len() as u64 + 1
        } else {
            0
        };

        let mut alloc = ExtAllocator::new(self.ext);
        alloc.free(record.name_offset, name_len);
        alloc.free(record.revision_offset, revision_len);
        alloc.free(record.deps_offset, record.deps_count as u64 * 8);
        alloc.free(record.inv_deps_offset, record.inv_deps_count as u64 * 8);
        alloc.free(
            record.change_sub_offset,
            record.change_sub_count as u64 * std::mem::size_of::<crate::subscriptions::ChangeSub>() as u64,
        );
        alloc.free(
            record.oper_sub_offset,
            record.oper_sub_count as u64 * std::mem::size_of::<crate::subscriptions::OperSub>() as u64,
        );
        alloc.free(
            record.notif_sub_offset,
            record.notif_sub_count as u64 * std::mem::size_of::<crate::subscriptions::NotifSub>() as u64,
        );
        drop(alloc);

        self.rebuild_inverse_deps()
    }

    /// Recompute every module's inverse-dependency array as the exact
    /// transitive closure of the forward graph (spec I4). Runs after every
    /// install/remove, which keeps it a simple full rebuild instead of an
    /// incremental update — acceptable at the module-catalog scale spec §9
    /// calls out for the linear-scan lookups.
    fn rebuild_inverse_deps(&mut self) -> ShmResult<()> {
        let count = self.main.modules().len();
        let mut names = Vec::with_capacity(count);
        let mut forward: Vec<HashSet<usize>> = Vec::with_capacity(count);
        let mut name_to_idx = HashMap::new();

        for (i, m) in self.main.modules().iter().enumerate() {
            let name = self.ext.read_str(m.name_offset)?.to_string();
            name_to_idx.insert(name.clone(), i);
            names.push(name);
        }
        for m in self.main.modules() {
            let dep_offsets = self.ext.read_u64_array(m.deps_offset, m.deps_count)?;
            let mut deps = HashSet::with_capacity(dep_offsets.len());
            for off in dep_offsets {
                let dep_name = self.ext.read_str(off)?;
                if let Some(&idx) = name_to_idx.get(dep_name) {
                    deps.insert(idx);
                }
            }
            forward.push(deps);
        }

        // Reverse the forward graph, then close it transitively per node.
        let mut reverse: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        for (i, deps) in forward.iter().enumerate() {
            for &d in deps {
                reverse[d].insert(i);
            }
        }

        let mut inv_deps: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        for start in 0..count {
            let mut stack: Vec<usize> = reverse[start].iter().copied().collect();
            let mut seen = HashSet::new();
            while let Some(n) = stack.pop() {
                if seen.insert(n) {
                    inv_deps[start].insert(n);
                    stack.extend(reverse[n].iter().copied());
                }
            }
        }

        for i in 0..count {
            let old_offset = self.main.modules()[i].inv_deps_offset;
            let old_count = self.main.modules()[i].inv_deps_count;

            let mut name_offsets: Vec<u64> = inv_deps[i]
                .iter()
                .map(|&d| self.main.modules()[d].name_offset)
                .collect();
            name_offsets.sort_unstable();

            let mut alloc = ExtAllocator::new(self.ext);
            let (offset, new_count) = alloc.rewrite_records(old_offset, old_count, &name_offsets)?;

            let rec = &mut self.main.modules_mut()[i];
            rec.inv_deps_offset = offset;
            rec.inv_deps_count = new_count;
        }
        Ok(())
    }
}

/// Index of the module named `name`, usable under a plain shared lock since
/// it only reads.
pub fn index_of(main: &MainRegion, ext: &ExtRegion, name: &str) -> ShmResult<Option<usize>> {
    for (i, m) in main.modules().iter().enumerate() {
        if ext.read_str(m.name_offset)? == name {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Copy one module record out as an owned [`ModuleView`].
pub fn view(ext: &ExtRegion, record: &ModuleRecord) -> ShmResult<ModuleView> {
    let name = ext.read_str(record.name_offset)?.to_string();
    let revision = if record.revision_offset == 0 {
        None
    } else {
        Some(ext.read_str(record.revision_offset)?.to_string())
    };
    let dep_offsets = ext.read_u64_array(record.deps_offset, record.deps_count)?;
    let mut deps = Vec::with_capacity(dep_offsets.len());
    for off in dep_offsets {
        deps.push(ext.read_str(off)?.to_string());
    }
    let inv_offsets = ext.read_u64_array(record.inv_deps_offset, record.inv_deps_count)?;
    let mut inv_deps = Vec::with_capacity(inv_offsets.len());
    for off in inv_offsets {
        inv_deps.push(ext.read_str(off)?.to_string());
    }
    Ok(ModuleView {
        name,
        revision,
        flags: record.flags(),
        ds_enabled: record.ds_enabled,
        deps,
        inv_deps,
    })
}

/// Look up a module by name, usable under a plain shared lock.
pub fn find_module(main: &MainRegion, ext: &ExtRegion, name: &str) -> ShmResult<Option<ModuleView>> {
    match index_of(main, ext, name)? {
        Some(i) => Ok(Some(view(ext, &main.modules()[i])?)),
        None => Ok(None),
    }
}

/// List every installed module, usable under a plain shared lock.
pub fn list_modules(main: &MainRegion, ext: &ExtRegion) -> ShmResult<Vec<ModuleView>> {
    main.modules().iter().map(|m| view(ext, m)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use srshm_common::consts::EXT_HEADER_SIZE;
    use srshm_common::region::SharedRegion;
    use tempfile::tempdir;

    fn setup() -> (MainRegion, ExtRegion, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let main = MainRegion::create(dir.path().join("main.bin")).unwrap();
        let mut ext = ExtRegion::new(SharedRegion::create(dir.path().join("ext.bin"), 4096).unwrap());
        ext.set_next_free(EXT_HEADER_SIZE);
        (main, ext, dir)
    }

    fn req(name: &str, deps: &[&str]) -> ModuleInstallRequest {
        ModuleInstallRequest {
            name: name.to_string(),
            revision: Some("2024-01-01".to_string()),
            flags: ModuleFlags::empty(),
            ds_enabled: [true, true, false],
            deps: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn install_two_independent_modules() {
        let (mut main, mut ext, _dir) = setup();
        let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
        catalog.install_module(req("ietf-interfaces", &[])).unwrap();
        catalog.install_module(req("ietf-ip", &[])).unwrap();
        assert_eq!(catalog.list().unwrap().len(), 2);
    }

    #[test]
    fn inverse_deps_are_transitive_closure() {
        let (mut main, mut ext, _dir) = setup();
        let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
        catalog.install_module(req("a", &[])).unwrap();
        catalog.install_module(req("b", &["a"])).unwrap();
        catalog.install_module(req("c", &["b"])).unwrap();

        let a = catalog.find_module("a").unwrap().unwrap();
        let mut inv = a.inv_deps.clone();
        inv.sort();
        assert_eq!(inv, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn install_with_unknown_dependency_fails() {
        let (mut main, mut ext, _dir) = setup();
        let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
        assert!(catalog.install_module(req("b", &["a"])).is_err());
    }

    #[test]
    fn remove_module_with_dependents_fails() {
        let (mut main, mut ext, _dir) = setup();
        let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
        catalog.install_module(req("a", &[])).unwrap();
        catalog.install_module(req("b", &["a"])).unwrap();
        assert!(catalog.remove_module("a").is_err());
    }

    #[test]
    fn remove_leaf_module_succeeds_and_updates_inverse_deps() {
        let (mut main, mut ext, _dir) = setup();
        let mut catalog = ModuleCatalog::new(&mut main, &mut ext);
        catalog.install_module(req("a", &[])).unwrap();
        catalog.install_module(req("b", &["a"])).unwrap();
        catalog.remove_module("b").unwrap();

        let a = catalog.find_module("a").unwrap().unwrap();
        assert!(a.inv_deps.is_empty());
    }
}
