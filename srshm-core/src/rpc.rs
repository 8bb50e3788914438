//! RPC registration and RPC-subscription CRUD (spec §4.8, RPC subscriptions
//! in the entity table). Grounded in `sr_shmmain_add_rpc`/`_del_rpc` and
//! `sr_shmmain_rpc_subscription_add`/`_del` in
//! `original_source/src/shm_main.c`. Unlike module-scoped subscriptions,
//! RPCs are addressed by operation path and registered once in the global
//! array anchored in [`MainHeader`], independent of any one module.

use srshm_common::error::{ShmError, ShmResult};

use crate::alloc::ExtAllocator;
use crate::ext::ExtRegion;
use crate::layout::MainHeader;

/// One registered RPC/action operation path plus its subscriber array.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RpcEntry {
    /// Ext offset of the NUL-terminated operation path.
    pub op_path_offset: u64,
    /// Ext offset of the packed [`RpcSubscriber`] array.
    pub sub_offset: u64,
    /// Number of subscribers.
    pub sub_count: u32,
    _pad: u32,
}

/// One subscriber to an RPC entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RpcSubscriber {
    /// Owning connection id.
    pub conn_id: u64,
    /// Subscription id.
    pub sub_id: u32,
    /// Delivery priority; lower runs first.
    pub priority: u32,
    /// Caller-defined subscription option bits.
    pub opts: u32,
    _pad: u32,
    /// Ext offset of the subscribed xpath filter under the operation path,
    /// or 0 for the bare operation path.
    pub xpath_offset: u64,
}

/// CRUD over the global RPC array anchored in [`MainHeader`].
pub struct RpcRegistry<'a> {
    header: &'a mut MainHeader,
    ext: &'a mut ExtRegion,
}

impl<'a> RpcRegistry<'a> {
    /// Borrow the header and Ext region to operate on.
    pub fn new(header: &'a mut MainHeader, ext: &'a mut ExtRegion) -> Self {
        Self { header, ext }
    }

    fn load(&self) -> ShmResult<Vec<RpcEntry>> {
        self.ext.read_records(self.header.rpc_array_offset, self.header.rpc_count)
    }

    fn store(&mut self, entries: &[RpcEntry]) -> ShmResult<()> {
        let mut alloc = ExtAllocator::new(self.ext);
        let (offset, count) =
            alloc.rewrite_records(self.header.rpc_array_offset, self.header.rpc_count, entries)?;
        self.header.rpc_array_offset = offset;
        self.header.rpc_count = count;
        Ok(())
    }

    fn find_index(entries: &[RpcEntry], ext: &ExtRegion, op_path: &str) -> ShmResult<Option<usize>> {
        for (i, e) in entries.iter().enumerate() {
            if ext.read_str(e.op_path_offset)? == op_path {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Register an operation path if it isn't already registered. Idempotent.
    pub fn add_rpc(&mut self, op_path: &str) -> ShmResult<()> {
        let mut entries = self.load()?;
        if Self::find_index(&entries, self.ext, op_path)?.is_some() {
            return Ok(());
        }
        let mut alloc = ExtAllocator::new(self.ext);
        let op_path_offset = alloc.alloc_str(op_path)?;
        entries.push(RpcEntry {
            op_path_offset,
            sub_offset: 0,
            sub_count: 0,
            _pad: 0,
        });
        self.store(&entries)
    }

    /// Remove an operation path entirely. Errors if it still has
    /// subscribers, matching the original's refusal to drop a live RPC.
    pub fn del_rpc(&mut self, op_path: &str) -> ShmResult<()> {
        let mut entries = self.load()?;
        let idx = Self::find_index(&entries, self.ext, op_path)?.ok_or_else(|| ShmError::NotFound {
            what: format!("rpc {op_path}"),
        })?;
        if entries[idx].sub_count > 0 {
            return Err(ShmError::Validation {
                message: format!("rpc {op_path} still has subscribers"),
            });
        }
        let removed = entries.swap_remove(idx);
        let len = self.ext.read_str(removed.op_path_offset)?.len() as u64 + 1;
        let mut alloc = ExtAllocator::new(self.ext);
        alloc.free(removed.op_path_offset, len);
        drop(alloc);
        self.store(&entries)
    }

    /// Find an RPC entry's subscriber list, without mutating anything.
    pub fn find_rpc(&self, op_path: &str) -> ShmResult<Option<RpcEntry>> {
        let entries = self.load()?;
        Ok(Self::find_index(&entries, self.ext, op_path)?.map(|i| entries[i]))
    }

    /// List every registered RPC entry.
    pub fn list(&self) -> ShmResult<Vec<RpcEntry>> {
        self.load()
    }

    /// List an entry's subscribers.
    pub fn list_subscribers(&self, entry: &RpcEntry) -> ShmResult<Vec<RpcSubscriber>> {
        self.ext.read_records(entry.sub_offset, entry.sub_count)
    }

    /// Read out an entry's operation path.
    pub fn op_path(&self, entry: &RpcEntry) -> ShmResult<String> {
        Ok(self.ext.read_str(entry.op_path_offset)?.to_string())
    }

    /// Subscribe to an RPC's operation path, returning the new `sub_id`.
    /// Registers the operation path first if it is not yet known.
    pub fn add_subscription(
        &mut self,
        op_path: &str,
        conn_id: u64,
        priority: u32,
        opts: u32,
        xpath: Option<&str>,
    ) -> ShmResult<u32> {
        self.add_rpc(op_path)?;
        let mut entries = self.load()?;
        let idx = Self::find_index(&entries, self.ext, op_path)?.unwrap();

        let mut subs: Vec<RpcSubscriber> =
            self.ext.read_records(entries[idx].sub_offset, entries[idx].sub_count)?;
        let sub_id = subs.iter().map(|s| s.sub_id).max().map(|m| m + 1).unwrap_or(1);

        let mut alloc = ExtAllocator::new(self.ext);
        let xpath_offset = match xpath {
            Some(x) => alloc.alloc_str(x)?,
            None => 0,
        };
        subs.push(RpcSubscriber {
            conn_id,
            sub_id,
            priority,
            opts,
            _pad: 0,
            xpath_offset,
        });
        let (offset, count) =
            alloc.rewrite_records(entries[idx].sub_offset, entries[idx].sub_count, &subs)?;
        entries[idx].sub_offset = offset;
        entries[idx].sub_count = count;
        self.store(&entries)?;
        Ok(sub_id)
    }

    /// Unsubscribe from an RPC's operation path by `sub_id`.
    pub fn del_subscription(&mut self, op_path: &str, sub_id: u32) -> ShmResult<()> {
        let mut entries = self.load()?;
        let idx = Self::find_index(&entries, self.ext, op_path)?.ok_or_else(|| ShmError::NotFound {
            what: format!("rpc {op_path}"),
        })?;

        let mut subs: Vec<RpcSubscriber> =
            self.ext.read_records(entries[idx].sub_offset, entries[idx].sub_count)?;
        let sidx = subs
            .iter()
            .position(|s| s.sub_id == sub_id)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("rpc subscription {sub_id}"),
            })?;
        let removed = subs.swap_remove(sidx);

        let xpath_len = if removed.xpath_offset != 0 {
            Some(self.ext.read_str(removed.xpath_offset)?.len() as u64 + 1)
        } else {
            None
        };

        let mut alloc = ExtAllocator::new(self.ext);
        if let Some(len) = xpath_len {
            alloc.free(removed.xpath_offset, len);
        }
        let (offset, count) =
            alloc.rewrite_records(entries[idx].sub_offset, entries[idx].sub_count, &subs)?;
        entries[idx].sub_offset = offset;
        entries[idx].sub_count = count;
        self.store(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MAIN_SHM_VERSION;
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
    fn add_rpc_is_idempotent() {
        let mut header = new_header();
        let mut ext = make_ext();
        let mut reg = RpcRegistry::new(&mut header, &mut ext);
        reg.add_rpc("/ietf-interfaces:reset").unwrap();
        reg.add_rpc("/ietf-interfaces:reset").unwrap();
        assert_eq!(header.rpc_count, 1);
    }

    #[test]
    fn subscribe_unsubscribe_round_trip() {
        let mut header = new_header();
        let mut ext = make_ext();
        let mut reg = RpcRegistry::new(&mut header, &mut ext);

        let sub_id = reg
            .add_subscription("/ietf-interfaces:reset", 1, 0, 0, None)
            .unwrap();
        let entry = reg.find_rpc("/ietf-interfaces:reset").unwrap().unwrap();
        assert_eq!(entry.sub_count, 1);

        reg.del_subscription("/ietf-interfaces:reset", sub_id).unwrap();
        let entry = reg.find_rpc("/ietf-interfaces:reset").unwrap().unwrap();
        assert_eq!(entry.sub_count, 0);
    }

    #[test]
    fn del_rpc_with_subscribers_fails() {
        let mut header = new_header();
        let mut ext = make_ext();
        let mut reg = RpcRegistry::new(&mut header, &mut ext);
        reg.add_subscription("/x:op", 1, 0, 0, None).unwrap();
        assert!(reg.del_rpc("/x:op").is_err());
    }
}
