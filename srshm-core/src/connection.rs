//! Connection state and liveness (spec §4.6).
//!
//! A connection record is one entry per attached process; it anchors that
//! process's event-pipe numbers, which is how a subscriber is notified of
//! changes without the substrate itself owning a transport. Grounded in
//! `sr_shmmain_state_add_conn`/`sr_shmmain_state_del_conn`/
//! `sr_shmmain_state_add_evpipe` in `original_source/src/shm_main.c`.

use srshm_common::error::{ShmError, ShmResult};
use srshm_common::platform::is_process_alive;

use crate::alloc::ExtAllocator;
use crate::ext::ExtRegion;
use crate::layout::MainHeader;

/// One attached process's liveness anchor and event-pipe registry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConnState {
    /// Unique id handed out when the connection was created.
    pub conn_id: u64,
    /// Owning process id.
    pub pid: i32,
    _pad: u32,
    /// Ext offset of the packed `u64` array of evpipe numbers.
    pub evpipe_offset: u64,
    /// Number of evpipe numbers registered.
    pub evpipe_count: u32,
    _pad2: u32,
}

/// CRUD over the connection-state array anchored in [`MainHeader`].
pub struct ConnectionTable<'a> {
    header: &'a mut MainHeader,
    ext: &'a mut ExtRegion,
}

impl<'a> ConnectionTable<'a> {
    /// Borrow the header and Ext region to operate on.
    pub fn new(header: &'a mut MainHeader, ext: &'a mut ExtRegion) -> Self {
        Self { header, ext }
    }

    fn load(&self) -> ShmResult<Vec<ConnState>> {
        self.ext
            .read_records(self.header.conn_array_offset, self.header.conn_count)
    }

    fn store(&mut self, conns: &[ConnState]) -> ShmResult<()> {
        let mut alloc = ExtAllocator::new(self.ext);
        let (offset, count) = alloc.rewrite_records(
            self.header.conn_array_offset,
            self.header.conn_count,
            conns,
        )?;
        self.header.conn_array_offset = offset;
        self.header.conn_count = count;
        Ok(())
    }

    /// Register a new connection for `pid`, returning its connection id.
    pub fn add_connection(&mut self, pid: i32) -> ShmResult<u64> {
        let conn_id = self.header.next_conn_id;
        self.header.next_conn_id += 1;

        let mut conns = self.load()?;
        conns.push(ConnState {
            conn_id,
            pid,
            _pad: 0,
            evpipe_offset: 0,
            evpipe_count: 0,
            _pad2: 0,
        });
        self.store(&conns)?;
        Ok(conn_id)
    }

    /// Remove a connection and free its evpipe array. Swap-with-last
    /// removal, matching the subscription registry's convention.
    pub fn remove_connection(&mut self, conn_id: u64) -> ShmResult<()> {
        let mut conns = self.load()?;
        let idx = conns
            .iter()
            .position(|c| c.conn_id == conn_id)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("connection {conn_id}"),
            })?;
        let removed = conns.swap_remove(idx);
        if removed.evpipe_count > 0 {
            let mut alloc = ExtAllocator::new(self.ext);
            alloc.free(removed.evpipe_offset, removed.evpipe_count as u64 * 8);
        }
        self.store(&conns)
    }

    /// Register an evpipe number for an existing connection.
    pub fn add_evpipe(&mut self, conn_id: u64, evpipe_num: u32) -> ShmResult<()> {
        let mut conns = self.load()?;
        let conn = conns
            .iter_mut()
            .find(|c| c.conn_id == conn_id)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("connection {conn_id}"),
            })?;

        let mut pipes = self
            .ext
            .read_u64_array(conn.evpipe_offset, conn.evpipe_count)?;
        pipes.push(evpipe_num as u64);

        let mut alloc = ExtAllocator::new(self.ext);
        let new_offset = alloc.alloc_u64_array(&pipes)?;
        alloc.free(conn.evpipe_offset, conn.evpipe_count as u64 * 8);

        let conn = conns.iter_mut().find(|c| c.conn_id == conn_id).unwrap();
        conn.evpipe_offset = new_offset;
        conn.evpipe_count = pipes.len() as u32;
        self.store(&conns)
    }

    /// Remove one evpipe number from a connection.
    pub fn remove_evpipe(&mut self, conn_id: u64, evpipe_num: u32) -> ShmResult<()> {
        let mut conns = self.load()?;
        let conn = conns
            .iter_mut()
            .find(|c| c.conn_id == conn_id)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("connection {conn_id}"),
            })?;

        let mut pipes = self
            .ext
            .read_u64_array(conn.evpipe_offset, conn.evpipe_count)?;
        let old_offset = conn.evpipe_offset;
        let old_count = conn.evpipe_count;
        pipes.retain(|&p| p != evpipe_num as u64);

        let mut alloc = ExtAllocator::new(self.ext);
        let (new_offset, new_count) = alloc.rewrite_records(old_offset, old_count, &pipes)?;

        let conn = conns.iter_mut().find(|c| c.conn_id == conn_id).unwrap();
        conn.evpipe_offset = new_offset;
        conn.evpipe_count = new_count;
        self.store(&conns)
    }

    /// List every connection record.
    pub fn list(&self) -> ShmResult<Vec<ConnState>> {
        self.load()
    }

    /// List connections whose owning process is no longer alive.
    pub fn dead_connections(&self) -> ShmResult<Vec<ConnState>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|c| !is_process_alive(c.pid))
            .collect())
    }
}
