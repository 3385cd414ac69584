use std::time::{Duration, Instant};

use crate::{
    error::{Error, Result},
    peer_state::{PeerConnectionState, PeerInfo},
    pool::{AllocationPool, SlotHandle},
    transport::PeerAddress,
};

/// Bounded set of peer connection states. The table owns every entry, callers only keep
/// [SlotHandle]s.
pub struct PeerConnectionTable {
    pool: AllocationPool<PeerConnectionState>,
    idle_timeout: Duration,
    evicted: Vec<PeerInfo>,
}

impl PeerConnectionTable {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            pool: AllocationPool::new(capacity),
            idle_timeout,
            evicted: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Takes a free slot, or evicts the least recently used entry that has been idle
    /// longer than the idle timeout. Entries with a handshake in progress are never evicted.
    pub fn allocate(&mut self, peer_address: PeerAddress, now: Instant) -> Result<SlotHandle> {
        let handle = match self.pool.acquire() {
            Some(h) => h,
            None => {
                let victim = self
                    .pool
                    .iter()
                    .filter(|(_, e)| !e.is_handshake_pending())
                    .filter(|(_, e)| e.idle_for(now) > self.idle_timeout)
                    .max_by_key(|(_, e)| e.idle_for(now))
                    .map(|(h, _)| h)
                    .ok_or(Error::ResourceExhausted)?;
                if let Some(entry) = self.pool.get(victim) {
                    log::debug!(
                        "evicting idle session {} of {:?}",
                        entry.local_session_id(),
                        entry.peer_address()
                    );
                    if entry.is_established() {
                        self.evicted.push(entry.info(victim));
                    }
                }
                self.release_slot(victim)?;
                self.pool.acquire().ok_or(Error::ResourceExhausted)?
            }
        };
        let entry = self.pool.get_mut(handle).ok_or(Error::ResourceExhausted)?;
        entry.reset();
        entry.set_peer_address(peer_address);
        entry.touch(now);
        Ok(handle)
    }

    /// Established entries that were evicted since the last call.
    pub fn drain_evicted(&mut self) -> Vec<PeerInfo> {
        std::mem::take(&mut self.evicted)
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&PeerConnectionState> {
        self.pool.get(handle)
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut PeerConnectionState> {
        self.pool.get_mut(handle)
    }

    pub fn find_by_session_id(&self, local_session_id: u16) -> Option<SlotHandle> {
        if local_session_id == 0 {
            return None;
        }
        self.pool
            .iter()
            .find(|(_, e)| e.local_session_id() == local_session_id)
            .map(|(h, _)| h)
    }

    pub fn find_by_node_id(&self, node_id: u64) -> Option<SlotHandle> {
        self.pool
            .iter()
            .find(|(_, e)| e.is_established() && e.peer_node_id() == Some(node_id))
            .map(|(h, _)| h)
    }

    pub fn find_by_address(&self, address: &PeerAddress) -> Option<SlotHandle> {
        self.pool
            .iter()
            .find(|(_, e)| e.peer_address() == Some(address))
            .map(|(h, _)| h)
    }

    pub fn is_session_id_in_use(&self, local_session_id: u16) -> bool {
        self.find_by_session_id(local_session_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &PeerConnectionState)> {
        self.pool.iter()
    }

    fn release_slot(&mut self, handle: SlotHandle) -> Result<()> {
        if let Some(entry) = self.pool.get_mut(handle) {
            entry.reset();
        }
        if self.pool.release(handle) {
            Ok(())
        } else {
            Err(Error::invalid("release of a free or stale slot"))
        }
    }

    /// Wipes the entry and returns the slot to the pool.
    pub fn release(&mut self, handle: SlotHandle) -> Result<()> {
        debug_assert!(self.pool.is_live(handle), "double release of {:?}", handle);
        self.release_slot(handle)
    }

    /// Releases every established entry idle past the timeout and reports them.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<PeerInfo> {
        let expired: Vec<PeerInfo> = self
            .pool
            .iter()
            .filter(|(_, e)| e.is_established() && e.idle_for(now) > self.idle_timeout)
            .map(|(h, e)| e.info(h))
            .collect();
        for info in &expired {
            log::debug!("session {} idle, expiring", info.local_session_id);
            let _ = self.release_slot(info.handle);
        }
        expired
    }
}
