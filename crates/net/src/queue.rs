use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::error::NetError;
use crate::protocol::ConnectionId;

/// An outbound packet as queued by the application thread. `id` is the
/// destination connection on the server and ignored on the client; `timed`
/// packets get a sequence byte stamped when the worker flushes them.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub id: ConnectionId,
    pub command: u8,
    pub payload: Vec<u8>,
    pub timed: bool,
}

/// Bounded mutex-guarded FIFO bridging the application thread and the
/// network worker. Pushing into a full queue fails and drops the entry;
/// back-pressure is advisory, nothing ever blocks.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, item: T) -> Result<(), NetError> {
        self.push_with_limit(item, self.capacity)
    }

    /// Push with a caller-supplied bound. The server scales its shared
    /// queues with the live connection count instead of using the fixed
    /// per-queue capacity.
    pub fn push_with_limit(&self, item: T, limit: usize) -> Result<(), NetError> {
        let mut items = self.lock();
        if items.len() >= limit {
            return Err(NetError::QueueFull);
        }
        items.push_back(item);
        Ok(())
    }

    /// Pops every queued entry at once; the single consumer pays one
    /// lock/unlock per drain instead of per item.
    pub fn drain_all(&self) -> Vec<T> {
        let mut items = self.lock();
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A poisoned queue still holds valid entries; keep the data
        // plane alive if some other thread panicked.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}
