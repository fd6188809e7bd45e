use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::network::ConnectionId;
use crate::{AppError, AppResult};

/// Pool of reusable connection ids `1..=capacity`.
///
/// Ids are handed out from the front and returned to the back, so once every id has
/// been used once they are reused round-robin. Acquiring from an exhausted pool waits
/// until an id is released.
#[derive(Debug)]
pub struct IdentityPool {
    free: Mutex<VecDeque<ConnectionId>>,
    available: Semaphore,
    capacity: usize,
}

impl IdentityPool {
    pub fn new(capacity: usize) -> IdentityPool {
        let free: VecDeque<ConnectionId> = (1..=capacity as ConnectionId).collect();
        IdentityPool {
            available: Semaphore::new(free.len()),
            capacity: free.len(),
            free: Mutex::new(free),
        }
    }

    /// Takes the id at the front of the pool, waiting while the pool is empty.
    pub async fn acquire(&self) -> AppResult<ConnectionId> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|e| AppError::IllegalStateError(format!("identity pool closed: {}", e)))?;
        permit.forget();
        self.pop_front()
    }

    /// Takes the id at the front of the pool, or `None` when every id is in use.
    pub fn try_acquire(&self) -> Option<ConnectionId> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.pop_front().ok()
    }

    fn pop_front(&self) -> AppResult<ConnectionId> {
        self.free.lock().pop_front().ok_or_else(|| {
            AppError::IllegalStateError("identity pool permit without a free id".to_string())
        })
    }

    /// Returns `id` to the back of the pool.
    pub fn release(&self, id: ConnectionId) {
        {
            let mut free = self.free.lock();
            debug_assert!(!free.contains(&id), "connection id {} released twice", id);
            free.push_back(id);
        }
        self.available.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free ids in allocation order.
    pub fn free_ids(&self) -> Vec<ConnectionId> {
        self.free.lock().iter().copied().collect()
    }
}
