use std::sync::Arc;

use dashmap::DashMap;

use crate::network::{ConnectionHandler, ConnectionId};

/// Live connections of the listener, keyed by connection id.
///
/// An id is present exactly while its handler is reading: it is inserted by the accept
/// path right before the read loop starts and removed by the handler's error callback.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handlers: DashMap<ConnectionId, Arc<ConnectionHandler>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            handlers: DashMap::new(),
        }
    }

    pub fn insert(&self, id: ConnectionId, handler: Arc<ConnectionHandler>) {
        if self.handlers.insert(id, handler).is_some() {
            // ids are never reused while assigned
            tracing::error!("connection id {} was still registered", id);
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandler>> {
        self.handlers.remove(&id).map(|(_, handler)| handler)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandler>> {
        self.handlers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.handlers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Closes every registered handler. Entries are removed by their error callbacks.
    pub fn close_all(&self) {
        let handlers: Vec<Arc<ConnectionHandler>> = self
            .handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handler in handlers {
            handler.close();
        }
    }
}
