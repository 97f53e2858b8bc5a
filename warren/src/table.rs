use std::{collections::HashMap, sync::Arc};

use tokio::sync::{watch, RwLock};
use tracing::warn;

use crate::{connection::ConnectionInner, error::ForwardError};

/// The endpoint's connection map plus the id discipline around it.
///
/// Both peers share a single monotonically increasing view of the id counter: outbound
/// allocations bump it, and every accepted inbound connection fast-forwards it. An id is never
/// reused, even after its connection closes.
///
/// The table also tracks how many registered connections have not yet reached their final
/// teardown; [`wait_empty`](Self::wait_empty) is the shutdown controller's quiescence barrier.
pub(crate) struct ConnectionTable {
    inner: RwLock<TableInner>,
    live: watch::Sender<usize>,
}

struct TableInner {
    connections: HashMap<u64, Arc<ConnectionInner>>,
    last_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: RwLock::new(TableInner {
                connections: HashMap::new(),
                last_id: 0,
            }),
            live,
        }
    }

    /// Allocates the next outbound connection id.
    pub async fn allocate_id(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.last_id += 1;
        inner.last_id
    }

    /// Inserts a locally initiated connection under its allocated id. A collision here means the
    /// allocator handed out a live id, which can't happen on a well-behaved endpoint, so it is
    /// reported as a fatal internal error rather than handled.
    pub async fn insert(&self, connection: Arc<ConnectionInner>) -> Result<(), ForwardError> {
        let mut inner = self.inner.write().await;
        let id = connection.id;
        if inner.connections.contains_key(&id) {
            return Err(ForwardError::IdCollision(id));
        }

        inner.connections.insert(id, connection);
        self.live.send_modify(|count| *count += 1);
        Ok(())
    }

    /// Registers a connection the peer opened, enforcing the inbound id discipline: an id that
    /// doesn't advance the counter is a replay or hijack attempt and the record is dropped; a gap
    /// is legal (the peer may have allocated and failed to emit) but unusual, so it is logged.
    ///
    /// Returns whether the connection was registered.
    pub async fn register_inbound(&self, connection: Arc<ConnectionInner>) -> bool {
        let mut inner = self.inner.write().await;
        let id = connection.id;

        if inner.connections.contains_key(&id) {
            warn!(connection_id = id, "peer tried to open a connection with an id that is in use");
            return false;
        }
        if id <= inner.last_id {
            warn!(
                connection_id = id,
                last_id = inner.last_id,
                "dropping connection with a non-increasing id, possible replay"
            );
            return false;
        }
        if id != inner.last_id + 1 {
            warn!(connection_id = id, last_id = inner.last_id, "peer skipped connection ids");
        }

        inner.last_id = id;
        inner.connections.insert(id, connection);
        self.live.send_modify(|count| *count += 1);
        true
    }

    pub async fn get(&self, id: u64) -> Option<Arc<ConnectionInner>> {
        self.inner.read().await.connections.get(&id).cloned()
    }

    /// Removes a connection on final teardown, releasing its slot in the quiescence barrier.
    /// Removing an id twice is harmless; only the first call decrements.
    pub async fn remove(&self, id: u64) {
        let removed = self.inner.write().await.connections.remove(&id);
        if removed.is_some() {
            self.live.send_modify(|count| *count -= 1);
        }
    }

    /// Clones the current set of connections out of the table, so callers can operate on them
    /// without holding the table lock while they do.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionInner>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Blocks until every registered connection has reached its final teardown. Returns
    /// immediately if none are live.
    pub async fn wait_empty(&self) {
        let mut receiver = self.live.subscribe();
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}
