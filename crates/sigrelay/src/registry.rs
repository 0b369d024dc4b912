use parking_lot::Mutex;
use sigrelay_common::{ClientId, RoomName};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tungstenite::Message;

/// Process-unique id assigned to every accepted connection.
pub type ConnId = u64;

/// Handle held in the registry, used to queue messages to a connection.
///
/// The owning session is the only task that writes to the socket; everyone
/// else goes through `tx`, which keeps writes to one peer serialized.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Connection id, used to tell a live entry from a superseded one.
    pub id: ConnId,
    /// Sender side of the connection's outbound queue.
    pub tx: mpsc::Sender<Message>,
    close: Arc<Notify>,
}

impl ConnHandle {
    /// Create a handle around an outbound queue.
    #[must_use]
    pub fn new(id: ConnId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            close: Arc::new(Notify::new()),
        }
    }

    /// Ask the owning session to close its connection.
    ///
    /// The request is remembered if the session is not currently waiting.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// A registered connection as seen by the router.
#[derive(Clone, Debug)]
pub struct Member {
    /// Identity the connection bound on its first envelope.
    pub identity: ClientId,
    /// Handle for queueing messages to it.
    pub handle: ConnHandle,
}

#[derive(Debug)]
struct Entry {
    room: RoomName,
    handle: ConnHandle,
}

#[derive(Debug, Default)]
struct Tables {
    by_identity: HashMap<ClientId, Entry>,
    rooms: HashMap<RoomName, HashSet<ClientId>>,
}

impl Tables {
    fn detach(&mut self, room: &str, identity: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(identity);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

/// Identity → connection table, partitioned by room.
///
/// Every operation takes the lock for a single map update or snapshot and
/// never performs I/O while holding it.
#[derive(Debug, Default)]
pub struct Registry {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh connection id.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or overwrite the entry for `identity`, returning the handle it
    /// replaced, if any.
    pub fn register(
        &self,
        identity: ClientId,
        room: RoomName,
        handle: ConnHandle,
    ) -> Option<ConnHandle> {
        let mut tables = self.tables.lock();
        let previous = tables.by_identity.insert(
            identity.clone(),
            Entry {
                room: room.clone(),
                handle,
            },
        );
        if let Some(prev) = &previous {
            if prev.room != room {
                tables.detach(&prev.room, &identity);
            }
        }
        tables.rooms.entry(room).or_default().insert(identity);
        previous.map(|entry| entry.handle)
    }

    /// Remove the entry for `identity` only if it still belongs to connection `id`.
    ///
    /// Returns `true` if an entry was removed. Safe to call for identities
    /// that were never registered or have since been taken over.
    pub fn unregister(&self, identity: &str, id: ConnId) -> bool {
        let mut tables = self.tables.lock();
        match tables.by_identity.get(identity) {
            Some(entry) if entry.handle.id == id => {}
            _ => return false,
        }
        let Some(entry) = tables.by_identity.remove(identity) else {
            return false;
        };
        tables.detach(&entry.room, identity);
        true
    }

    /// Point-in-time snapshot of every member of `room`.
    ///
    /// Members may disappear between the snapshot and its use; sends to
    /// them fail on the closed queue.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<Member> {
        let tables = self.tables.lock();
        let Some(identities) = tables.rooms.get(room) else {
            return Vec::new();
        };
        identities
            .iter()
            .filter_map(|identity| {
                tables.by_identity.get(identity).map(|entry| Member {
                    identity: identity.clone(),
                    handle: entry.handle.clone(),
                })
            })
            .collect()
    }

    /// Look up the handle currently registered for `identity`.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<ConnHandle> {
        self.tables
            .lock()
            .by_identity
            .get(identity)
            .map(|entry| entry.handle.clone())
    }

    #[cfg(test)]
    fn room_of(&self, identity: &str) -> Option<RoomName> {
        self.tables
            .lock()
            .by_identity
            .get(identity)
            .map(|entry| entry.room.clone())
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().by_identity.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().by_identity.is_empty()
    }

    /// Number of rooms with at least one registered member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.tables.lock().rooms.len()
    }
}
