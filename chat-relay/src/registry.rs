//! Server-side table of accepted connections.
//!
//! The registry is owned by the relay loop and mutated only from it, so it
//! is a plain data structure with no interior locking. It is generic over the
//! connection handle so the bookkeeping can be exercised without sockets.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

pub type ClientId = u64;

#[derive(Debug)]
pub struct ClientRecord<C> {
    pub connection: C,
    pub display_name: Option<String>,
    outbound: VecDeque<Bytes>,
}

impl<C> ClientRecord<C> {
    fn new(connection: C) -> Self {
        Self {
            connection,
            display_name: None,
            outbound: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct Registry<C> {
    records: HashMap<ClientId, ClientRecord<C>>,
    next_id: ClientId,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 1,
        }
    }

    /// Adds a record with no name and an empty queue. Handles are never
    /// reused within one registry.
    pub fn register(&mut self, connection: C) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, ClientRecord::new(connection));
        id
    }

    /// Sets the display name, replacing any earlier one. Names need not be
    /// unique. Returns `false` if the handle is unknown.
    pub fn set_name(&mut self, id: ClientId, name: impl Into<String>) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.display_name = Some(name.into());
                true
            }
            None => false,
        }
    }

    pub fn display_name(&self, id: ClientId) -> Option<&str> {
        self.records.get(&id)?.display_name.as_deref()
    }

    pub fn connection(&self, id: ClientId) -> Option<&C> {
        self.records.get(&id).map(|record| &record.connection)
    }

    pub fn connection_mut(&mut self, id: ClientId) -> Option<&mut C> {
        self.records.get_mut(&id).map(|record| &mut record.connection)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn enqueue(&mut self, id: ClientId, bytes: Bytes) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.outbound.push_back(bytes);
                true
            }
            None => false,
        }
    }

    /// Appends `bytes` to every record's queue except `exclude`. Returns the
    /// number of queues that received it.
    pub fn broadcast_enqueue(&mut self, bytes: &Bytes, exclude: Option<ClientId>) -> usize {
        let mut delivered = 0;
        for (id, record) in &mut self.records {
            if Some(*id) == exclude {
                continue;
            }
            record.outbound.push_back(bytes.clone());
            delivered += 1;
        }
        delivered
    }

    pub fn dequeue_next(&mut self, id: ClientId) -> Option<Bytes> {
        self.records.get_mut(&id)?.outbound.pop_front()
    }

    /// Puts back the unwritten remainder of an entry so it goes out before
    /// anything queued after it.
    pub fn requeue_front(&mut self, id: ClientId, bytes: Bytes) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.outbound.push_front(bytes);
                true
            }
            None => false,
        }
    }

    /// Handles whose queue is not empty.
    pub fn pending(&self) -> Vec<ClientId> {
        self.records
            .iter()
            .filter(|(_, record)| !record.outbound.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Removes the record. A second removal of the same handle is a no-op
    /// and returns `None`.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord<C>> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
