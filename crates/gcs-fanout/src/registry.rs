use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Serialized snapshot, shared by every subscriber of one broadcast.
pub type Payload = Arc<str>;

/// Token handed out by [`Registry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Push side of one viewer connection. The connection task owns the
/// receiver; once it is gone every push fails.
#[derive(Debug, Clone)]
pub struct Subscriber {
    tx: mpsc::Sender<Payload>,
}

impl Subscriber {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Payload> {
        &self.tx
    }

    fn same_channel(&self, other: &Subscriber) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Set of live subscribers. Written by connection tasks, read by broadcast.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    members: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a handle to an already registered channel returns the
    /// existing id.
    pub fn register(&self, sub: Subscriber) -> SubscriberId {
        let mut members = self.lock();
        if let Some((id, _)) = members.iter().find(|(_, s)| s.same_channel(&sub)) {
            return *id;
        }
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        members.insert(id, sub);
        id
    }

    /// Returns whether `id` was a member.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Copy of the current membership; the registry may change while the
    /// caller iterates it.
    pub fn current_subscribers(&self) -> Vec<(SubscriberId, Subscriber)> {
        self.lock().iter().map(|(id, s)| (*id, s.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
