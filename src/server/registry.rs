//! Registry of live sessions
//!
//! The registry is the only shared mutable state in the server. It is owned by
//! the [`Server`](super::Server) and handed to every task as a
//! [`SharedRegistry`]; every read or write happens with its mutex held.
//!
//! Lock discipline: never enqueue into the dispatcher while holding the lock.
//! The dispatcher takes the same lock to deliver, so a producer blocked on a
//! full queue with the lock held would stall the only consumer.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::NameError;
use crate::protocol;

pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Identifies one accepted connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connected client that completed the handshake.
///
/// The session owns the sending side of the connection's outbound queue.
/// Dropping it closes the queue and cancels its hangup token, which tells the
/// connection handler to shut the stream down.
pub struct Session {
    id: ConnId,
    name: String,
    tx: mpsc::Sender<Arc<str>>,
    hangup: CancellationToken,
}

impl Session {
    pub fn new(id: ConnId, name: impl Into<String>, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
            tx,
            hangup: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a line for this session without waiting.
    ///
    /// Fails when the outbound buffer is full (stalled peer) or the writer has
    /// gone away.
    pub fn deliver(&self, line: Arc<str>) -> Result<(), TrySendError<Arc<str>>> {
        self.tx.try_send(line)
    }

    /// Cancelled once this session leaves the registry.
    pub fn hangup(&self) -> CancellationToken {
        self.hangup.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hangup.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Live sessions keyed by connection, plus the names they hold.
///
/// `names` is always exactly the set of names of the sessions in `sessions`.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<ConnId, Session>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Reserve a display name. Returns `false` if it is already held.
    pub fn reserve(&mut self, name: &str) -> bool {
        if self.names.contains(name) {
            return false;
        }
        self.names.insert(name.to_string())
    }

    /// Add a session whose name has already been reserved.
    pub fn insert(&mut self, session: Session) {
        self.insert_entry(session);
    }

    fn insert_entry(&mut self, session: Session) -> &Session {
        debug_assert!(self.names.contains(session.name()));
        match self.sessions.entry(session.id()) {
            Entry::Vacant(slot) => slot.insert(session),
            Entry::Occupied(mut slot) => {
                let old = slot.insert(session);
                // names are unique, so only the replacement could share it
                if old.name != slot.get().name {
                    self.names.remove(&old.name);
                }
                slot.into_mut()
            }
        }
    }

    /// Validate, reserve and insert in one step.
    ///
    /// Call with the lock held for the whole operation so two handshakes can't
    /// both claim the same name. The name is stored trimmed.
    pub fn register(
        &mut self,
        id: ConnId,
        requested: &str,
        tx: &mpsc::Sender<Arc<str>>,
    ) -> Result<&Session, NameError> {
        let name = protocol::validate_name(requested)?;
        if !self.reserve(name) {
            return Err(NameError::Taken);
        }
        Ok(self.insert_entry(Session::new(id, name, tx.clone())))
    }

    /// Remove a session and free its name. Removing twice is a no-op.
    pub fn remove(&mut self, id: ConnId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.names.remove(session.name());
        Some(session)
    }

    /// Current display names, sorted.
    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    /// Visit every live session once.
    pub fn for_each_session<F>(&self, mut visit: F)
    where
        F: FnMut(&Session),
    {
        for session in self.sessions.values() {
            visit(session);
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Reserved names, sorted. Matches [`snapshot_names`](Self::snapshot_names)
    /// whenever no caller is between `reserve` and `insert`.
    pub fn reserved_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Arc<str>>, mpsc::Receiver<Arc<str>>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let mut registry = Registry::new();

        assert!(registry.reserve("alice"));
        assert!(!registry.reserve("alice"));
        assert!(registry.reserve("bob"));
    }

    #[test]
    fn test_register_and_remove() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();

        let session = registry.register(ConnId(1), "  alice \n", &tx).unwrap();
        assert_eq!(session.name(), "alice");
        assert_eq!(session.id(), ConnId(1));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_reserved("alice"));
        assert_eq!(registry.get(ConnId(1)).map(Session::name), Some("alice"));

        let removed = registry.remove(ConnId(1)).unwrap();
        assert_eq!(removed.name(), "alice");
        assert!(registry.is_empty());
        assert!(!registry.is_reserved("alice"));
    }

    #[test]
    fn test_register_rejects_taken_and_invalid() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();

        registry.register(ConnId(1), "sam", &tx).unwrap();

        assert_eq!(registry.register(ConnId(2), "sam", &tx).unwrap_err(), NameError::Taken);
        assert_eq!(registry.register(ConnId(2), "s", &tx).unwrap_err(), NameError::TooShort);
        assert_eq!(
            registry.register(ConnId(2), "s,m", &tx).unwrap_err(),
            NameError::Separator
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reserved_names(), vec!["sam"]);
    }

    #[test]
    fn test_insert_over_same_conn_releases_old_name() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(ConnId(1), "alice", &tx).unwrap();

        assert!(registry.reserve("alicia"));
        registry.insert(Session::new(ConnId(1), "alicia", tx.clone()));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot_names(), vec!["alicia"]);
        assert_eq!(registry.reserved_names(), vec!["alicia"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(ConnId(1), "alice", &tx).unwrap();
        registry.register(ConnId(2), "bob", &tx).unwrap();

        assert!(registry.remove(ConnId(1)).is_some());
        assert!(registry.remove(ConnId(1)).is_none());
        assert!(registry.remove(ConnId(99)).is_none());

        assert_eq!(registry.snapshot_names(), vec!["bob"]);
        assert_eq!(registry.reserved_names(), vec!["bob"]);
    }

    #[test]
    fn test_name_reusable_after_remove() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();

        registry.register(ConnId(1), "alice", &tx).unwrap();
        registry.remove(ConnId(1));

        assert!(registry.register(ConnId(2), "alice", &tx).is_ok());
    }

    #[test]
    fn test_snapshot_names_sorted() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();
        for (i, name) in ["carol", "alice", "bob"].iter().enumerate() {
            registry.register(ConnId(i as u64), name, &tx).unwrap();
        }

        assert_eq!(registry.snapshot_names(), vec!["alice", "bob", "carol"]);
        assert_eq!(registry.snapshot_names(), registry.reserved_names());
    }

    #[test]
    fn test_for_each_session_visits_all() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(ConnId(1), "alice", &tx).unwrap();
        registry.register(ConnId(2), "bob", &tx).unwrap();

        let mut seen = Vec::new();
        registry.for_each_session(|s| seen.push(s.id()));
        seen.sort();

        assert_eq!(seen, vec![ConnId(1), ConnId(2)]);
    }

    #[test]
    fn test_remove_cancels_hangup() {
        let mut registry = Registry::new();
        let (tx, _rx) = channel();
        let hangup = registry.register(ConnId(1), "alice", &tx).unwrap().hangup();

        assert!(!hangup.is_cancelled());
        drop(registry.remove(ConnId(1)));
        assert!(hangup.is_cancelled());
    }

    #[test]
    fn test_deliver_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let session = Session::new(ConnId(1), "alice", tx);

        assert!(session.deliver(Arc::from("one")).is_ok());
        assert!(matches!(
            session.deliver(Arc::from("two")),
            Err(TrySendError::Full(_))
        ));

        drop(rx);
        assert!(matches!(
            session.deliver(Arc::from("three")),
            Err(TrySendError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_register_same_name() {
        let registry = Registry::shared();
        let (tx, _rx) = channel();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                registry.lock().await.register(ConnId(i), "sam", &tx).is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let registry = registry.lock().await;
        assert_eq!(registry.snapshot_names(), registry.reserved_names());
    }
}
