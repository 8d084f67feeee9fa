//! Session registry: maps each session id to the provider currently serving it.
//!
//! At most one provider channel is registered per session. Registering a new
//! channel for a session evicts the old one: its pending requests fail with
//! [`TunnelError::ProviderReplaced`] and the old channel is closed.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::channel::ProviderChannel;
use crate::correlator::Correlator;
use crate::error::TunnelError;

/// Opaque session identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A session with a live provider: the provider's channel and the table of
/// requests pending on it.
///
/// Cloning a `Session` is cheap and yields a handle to the same session.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    channel: Arc<ProviderChannel>,
    correlator: Arc<Correlator>,
}

impl Session {
    fn new(id: SessionId, channel: Arc<ProviderChannel>) -> Self {
        let correlator = Arc::new(Correlator::new(id.clone()));
        Self {
            id,
            channel,
            correlator,
        }
    }

    /// The session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The provider channel serving this session.
    pub fn channel(&self) -> &Arc<ProviderChannel> {
        &self.channel
    }

    /// Requests pending on this session's channel.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }
}

/// Provider lifecycle events, as seen by renter observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A provider connected to a session which had none.
    ProviderConnected,

    /// A new provider connection superseded the previous one.
    ProviderReplaced,

    /// The session's provider went away.
    ProviderDisconnected,
}

/// Identifies a renter observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receives [`SessionEvent`]s for one session.
#[derive(Debug)]
pub struct RenterObserver {
    id: ObserverId,
    session: SessionId,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl RenterObserver {
    /// Identity of this registration, for [`SessionRegistry::unregister_renter_observer`].
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// The observed session.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Wait for the next event. Returns `None` once the observer is unregistered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

type Observers = Vec<(ObserverId, mpsc::UnboundedSender<SessionEvent>)>;

#[derive(Debug, Default)]
struct InnerRegistry {
    sessions: DashMap<SessionId, Session>,
    observers: DashMap<SessionId, Observers>,
    next_observer: AtomicU64,
}

/// Maintains the set of sessions with a live provider.
///
/// The registry is a sharded concurrent map, so operations on different sessions
/// do not wait on each other. Cloning yields a handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<InnerRegistry>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `channel` as the provider for `session`.
    ///
    /// Any channel already registered for the session is evicted: every request
    /// pending on it fails with [`TunnelError::ProviderReplaced`], then it is
    /// closed.
    pub fn register_provider(&self, session: SessionId, channel: Arc<ProviderChannel>) -> Session {
        let entry = Session::new(session.clone(), channel);
        let previous = self.inner.sessions.insert(session.clone(), entry.clone());

        match previous {
            Some(previous) => {
                let failed = previous.correlator.fail_all(TunnelError::ProviderReplaced);
                previous.channel.close();
                tracing::debug!(
                    %session,
                    old = %previous.channel.id(),
                    new = %entry.channel.id(),
                    failed,
                    "provider replaced"
                );
                self.notify(session.as_str(), SessionEvent::ProviderReplaced);
            }
            None => {
                tracing::debug!(%session, channel = %entry.channel.id(), "provider connected");
                self.notify(session.as_str(), SessionEvent::ProviderConnected);
            }
        }

        entry
    }

    /// The provider channel for `session`, if one is connected.
    pub fn lookup(&self, session: &str) -> Option<Arc<ProviderChannel>> {
        self.inner
            .sessions
            .get(session)
            .map(|entry| entry.channel.clone())
    }

    /// The live session for `session`, if a provider is connected.
    pub fn session(&self, session: &str) -> Option<Session> {
        self.inner.sessions.get(session).map(|entry| entry.clone())
    }

    /// Remove the provider for `session`, but only if `channel` is still the
    /// registered one.
    ///
    /// A channel which has already been replaced leaves the newer registration
    /// alone. Returns whether the session was removed.
    pub fn unregister_provider(&self, session: &str, channel: &Arc<ProviderChannel>) -> bool {
        let removed = self
            .inner
            .sessions
            .remove_if(session, |_, entry| Arc::ptr_eq(&entry.channel, channel));

        match removed {
            Some((session, _)) => {
                tracing::debug!(%session, channel = %channel.id(), "provider disconnected");
                self.notify(session.as_str(), SessionEvent::ProviderDisconnected);
                true
            }
            None => {
                tracing::trace!(%session, channel = %channel.id(), "stale provider, not unregistering");
                false
            }
        }
    }

    /// Close every registered provider channel.
    ///
    /// Each channel's dispatch task then tears the session down as usual.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.inner.sessions.iter() {
            if entry.channel.close() {
                closed += 1;
            }
        }
        closed
    }

    /// Ids of every session with a live provider.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of sessions with a live provider.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no provider is connected at all.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Watch provider lifecycle events for `session`.
    pub fn register_renter_observer(&self, session: impl Into<SessionId>) -> RenterObserver {
        let session = session.into();
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();

        self.inner
            .observers
            .entry(session.clone())
            .or_default()
            .push((id, tx));

        RenterObserver {
            id,
            session,
            events,
        }
    }

    /// Stop delivering events to an observer. Returns whether it was registered.
    pub fn unregister_renter_observer(&self, session: &str, observer: ObserverId) -> bool {
        let mut found = false;
        if let Some(mut observers) = self.inner.observers.get_mut(session) {
            let before = observers.len();
            observers.retain(|(id, _)| *id != observer);
            found = observers.len() != before;
        }
        self.inner
            .observers
            .remove_if(session, |_, observers| observers.is_empty());
        found
    }

    fn notify(&self, session: &str, event: SessionEvent) {
        if let Some(mut observers) = self.inner.observers.get_mut(session) {
            observers.retain(|(_, tx)| tx.send(event).is_ok());
        }
        self.inner
            .observers
            .remove_if(session, |_, observers| observers.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::transport;

    use static_assertions::assert_impl_all;

    assert_impl_all!(SessionRegistry: Send, Sync, Clone);
    assert_impl_all!(Session: Send, Sync);

    fn channel(session: &str) -> Arc<ProviderChannel> {
        let (broker, provider) = transport::duplex(1024);
        // The peer end is leaked on purpose so the transport stays open.
        std::mem::forget(provider);
        ProviderChannel::new(session.into(), broker).0
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup("s1").is_none());

        let ch = channel("s1");
        registry.register_provider("s1".into(), ch.clone());

        let found = registry.lookup("s1").unwrap();
        assert!(Arc::ptr_eq(&found, &ch));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sessions(), vec![SessionId::from("s1")]);
    }

    #[tokio::test]
    async fn replacement_fails_pending_and_closes_old_channel() {
        let registry = SessionRegistry::new();
        let old = channel("s1");
        let session = registry.register_provider("s1".into(), old.clone());

        let timeout = Duration::from_secs(30);
        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(session.correlator().begin(timeout).unwrap().1);
        }

        let new = channel("s1");
        registry.register_provider("s1".into(), new.clone());

        for response in pending {
            assert_eq!(response.await.unwrap_err(), TunnelError::ProviderReplaced);
        }
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(Arc::ptr_eq(&registry.lookup("s1").unwrap(), &new));
        assert!(session.correlator().is_empty());
        assert_eq!(
            session.correlator().begin(timeout).unwrap_err(),
            TunnelError::ProviderReplaced
        );
    }

    #[tokio::test]
    async fn stale_unregister_is_ignored() {
        let registry = SessionRegistry::new();
        let old = channel("s1");
        let new = channel("s1");
        registry.register_provider("s1".into(), old.clone());
        registry.register_provider("s1".into(), new.clone());

        assert!(!registry.unregister_provider("s1", &old));
        assert!(registry.lookup("s1").is_some());

        assert!(registry.unregister_provider("s1", &new));
        assert!(registry.lookup("s1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn observers_see_lifecycle() {
        let registry = SessionRegistry::new();
        let mut observer = registry.register_renter_observer("s1");
        let mut other = registry.register_renter_observer("s2");

        let first = channel("s1");
        registry.register_provider("s1".into(), first.clone());
        let second = channel("s1");
        registry.register_provider("s1".into(), second.clone());
        registry.unregister_provider("s1", &second);

        assert_eq!(
            observer.next_event().await,
            Some(SessionEvent::ProviderConnected)
        );
        assert_eq!(
            observer.next_event().await,
            Some(SessionEvent::ProviderReplaced)
        );
        assert_eq!(
            observer.next_event().await,
            Some(SessionEvent::ProviderDisconnected)
        );
        assert_eq!(other.try_next_event(), None);

        assert!(registry.unregister_renter_observer("s1", observer.id()));
        assert!(!registry.unregister_renter_observer("s1", observer.id()));
        assert_eq!(observer.next_event().await, None);
    }

    #[tokio::test]
    async fn dropped_observers_are_forgotten() {
        let registry = SessionRegistry::new();
        drop(registry.register_renter_observer("s1"));
        let mut kept = registry.register_renter_observer("s2");
        drop(registry.register_renter_observer("s2"));

        registry.register_provider("s1".into(), channel("s1"));
        registry.register_provider("s2".into(), channel("s2"));

        assert!(!registry.inner.observers.contains_key("s1"));
        assert_eq!(registry.inner.observers.get("s2").unwrap().len(), 1);
        assert_eq!(kept.try_next_event(), Some(SessionEvent::ProviderConnected));
    }

    #[tokio::test]
    async fn close_all_closes_every_channel() {
        let registry = SessionRegistry::new();
        let a = channel("a");
        let b = channel("b");
        registry.register_provider("a".into(), a.clone());
        registry.register_provider("b".into(), b.clone());

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
    }
}
