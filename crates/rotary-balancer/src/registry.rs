//! Provider registry: bounded membership with subscriptions.
//!
//! The registry is the authoritative record of which providers exist. It
//! enforces two invariants (at most `max_providers` entries, at most one
//! provider per id) and publishes every membership change to subscribers.
//! A subscriber receives an atomic snapshot of the membership at subscribe
//! time plus every transition made after its subscription, in mutation
//! order; a change concurrent with `subscribe` lands in exactly one of the
//! two.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{join_all, BoxFuture};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rotary_core::{ProviderId, RegistryError, SharedProvider};

use crate::config::RegistryConfig;

/// A membership transition published to subscribers.
///
/// `Removed` carries the provider that was dropped so a subscriber can tear
/// down per-provider state without a second lookup.
#[derive(Clone)]
pub enum RegistryEvent {
    Added {
        id: ProviderId,
        provider: SharedProvider,
    },
    Removed {
        id: ProviderId,
        provider: SharedProvider,
    },
}

impl RegistryEvent {
    pub fn id(&self) -> &ProviderId {
        match self {
            RegistryEvent::Added { id, .. } | RegistryEvent::Removed { id, .. } => id,
        }
    }
}

impl fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEvent::Added { id, .. } => f.debug_tuple("Added").field(id).finish(),
            RegistryEvent::Removed { id, .. } => f.debug_tuple("Removed").field(id).finish(),
        }
    }
}

/// Subscriber callback. Invoked once per event; all subscribers for one
/// event run concurrently and the mutating call waits for the whole group.
///
/// Handlers must not call back into the registry: delivery happens while
/// the registry lock is held, so a reentrant call would deadlock.
pub type EventHandler = Arc<dyn Fn(RegistryEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    token: u64,
    handler: EventHandler,
}

struct RegistryInner {
    providers: HashMap<ProviderId, SharedProvider>,
    subscribers: Vec<Subscriber>,
    next_token: u64,
}

/// Bounded provider membership with snapshot-consistent subscriptions.
///
/// Mutations (`register`/`unregister`) are serialized on one lock, which
/// also guards the subscriber list; this is what makes per-subscriber
/// delivery FIFO in mutation order and makes the subscribe-time snapshot
/// atomic with the subscriber-list append.
///
/// The registry is a cheap-clone handle: clones share the same membership.
#[derive(Clone)]
pub struct ProviderRegistry {
    config: RegistryConfig,
    inner: Arc<Mutex<RegistryInner>>,
}

impl ProviderRegistry {
    /// Creates a registry that holds at most `config.max_providers`
    /// entries.
    ///
    /// # Panics
    /// Panics if `config.max_providers` is zero.
    pub fn new(config: RegistryConfig) -> Self {
        assert!(config.max_providers > 0, "max_providers must be positive");
        Self {
            config,
            inner: Arc::new(Mutex::new(RegistryInner {
                providers: HashMap::new(),
                subscribers: Vec::new(),
                next_token: 0,
            })),
        }
    }

    /// Registers a provider under `id`.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`] if the id is taken
    /// (the existing provider is never overwritten) and with
    /// [`RegistryError::CapacityExhausted`] when the registry is full. On
    /// success the `Added` event has been observed by every subscriber by
    /// the time this returns.
    pub async fn register(
        &self,
        id: ProviderId,
        provider: SharedProvider,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        if inner.providers.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if inner.providers.len() >= self.config.max_providers {
            return Err(RegistryError::CapacityExhausted(self.config.max_providers));
        }
        inner.providers.insert(id.clone(), provider.clone());
        debug!(provider = %id, total = inner.providers.len(), "provider registered");
        Self::deliver(&inner.subscribers, RegistryEvent::Added { id, provider }).await;
        Ok(())
    }

    /// Removes the provider registered under `id`.
    ///
    /// Returns `true` iff the id was present. On removal the `Removed`
    /// event, carrying the evicted provider, has been observed by every
    /// subscriber by the time this returns.
    pub async fn unregister(&self, id: &ProviderId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.providers.remove(id) {
            Some(provider) => {
                debug!(provider = %id, total = inner.providers.len(), "provider unregistered");
                Self::deliver(
                    &inner.subscribers,
                    RegistryEvent::Removed {
                        id: id.clone(),
                        provider,
                    },
                )
                .await;
                true
            }
            None => false,
        }
    }

    /// Subscribes `handler` to membership changes.
    ///
    /// The returned [`Subscription`] carries a snapshot of the membership
    /// captured atomically with the subscription itself: changes made
    /// before this call are in the snapshot, changes made after it are
    /// delivered as events, and nothing is in both or neither.
    pub async fn subscribe(&self, handler: EventHandler) -> Subscription {
        let mut inner = self.inner.lock().await;
        let token = inner.next_token;
        inner.next_token += 1;
        let snapshot = inner.providers.clone();
        inner.subscribers.push(Subscriber { token, handler });
        debug!(token, subscribers = inner.subscribers.len(), "subscriber added");
        Subscription {
            snapshot,
            token,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Fans one event out to every subscriber and waits for the group.
    ///
    /// Each handler runs as its own task so a panicking subscriber is
    /// isolated: the failure is logged and the remaining handlers still
    /// observe the event.
    async fn deliver(subscribers: &[Subscriber], event: RegistryEvent) {
        if subscribers.is_empty() {
            return;
        }
        let deliveries: Vec<_> = subscribers
            .iter()
            .map(|subscriber| tokio::spawn((subscriber.handler)(event.clone())))
            .collect();
        for outcome in join_all(deliveries).await {
            if let Err(err) = outcome {
                warn!(event = ?event, error = %err, "registry event handler failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.providers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.providers.is_empty()
    }

    pub async fn contains(&self, id: &ProviderId) -> bool {
        self.inner.lock().await.providers.contains_key(id)
    }

    pub async fn get(&self, id: &ProviderId) -> Option<SharedProvider> {
        self.inner.lock().await.providers.get(id).cloned()
    }

    pub async fn provider_ids(&self) -> Vec<ProviderId> {
        self.inner.lock().await.providers.keys().cloned().collect()
    }

    pub fn max_providers(&self) -> usize {
        self.config.max_providers
    }
}

/// Handle returned by [`ProviderRegistry::subscribe`]: the initial snapshot
/// plus the means to stop further deliveries.
pub struct Subscription {
    snapshot: HashMap<ProviderId, SharedProvider>,
    token: u64,
    inner: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    /// Membership as of the moment the subscription took effect.
    pub fn snapshot(&self) -> &HashMap<ProviderId, SharedProvider> {
        &self.snapshot
    }

    /// Stops event delivery to this subscriber. Events already in flight
    /// complete; nothing is delivered after this returns.
    pub async fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().await;
            inner.subscribers.retain(|s| s.token != self.token);
            debug!(token = self.token, subscribers = inner.subscribers.len(), "subscriber removed");
        }
    }
}
