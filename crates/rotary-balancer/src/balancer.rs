//! Dispatch core: the balancer that ties everything together.
//!
//! The balancer mirrors the registry's membership, watches every mirrored
//! provider with a heartbeat task, gates every provider behind its own call
//! limiter, and hands out one provider per `get` through a selection
//! strategy. The eligible set is read on the hot request path while three
//! background actors (registry events, heartbeat transitions, capacity
//! rejections) mutate it, so every mutation and every selection is
//! serialized on one dispatch lock.
//!
//! Eligibility is tracked as a per-provider reason set: a provider is
//! selectable iff it is mirrored and no exclusion reason is held against
//! it. The heartbeat and the limiter each own one reason, so one loop
//! re-admitting a provider can never mask the other loop's exclusion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rotary_core::{BalanceError, ProviderError, ProviderId, SharedProvider};

use crate::config::{BalancerConfig, StrategyKind};
use crate::heartbeat::{HealthStatus, HeartbeatMonitor, TransitionHandler};
use crate::limiter::{Admission, CallLimiter, ReleaseSignal};
use crate::registry::{EventHandler, ProviderRegistry, RegistryEvent, Subscription};
use crate::strategy::{Random, RoundRobin, SelectionStrategy};

/// Why a provider is currently withheld from selection.
///
/// Each feedback loop owns one flag: the heartbeat sets and clears
/// `unhealthy`, the capacity waiter sets and clears `at_capacity`. The
/// provider is selectable only when both are clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExclusionReasons {
    pub unhealthy: bool,
    pub at_capacity: bool,
}

impl ExclusionReasons {
    pub fn is_clear(&self) -> bool {
        !self.unhealthy && !self.at_capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Unhealthy,
    AtCapacity,
}

/// Point-in-time view of one mirrored provider, for introspection.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: ProviderId,
    pub reasons: ExclusionReasons,
    pub in_flight: usize,
    pub eligible: bool,
}

struct HeartbeatHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct ProviderEntry {
    provider: SharedProvider,
    reasons: ExclusionReasons,
    limiter: CallLimiter,
    heartbeat: HeartbeatHandle,
}

struct DispatchState {
    entries: HashMap<ProviderId, ProviderEntry>,
    strategy: Box<dyn SelectionStrategy>,
}

impl DispatchState {
    /// Withholds `id` for `reason`. Idempotent; a no-op for unmirrored ids.
    fn suspend(&mut self, id: &ProviderId, reason: Reason) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        let was_clear = entry.reasons.is_clear();
        match reason {
            Reason::Unhealthy => entry.reasons.unhealthy = true,
            Reason::AtCapacity => entry.reasons.at_capacity = true,
        }
        if was_clear {
            self.strategy.exclude(id);
            debug!(provider = %id, ?reason, "provider suspended");
        }
    }

    /// Clears `reason` for `id`, re-admitting it once no reason remains.
    /// Idempotent; a no-op for unmirrored ids.
    fn resume(&mut self, id: &ProviderId, reason: Reason) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        match reason {
            Reason::Unhealthy => entry.reasons.unhealthy = false,
            Reason::AtCapacity => entry.reasons.at_capacity = false,
        }
        if entry.reasons.is_clear() && self.strategy.include(id.clone()) {
            debug!(provider = %id, ?reason, "provider resumed");
        }
    }
}

/// Everything the background actors (event handlers, heartbeat tasks,
/// capacity waiters) need a shared handle to.
struct DispatchShared {
    state: Mutex<DispatchState>,
    monitor: HeartbeatMonitor,
    shutdown: CancellationToken,
    max_calls: usize,
}

impl DispatchShared {
    async fn admit(shared: &Arc<Self>, id: ProviderId, provider: SharedProvider) {
        let mut state = shared.state.lock().await;
        Self::admit_locked(shared, &mut state, id, provider);
    }

    /// Admission under an already-held dispatch lock: mirror the provider,
    /// make it selectable, start its heartbeat, install its limiter.
    /// Synchronous on purpose: nothing here may suspend while the lock is
    /// held.
    fn admit_locked(
        shared: &Arc<Self>,
        state: &mut DispatchState,
        id: ProviderId,
        provider: SharedProvider,
    ) {
        if state.entries.contains_key(&id) {
            debug!(provider = %id, "already admitted; ignoring");
            return;
        }

        let limiter = CallLimiter::new(shared.max_calls);
        let token = shared.shutdown.child_token();
        let handler = Self::transition_handler(shared, id.clone());
        let task = shared.monitor.watch(provider.clone(), handler, token.clone());

        state.entries.insert(
            id.clone(),
            ProviderEntry {
                provider,
                reasons: ExclusionReasons::default(),
                limiter,
                heartbeat: HeartbeatHandle { token, task },
            },
        );
        state.strategy.include(id.clone());
        info!(provider = %id, "provider admitted");
    }

    /// Removes a provider entirely: out of the strategy, heartbeat
    /// cancelled and joined, limiter dropped. The join is bounded because
    /// every await in the watch loop races its cancellation token, and it
    /// cannot need this lock for the same reason.
    async fn evict(&self, id: &ProviderId) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.remove(id) else {
            return;
        };
        state.strategy.exclude(id);
        entry.heartbeat.token.cancel();
        if let Err(err) = entry.heartbeat.task.await {
            if !err.is_cancelled() {
                warn!(provider = %id, error = %err, "heartbeat task failed during eviction");
            }
        }
        // Dropping the entry drops the limiter; in-flight admitted calls
        // run to completion on their own, and parked capacity waiters wake.
        info!(provider = %id, "provider evicted");
    }

    fn transition_handler(shared: &Arc<Self>, id: ProviderId) -> TransitionHandler {
        let shared = Arc::clone(shared);
        Arc::new(move |status| {
            let shared = Arc::clone(&shared);
            let id = id.clone();
            Box::pin(async move {
                let mut state = shared.state.lock().await;
                match status {
                    HealthStatus::Alive => {
                        info!(provider = %id, "provider passed its health checks again");
                        state.resume(&id, Reason::Unhealthy);
                    }
                    HealthStatus::Dead => {
                        warn!(provider = %id, "provider failed its health check");
                        state.suspend(&id, Reason::Unhealthy);
                    }
                }
            })
        })
    }

    /// Parks `id` until the limiter signals free capacity, then re-admits
    /// it. Runs under the root cancellation scope.
    fn spawn_capacity_waiter(shared: &Arc<Self>, id: ProviderId, signal: ReleaseSignal) {
        let token = shared.shutdown.clone();
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            {
                let mut state = shared.state.lock().await;
                state.suspend(&id, Reason::AtCapacity);
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = signal.released() => {}
            }
            let mut state = shared.state.lock().await;
            state.resume(&id, Reason::AtCapacity);
        });
    }
}

/// In-process load balancer over a registry's providers.
///
/// Construct with [`Balancer::new`], call [`Balancer::start`] to mirror the
/// registry, then dispatch with [`Balancer::get`]. A balancer is single
/// use: after [`Balancer::stop`] the behavior of `get` is unspecified and
/// the instance cannot be restarted.
pub struct Balancer {
    registry: ProviderRegistry,
    shared: Arc<DispatchShared>,
    subscription: Mutex<Option<Subscription>>,
    started: AtomicBool,
}

impl Balancer {
    /// Creates a balancer using one of the built-in strategies.
    pub fn new(registry: ProviderRegistry, config: BalancerConfig) -> Self {
        let strategy: Box<dyn SelectionStrategy> = match config.strategy {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
            StrategyKind::Random { seed } => Box::new(Random::new(seed)),
        };
        Self::with_strategy(registry, config, strategy)
    }

    /// Creates a balancer with a caller-supplied strategy.
    ///
    /// # Panics
    /// Panics if `config.max_calls_per_provider` is zero.
    pub fn with_strategy(
        registry: ProviderRegistry,
        config: BalancerConfig,
        strategy: Box<dyn SelectionStrategy>,
    ) -> Self {
        assert!(
            config.max_calls_per_provider > 0,
            "max_calls_per_provider must be positive"
        );
        Self {
            registry,
            shared: Arc::new(DispatchShared {
                state: Mutex::new(DispatchState {
                    entries: HashMap::new(),
                    strategy,
                }),
                monitor: HeartbeatMonitor::new(config.heartbeat),
                shutdown: CancellationToken::new(),
                max_calls: config.max_calls_per_provider,
            }),
            subscription: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribes to the registry and admits its current membership.
    ///
    /// Idempotent: a second call logs a warning and does nothing. The
    /// snapshot is admitted under one continuous dispatch lock, so a
    /// removal racing with startup is applied after the snapshot and wins.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("balancer already started; ignoring");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handler: EventHandler = Arc::new(move |event| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                match event {
                    RegistryEvent::Added { id, provider } => {
                        DispatchShared::admit(&shared, id, provider).await;
                    }
                    RegistryEvent::Removed { id, .. } => shared.evict(&id).await,
                }
            })
        });

        let subscription = self.registry.subscribe(handler).await;
        {
            let mut state = self.shared.state.lock().await;
            for (id, provider) in subscription.snapshot() {
                DispatchShared::admit_locked(&self.shared, &mut state, id.clone(), provider.clone());
            }
        }
        *self.subscription.lock().await = Some(subscription);
        let mirrored = self.shared.state.lock().await.entries.len();
        info!(providers = mirrored, "balancer started");
    }

    /// Stops mirroring and tears down every background task.
    ///
    /// Heartbeats are cancelled and joined and parked capacity waiters are
    /// released; admitted `serve` calls already in flight are not
    /// cancelled, since their callers own them.
    pub async fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.cancel().await;
        }
        self.shared.shutdown.cancel();

        let mut state = self.shared.state.lock().await;
        let ids: Vec<_> = state.entries.keys().cloned().collect();
        for id in &ids {
            state.strategy.exclude(id);
        }
        for (id, entry) in state.entries.drain() {
            entry.heartbeat.token.cancel();
            if let Err(err) = entry.heartbeat.task.await {
                if !err.is_cancelled() {
                    warn!(provider = %id, error = %err, "heartbeat task failed during shutdown");
                }
            }
        }
        info!("balancer stopped");
    }

    /// Dispatches one request: picks a provider, runs its `serve` through
    /// the provider's call limiter, and returns the reply.
    ///
    /// Selection and every eligible-set mutation share the dispatch lock,
    /// so a provider excluded by a concurrent transition cannot be picked,
    /// but the `serve` call itself runs outside the lock. A rejection parks
    /// the provider until its limiter signals free capacity and returns
    /// [`BalanceError::CapacityLimit`] immediately.
    pub async fn get(&self) -> Result<String, BalanceError> {
        let (id, provider, limiter) = {
            let mut state = self.shared.state.lock().await;
            let Some(id) = state.strategy.next() else {
                return Err(BalanceError::NoProvidersAvailable);
            };
            let entry = state
                .entries
                .get(&id)
                .expect("selected provider must be mirrored");
            (id, entry.provider.clone(), entry.limiter.clone())
        };

        match limiter.with_limit(async move { provider.serve().await }) {
            Admission::Admitted(call) => match call.await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(source)) => {
                    warn!(provider = %id, error = %source, "provider failed a request");
                    Err(BalanceError::ProviderFailure { id, source })
                }
                Err(join_err) if join_err.is_panic() => {
                    warn!(provider = %id, "serve task panicked");
                    Err(BalanceError::ProviderFailure {
                        id,
                        source: ProviderError::Other("serve task panicked".to_string()),
                    })
                }
                // Aborted only on runtime teardown; shutdown is not a
                // provider failure.
                Err(_) => Err(BalanceError::NoProvidersAvailable),
            },
            Admission::Rejected(signal) => {
                debug!(provider = %id, "provider at capacity; parking");
                DispatchShared::spawn_capacity_waiter(&self.shared, id.clone(), signal);
                Err(BalanceError::CapacityLimit(id))
            }
        }
    }

    /// Number of providers currently selectable.
    pub async fn eligible_count(&self) -> usize {
        self.shared.state.lock().await.strategy.len()
    }

    /// Dispatch-side view of every mirrored provider.
    pub async fn provider_states(&self) -> Vec<ProviderState> {
        let state = self.shared.state.lock().await;
        state
            .entries
            .iter()
            .map(|(id, entry)| ProviderState {
                id: id.clone(),
                reasons: entry.reasons,
                in_flight: entry.limiter.in_flight(),
                eligible: entry.reasons.is_clear(),
            })
            .collect()
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        // Without this, an unstopped balancer would leave heartbeat tasks
        // holding the shared state alive forever.
        self.shared.shutdown.cancel();
    }
}
