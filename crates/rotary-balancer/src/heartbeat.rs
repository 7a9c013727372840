//! Heartbeat monitoring: raw probes debounced into Alive/Dead transitions.
//!
//! Each watched provider gets its own task that probes `check` on a fixed
//! interval, runs the boolean through a debounce policy, and reports only
//! the settled transitions. A flapping backend therefore costs one
//! transition per settled change, not one per probe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rotary_core::SharedProvider;

/// Settled health of a provider as reported by its debounce policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Alive,
    Dead,
}

/// State machine folding a stream of probe booleans into a settled status.
///
/// One policy instance exists per watch task and is never shared, so
/// implementations are plain mutable state.
pub trait DebouncePolicy: Send {
    fn observe(&mut self, healthy: bool) -> HealthStatus;
}

/// Builds a fresh policy for every watch task.
pub type DebounceFactory = Arc<dyn Fn() -> Box<dyn DebouncePolicy> + Send + Sync>;

/// Pessimistic-down, cautious-up debouncing.
///
/// A single failed probe flips the status to `Dead`; recovery requires
/// `required` consecutive successful probes, and any failure during the
/// recovery window resets the count.
pub struct AliveAfterRounds {
    required: u32,
    alive_rounds: u32,
    current: HealthStatus,
}

impl AliveAfterRounds {
    /// # Panics
    /// Panics if `required` is zero.
    pub fn new(required: u32) -> Self {
        assert!(required > 0, "recovery rounds must be positive");
        Self {
            required,
            alive_rounds: 0,
            current: HealthStatus::Alive,
        }
    }
}

impl DebouncePolicy for AliveAfterRounds {
    fn observe(&mut self, healthy: bool) -> HealthStatus {
        match (self.current, healthy) {
            (HealthStatus::Alive, true) => {}
            (HealthStatus::Alive, false) => {
                self.current = HealthStatus::Dead;
                self.alive_rounds = 0;
            }
            (HealthStatus::Dead, true) => {
                self.alive_rounds += 1;
                if self.alive_rounds >= self.required {
                    self.current = HealthStatus::Alive;
                }
            }
            (HealthStatus::Dead, false) => {
                self.alive_rounds = 0;
            }
        }
        self.current
    }
}

/// Convenience factory for the canonical policy.
pub fn alive_after_rounds(required: u32) -> DebounceFactory {
    Arc::new(move || Box::new(AliveAfterRounds::new(required)))
}

/// Callback invoked on each settled transition, in the watch task.
pub type TransitionHandler = Arc<dyn Fn(HealthStatus) -> BoxFuture<'static, ()> + Send + Sync>;

/// Heartbeat configuration.
#[derive(Clone)]
pub struct HeartbeatConfig {
    /// Pause between consecutive probes of one provider.
    pub interval: Duration,
    /// Debounce policy applied to each watched provider.
    pub policy: DebounceFactory,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            policy: alive_after_rounds(2),
        }
    }
}

impl fmt::Debug for HeartbeatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatConfig")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Spawns and parameterizes per-provider watch tasks.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    /// Starts watching `provider`, reporting settled transitions through
    /// `on_transition` until `token` is cancelled.
    ///
    /// The initial reported status is `Alive`, so a provider that starts
    /// healthy produces no transition at all. Cancellation interrupts a
    /// pending probe, a pending transition delivery, and the interval
    /// sleep alike; the task exits promptly in every case.
    pub fn watch(
        &self,
        provider: SharedProvider,
        on_transition: TransitionHandler,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = self.config.interval;
        let mut policy = (self.config.policy)();
        tokio::spawn(async move {
            let mut reported = HealthStatus::Alive;
            loop {
                let healthy = tokio::select! {
                    _ = token.cancelled() => break,
                    healthy = provider.check() => healthy,
                };
                let status = policy.observe(healthy);
                if status != reported {
                    debug!(?status, "heartbeat transition");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = on_transition(status) => reported = status,
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
