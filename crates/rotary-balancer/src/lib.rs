//! rotary balancer
//!
//! In-process load balancing over a dynamically changing set of backend
//! providers. The crate is built from four cooperating pieces:
//!
//! 1. **Registry** ([`ProviderRegistry`]): bounded membership with
//!    add/remove, and subscriptions that pair an atomic snapshot with the
//!    subsequent event stream.
//! 2. **Strategies** ([`RoundRobin`], [`Random`]): pluggable policies that
//!    pick the next provider from the mutable eligible set.
//! 3. **Feedback loops**: a per-provider heartbeat
//!    ([`HeartbeatMonitor`]) that debounces raw probes into Alive/Dead
//!    transitions, and a per-provider call limiter ([`CallLimiter`]) that
//!    rejects calls beyond a concurrency budget and signals when capacity
//!    returns.
//! 4. **Dispatch core** ([`Balancer`]): mirrors the registry, applies both
//!    feedback loops to the eligible set, and hands out one provider per
//!    [`Balancer::get`].
//!
//! # Eligibility model
//!
//! A provider is selectable iff it is present in the registry mirror and no
//! exclusion reason is held against it. The heartbeat and the limiter each
//! own one reason, so the two loops cannot undo each other's exclusions;
//! registry removal deletes the provider outright.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rotary_balancer::{Balancer, BalancerConfig, ProviderRegistry, RegistryConfig};
//! use rotary_core::StubProvider;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ProviderRegistry::new(RegistryConfig::default());
//! registry.register("a".into(), Arc::new(StubProvider::new("a"))).await?;
//!
//! let balancer = Balancer::new(registry.clone(), BalancerConfig::default());
//! balancer.start().await;
//!
//! let reply = balancer.get().await?;
//! assert_eq!(reply, "a");
//!
//! balancer.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod heartbeat;
pub mod limiter;
pub mod registry;
pub mod strategy;

pub use balancer::{Balancer, ExclusionReasons, ProviderState};
pub use config::{BalancerConfig, RegistryConfig, StrategyKind};
pub use heartbeat::{
    alive_after_rounds, AliveAfterRounds, DebounceFactory, DebouncePolicy, HealthStatus,
    HeartbeatConfig, HeartbeatMonitor, TransitionHandler,
};
pub use limiter::{Admission, CallLimiter, CallPermit, ReleaseSignal};
pub use registry::{EventHandler, ProviderRegistry, RegistryEvent, Subscription};
pub use strategy::{Random, RoundRobin, SelectionStrategy};
