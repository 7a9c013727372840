//! Construction-time configuration.
//!
//! Everything here is a plain value handed to a constructor; there is no
//! file or environment surface. Defaults are deliberately conservative:
//! ten providers, ten concurrent calls each, probes every five seconds
//! with two clean rounds required for recovery.

use crate::heartbeat::HeartbeatConfig;

/// Registry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of providers the registry will hold.
    pub max_providers: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_providers: 10 }
    }
}

/// Which built-in selection strategy the balancer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Insertion-order rotation.
    RoundRobin,
    /// Uniform draws from a deterministic, seeded generator.
    Random { seed: u64 },
}

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: StrategyKind,
    pub heartbeat: HeartbeatConfig,
    /// Concurrent-call budget each provider's limiter enforces.
    pub max_calls_per_provider: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            heartbeat: HeartbeatConfig::default(),
            max_calls_per_provider: 10,
        }
    }
}
