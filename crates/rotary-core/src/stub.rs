//! Stub provider for tests and demos.
//!
//! The balancer treats providers as opaque; this is the in-process stand-in
//! used throughout the test suites. It answers `serve` with its own name
//! after a configurable delay, and its health and failure behavior can be
//! flipped at runtime through shared atomics, so a test can keep a handle
//! to the stub after handing an `Arc<dyn Provider>` to the registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::Provider;

/// In-process provider with controllable delay, failure and health.
pub struct StubProvider {
    name: String,
    serve_delay: Duration,
    healthy: AtomicBool,
    failing: AtomicBool,
    probes: AtomicU64,
}

impl StubProvider {
    /// Creates a healthy stub that replies immediately.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_delay(name, Duration::ZERO)
    }

    /// Creates a healthy stub that replies after `serve_delay`.
    pub fn with_delay(name: impl Into<String>, serve_delay: Duration) -> Self {
        Self {
            name: name.into(),
            serve_delay,
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            probes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flips what subsequent `check` probes report.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// When failing, `serve` returns `ProviderError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `check` probes observed so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StubProvider {
    async fn serve(&self) -> Result<String, ProviderError> {
        if self.serve_delay > Duration::ZERO {
            tokio::time::sleep(self.serve_delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable(format!(
                "{} is refusing requests",
                self.name
            )));
        }
        Ok(self.name.clone())
    }

    async fn check(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}
