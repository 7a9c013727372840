use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Opaque identifier of a provider, unique within one registry.
///
/// Ids are immutable for the provider's lifetime and are the identity used
/// by every table in the balancer; the provider value itself carries no
/// identity of its own. Cloning is cheap (shared string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    /// Creates an id from anything string-like.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A backend endpoint the balancer can dispatch to.
///
/// Both operations are suspending: `serve` may stall for as long as the
/// backend needs, and `check` is a single-shot liveness probe. A probe that
/// cannot reach the backend reports `false` rather than failing; the
/// debounce machinery upstream only understands booleans.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Handles one request, returning the provider's identifier string.
    async fn serve(&self) -> Result<String, ProviderError>;

    /// Probes the backend once and reports whether it is alive.
    async fn check(&self) -> bool;
}

/// Shared handle to a provider, as stored in the registry and the balancer.
pub type SharedProvider = Arc<dyn Provider>;
