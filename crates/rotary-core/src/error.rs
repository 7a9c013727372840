use thiserror::Error;

use crate::provider::ProviderId;

/// Failure reported by a provider's `serve` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Recoverable outcomes of a registration attempt.
///
/// These are returned values, not panics: callers are expected to react to
/// a full registry or a duplicate id and carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is already taken; the existing provider is left untouched.
    #[error("provider '{0}' is already registered")]
    AlreadyRegistered(ProviderId),

    /// The registry holds its configured maximum number of providers.
    #[error("registry is full ({0} providers)")]
    CapacityExhausted(usize),
}

/// Errors surfaced by the balancer's request path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    /// The eligible set is empty. Transient; retry with backoff.
    #[error("no providers available")]
    NoProvidersAvailable,

    /// The selected provider is at its concurrent-call limit. Transient;
    /// the balancer re-admits the provider once capacity returns.
    #[error("provider '{0}' is at its concurrent call limit")]
    CapacityLimit(ProviderId),

    /// The selected provider accepted the call and failed it.
    #[error("provider '{id}' failed: {source}")]
    ProviderFailure {
        id: ProviderId,
        #[source]
        source: ProviderError,
    },
}
