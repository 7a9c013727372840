//! Shared contract types for the rotary load balancer.
//!
//! This crate defines what the balancing engine in `rotary-balancer`
//! consumes and surfaces:
//!
//! - the [`Provider`] trait: an opaque backend exposing `serve` and
//!   `check`, always handled as a [`SharedProvider`] (`Arc<dyn Provider>`);
//! - [`ProviderId`]: the identity every registry and dispatch table is
//!   keyed by;
//! - the error taxonomy: [`RegistryError`] for registration outcomes,
//!   [`BalanceError`] for the request path, [`ProviderError`] for the
//!   failures a provider itself reports;
//! - [`StubProvider`]: the controllable in-process provider used by tests
//!   and demos.

pub mod error;
pub mod provider;
pub mod stub;

pub use error::{BalanceError, ProviderError, RegistryError};
pub use provider::{Provider, ProviderId, SharedProvider};
pub use stub::StubProvider;
