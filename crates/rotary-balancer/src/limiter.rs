//! Per-provider call limiter.
//!
//! Admission control for one provider: up to `max_calls` concurrent calls
//! are admitted and spawned onto the runtime; anything beyond that is
//! rejected immediately, together with a signal that resolves as soon as
//! capacity returns. The balancer uses that signal to park the provider
//! and re-admit it instead of hammering a saturated backend.
//!
//! A slot is held by a [`CallPermit`] drop guard, so it is returned on
//! success, failure, panic and task abort alike.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome of [`CallLimiter::with_limit`].
pub enum Admission<T> {
    /// The call was admitted and is running; await the handle for its
    /// result. The caller owns the handle's lifetime.
    Admitted(JoinHandle<T>),
    /// The limiter is saturated. The signal resolves once any in-flight
    /// call completes.
    Rejected(ReleaseSignal),
}

/// Resolves when capacity returns to the limiter that issued it.
///
/// Signals are per saturation wave: every rejection during one wave gets
/// the same signal, and the wave is resolved by the first completion of
/// any admitted call. A limiter that goes away resolves its outstanding
/// signals too, so waiters never outlive their provider.
pub struct ReleaseSignal {
    rx: watch::Receiver<bool>,
}

impl ReleaseSignal {
    /// Waits until the wave resolves. Returns immediately if it already
    /// has.
    pub async fn released(mut self) {
        // A closed channel means the limiter is gone, which releases the
        // waiter just as well.
        let _ = self.rx.wait_for(|resolved| *resolved).await;
    }
}

struct LimiterState {
    in_flight: usize,
    saturated: bool,
    /// Signal for the current saturation wave; `true` once resolved.
    wave: watch::Sender<bool>,
}

struct LimiterInner {
    max_calls: usize,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    /// Returns one slot and resolves the current wave.
    fn release_one(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0, "release without matching admit");
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.saturated && state.in_flight < self.max_calls {
            state.saturated = false;
            debug!(in_flight = state.in_flight, "limiter capacity restored");
        }
        let _ = state.wave.send(true);
    }
}

/// Admission gate for a single provider.
///
/// Cheap to clone; clones share the same slots and saturation state.
#[derive(Clone)]
pub struct CallLimiter {
    inner: Arc<LimiterInner>,
}

impl CallLimiter {
    /// # Panics
    /// Panics if `max_calls` is zero.
    pub fn new(max_calls: usize) -> Self {
        assert!(max_calls > 0, "max_calls must be positive");
        let (wave, _) = watch::channel(false);
        Self {
            inner: Arc::new(LimiterInner {
                max_calls,
                state: Mutex::new(LimiterState {
                    in_flight: 0,
                    saturated: false,
                    wave,
                }),
            }),
        }
    }

    /// Admits `work` if a slot is free, spawning it onto the runtime, or
    /// rejects it with the current wave's release signal.
    pub fn with_limit<F>(&self, work: F) -> Admission<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.try_admit() {
            Ok(permit) => Admission::Admitted(tokio::spawn(async move {
                let _permit = permit;
                work.await
            })),
            Err(signal) => Admission::Rejected(signal),
        }
    }

    /// Takes one slot, or returns the signal to wait on. Linearizable on
    /// the state lock.
    fn try_admit(&self) -> Result<CallPermit, ReleaseSignal> {
        let mut state = self.inner.state.lock();
        if state.saturated {
            return Err(ReleaseSignal {
                rx: state.wave.subscribe(),
            });
        }
        state.in_flight += 1;
        if state.in_flight >= self.inner.max_calls {
            state.saturated = true;
            // A new wave begins: arm a fresh signal and resolve the
            // previous generation so no earlier waiter is left stranded.
            let (fresh, _) = watch::channel(false);
            let previous = std::mem::replace(&mut state.wave, fresh);
            let _ = previous.send(true);
            debug!(in_flight = state.in_flight, "limiter saturated");
        }
        Ok(CallPermit {
            limiter: Arc::clone(&self.inner),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn is_saturated(&self) -> bool {
        self.inner.state.lock().saturated
    }

    pub fn max_calls(&self) -> usize {
        self.inner.max_calls
    }
}

/// Drop guard for one admitted call's slot.
pub struct CallPermit {
    limiter: Arc<LimiterInner>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.limiter.release_one();
    }
}
