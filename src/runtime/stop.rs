//! Cooperative stop tokens.
//!
//! A [`StopSource`] owns the stop state; any number of [`StopToken`]s observe
//! it. Callbacks registered with [`StopToken::on_stop`] run exactly once, on
//! the thread that requests the stop, or immediately on the registering
//! thread if the stop was already requested. Dropping the returned
//! [`StopRegistration`] unregisters a callback that has not run yet.
//!
//! The engine uses a token both as the loop's stop condition and as the
//! cancellation checkpoint of [`Schedule`](super::ops::Schedule).

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StopState {
    stopped: AtomicBool,
    callbacks: Mutex<CallbackList>,
}

#[derive(Default)]
struct CallbackList {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Owner of a stop flag.
#[derive(Default)]
pub struct StopSource {
    state: Arc<StopState>,
}

impl StopSource {
    /// Creates a source with the stop not yet requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> StopToken {
        StopToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Requests a stop and runs the registered callbacks.
    ///
    /// Returns `true` if this call made the transition, `false` if the stop
    /// had already been requested.
    pub fn request_stop(&self) -> bool {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut self.state.callbacks.lock().entries);
        for (_, callback) in callbacks {
            callback();
        }
        true
    }

    /// Returns true once a stop has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stopped", &self.is_stop_requested())
            .finish()
    }
}

/// Observer of a [`StopSource`].
///
/// [`StopToken::never`] yields a token that can never be stopped.
#[derive(Clone, Default)]
pub struct StopToken {
    state: Option<Arc<StopState>>,
}

impl StopToken {
    /// Returns a token that is never stopped.
    #[must_use]
    pub const fn never() -> Self {
        Self { state: None }
    }

    /// Returns true once the owning source requested a stop.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.stopped.load(Ordering::Acquire))
    }

    /// Returns true if a stop can ever be observed through this token.
    #[must_use]
    pub fn stop_possible(&self) -> bool {
        self.state.is_some()
    }

    /// Registers `callback` to run when a stop is requested.
    ///
    /// If the stop was already requested the callback runs before this
    /// returns. The callback is dropped unrun if the registration is dropped
    /// first.
    pub fn on_stop<F>(&self, callback: F) -> StopRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return StopRegistration::empty();
        };

        let mut list = state.callbacks.lock();
        if state.stopped.load(Ordering::Acquire) {
            drop(list);
            callback();
            return StopRegistration::empty();
        }
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, Box::new(callback)));
        drop(list);

        StopRegistration {
            state: Some(Arc::clone(state)),
            id,
        }
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_possible", &self.stop_possible())
            .field("stopped", &self.is_stop_requested())
            .finish()
    }
}

/// Keeps a stop callback registered; unregisters it on drop.
#[must_use = "dropping the registration unregisters the callback"]
pub struct StopRegistration {
    state: Option<Arc<StopState>>,
    id: u64,
}

impl StopRegistration {
    const fn empty() -> Self {
        Self { state: None, id: 0 }
    }
}

impl Drop for StopRegistration {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let removed = {
                let mut list = state.callbacks.lock();
                list.entries
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|index| list.entries.swap_remove(index))
            };
            drop(removed);
        }
    }
}

impl fmt::Debug for StopRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopRegistration")
            .field("id", &self.id)
            .field("armed", &self.state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn request_stop_runs_callbacks_once() {
        let source = StopSource::new();
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));
        let _reg = {
            let hits = Arc::clone(&hits);
            token.on_stop(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(!token.is_stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop(), "second request is a no-op");
        assert!(token.is_stop_requested());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let source = StopSource::new();
        source.request_stop();
        let hits = Arc::new(AtomicUsize::new(0));
        let _reg = {
            let hits = Arc::clone(&hits);
            source.token().on_stop(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_does_not_run() {
        let source = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            let _reg = source.token().on_stop(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        source.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn never_token() {
        let token = StopToken::never();
        assert!(!token.stop_possible());
        assert!(!token.is_stop_requested());
        let _reg = token.on_stop(|| unreachable!("never token cannot stop"));
    }
}
