//! Blocking bridge for threads outside the engine.
//!
//! [`block_on`] drives a future on the calling thread, parking between polls.
//! It is how a non-I/O thread (a test's main thread, a worker, `main`) waits
//! for a [`JoinHandle`](super::JoinHandle) or a consumer future whose
//! progress is made by an engine running elsewhere.
//!
//! Never call it on an I/O thread for a future that needs that same loop:
//! the loop would be parked and the future could not make progress.

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

/// A mechanism for parking and unparking a thread.
#[derive(Debug, Default)]
struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    /// Parks the current thread until notified.
    fn park(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    /// Parks the current thread until notified or `timeout` elapses.
    fn park_timeout(&self, timeout: Duration) {
        let mut notified = self.notified.lock();
        if !*notified {
            let _ = self.condvar.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }

    /// Unparks the parked thread.
    fn unpark(&self) {
        *self.notified.lock() = true;
        self.condvar.notify_one();
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        self.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.unpark();
    }
}

/// Runs `future` to completion on the current thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let parker = Arc::new(Parker::default());
    let waker = Waker::from(Arc::clone(&parker));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        parker.park();
    }
}

/// Runs `future` on the current thread for at most `timeout`.
///
/// Returns `None` if the future did not complete in time; the future is
/// dropped in that case.
pub fn block_on_timeout<F: Future>(future: F, timeout: Duration) -> Option<F::Output> {
    let deadline = std::time::Instant::now() + timeout;
    let parker = Arc::new(Parker::default());
    let waker = Waker::from(Arc::clone(&parker));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Some(output);
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        parker.park_timeout(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::thread;

    struct WakeFromThread {
        started: bool,
        done: Arc<Mutex<bool>>,
    }

    impl Future for WakeFromThread {
        type Output = u32;

        fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
            if *self.done.lock() {
                return Poll::Ready(42);
            }
            if !self.started {
                self.started = true;
                let waker = cx.waker().clone();
                let done = Arc::clone(&self.done);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    *done.lock() = true;
                    waker.wake();
                });
            }
            Poll::Pending
        }
    }

    #[test]
    fn ready_future() {
        assert_eq!(block_on(async { 1 + 1 }), 2);
    }

    #[test]
    fn woken_from_other_thread() {
        let value = block_on(WakeFromThread {
            started: false,
            done: Arc::new(Mutex::new(false)),
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn timeout_expires() {
        assert_eq!(
            block_on_timeout(pending::<()>(), Duration::from_millis(5)),
            None
        );
    }
}
