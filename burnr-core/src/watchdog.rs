//! A single-deadline timer that fails an operation which stops making progress.
//!
//! Every participant of a watched operation calls [`Watchdog::bump`] at each
//! logical step. A monitor thread marks the watchdog expired once a full
//! timeout window passes without a bump; from then on every wait inside the
//! streams fails with [`StreamError::Timeout`], which tears the pass down.
//! Slow devices keep bumping and are left alone. Hung ones are not.
use crate::error::StreamError;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a blocked wait re-checks the watchdog.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct State {
    deadline: Instant,
    expired: bool,
    finished: bool,
}

struct Inner {
    timeout: Duration,
    state: Mutex<State>,
    wake: Condvar,
}

/// Handle to a running watchdog. Cloning shares the same deadline.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                state: Mutex::new(State {
                    deadline: Instant::now() + timeout,
                    expired: false,
                    finished: false,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes the deadline to now + timeout. Has no effect once expired.
    pub fn bump(&self) {
        let mut state = self.state();
        if !state.expired {
            state.deadline = Instant::now() + self.inner.timeout;
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.state().expired
    }

    /// Returns [`StreamError::Timeout`] if the deadline has passed.
    pub fn check(&self) -> Result<(), StreamError> {
        if self.is_expired() {
            Err(StreamError::Timeout(self.inner.timeout))
        } else {
            Ok(())
        }
    }

    fn monitor(&self) {
        let mut state = self.state();
        loop {
            if state.finished {
                return;
            }
            let now = Instant::now();
            if now >= state.deadline {
                state.expired = true;
                warn!(timeout = ?self.inner.timeout, "Watchdog expired: no progress within timeout");
                return;
            }
            let remaining = state.deadline - now;
            state = self
                .inner
                .wake
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn finish(&self) {
        self.state().finished = true;
        self.inner.wake.notify_all();
    }
}

/// Runs `op` under a watchdog with the given timeout.
///
/// `op` receives the watchdog so it can bump it and hand clones to the
/// streams it drives. The monitor thread is stopped before this returns.
pub fn timeout_watchdog<T, E, F>(timeout: Duration, op: F) -> Result<T, E>
where
    F: FnOnce(&Watchdog) -> Result<T, E>,
{
    let watchdog = Watchdog::new(timeout);
    debug!(?timeout, "Arming watchdog");
    thread::scope(|scope| {
        let monitor = watchdog.clone();
        scope.spawn(move || monitor.monitor());

        let result = op(&watchdog);
        watchdog.finish();
        result
    })
}

/// Blocks on `rx` until a value arrives, failing if the watchdog expires or
/// the sender goes away.
pub(crate) fn wait_for<T>(rx: &Receiver<T>, watchdog: Option<&Watchdog>) -> Result<T, StreamError> {
    let Some(watchdog) = watchdog else {
        return rx.recv().map_err(|_| StreamError::Closed);
    };
    loop {
        watchdog.check()?;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(StreamError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn bumping_keeps_the_operation_alive() {
        let result: Result<u32, StreamError> = timeout_watchdog(Duration::from_millis(100), |wd| {
            for _ in 0..10 {
                thread::sleep(Duration::from_millis(30));
                wd.bump();
                wd.check()?;
            }
            Ok(7)
        });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn expires_without_bumps() {
        let result: Result<(), StreamError> = timeout_watchdog(Duration::from_millis(50), |wd| {
            thread::sleep(Duration::from_millis(150));
            assert!(wd.is_expired());
            // Bumping after expiry does not revive it.
            wd.bump();
            wd.check()
        });
        assert!(matches!(result, Err(StreamError::Timeout(_))));
    }

    #[test]
    fn wait_for_fails_when_the_watchdog_fires() {
        let (_tx, rx) = mpsc::channel::<()>();
        let result: Result<(), StreamError> =
            timeout_watchdog(Duration::from_millis(50), |wd| wait_for(&rx, Some(wd)));
        assert!(matches!(result, Err(StreamError::Timeout(_))));
    }

    #[test]
    fn wait_for_reports_a_closed_channel() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        assert!(matches!(wait_for(&rx, None), Err(StreamError::Closed)));
    }
}
