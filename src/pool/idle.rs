//! Resettable idle-teardown deadline
//!
//! The deadline lives in a `watch` channel as `Option<Instant>`:
//! - `Some(at)`: armed, the connection is torn down at `at` unless reset
//! - `None`: disarmed, some caller is using the connection
//!
//! `dispose()` arms the deadline, every other entry point disarms it. A single
//! reaper task per connection waits until it observes an armed deadline elapse
//! without any change in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct IdleTimer {
    deadline: watch::Sender<Option<Instant>>,
    reaper_started: AtomicBool,
}

impl IdleTimer {
    pub(crate) fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            deadline,
            reaper_started: AtomicBool::new(false),
        }
    }

    /// Cancel any pending teardown
    pub(crate) fn disarm(&self) {
        self.deadline.send_replace(None);
    }

    /// Arm (or push back) the deadline
    pub(crate) fn arm(&self, grace: Duration) {
        self.deadline.send_replace(Some(Instant::now() + grace));
    }

    /// Returns `true` for exactly one caller over the timer's lifetime: the one
    /// that must start the reaper.
    pub(crate) fn claim_reaper(&self) -> bool {
        !self.reaper_started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.deadline.subscribe()
    }
}

/// Wait until an armed deadline elapses without being reset
///
/// Returns `false` if the timer was dropped first.
pub(crate) async fn wait_for_silence(mut deadline: watch::Receiver<Option<Instant>>) -> bool {
    loop {
        let current = *deadline.borrow_and_update();

        match current {
            None => {
                if deadline.changed().await.is_err() {
                    return false;
                }
            }
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => return true,
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
        }
    }
}
