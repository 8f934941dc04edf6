//! Cross-thread reactor wakeup

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Registry, Token, Waker};
use tracing::warn;

/// Token the trigger is registered under in the reactor.
pub const TRIGGER_TOKEN: Token = Token(usize::MAX);

/// Wakes the reactor from another thread.
///
/// Worker threads call [`pull`](Trigger::pull) after appending output so the
/// reactor does not wait out its full poll timeout before draining. A pull is
/// idempotent while one is already pending; the reactor clears the pending
/// state when the wake token is dispatched.
pub struct Trigger {
    waker: Waker,
    pending: AtomicBool,
}

impl Trigger {
    /// Registers a new trigger with the reactor's registry.
    pub(crate) fn new(registry: &Registry) -> io::Result<Trigger> {
        Ok(Trigger {
            waker: Waker::new(registry, TRIGGER_TOKEN)?,
            pending: AtomicBool::new(false),
        })
    }

    /// Makes the next reactor poll iteration return promptly.
    ///
    /// Safe to call from any thread. If the wake fails the reactor still
    /// runs within its poll timeout, so the failure is only logged.
    pub fn pull(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.waker.wake() {
            warn!(target: "tjener.trigger", error = %err, "wake failed; falling back to poll timeout");
        }
    }

    /// Marks the pending pull consumed. Called on the reactor thread when the
    /// wake token is dispatched.
    pub(crate) fn drain(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}
