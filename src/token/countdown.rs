//! Operation deadlines.
//!
//! One deadline is created per logical operation and handed to every
//! signer and device task spawned for it as a read-only [`Countdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Read-only view of an operation deadline.
pub trait Countdown: Send + Sync {
    /// Whether the deadline has passed.
    fn expired(&self) -> bool;

    /// Time left before expiry; zero once expired.
    fn remaining(&self) -> Duration;
}

/// Deadline measured on the tokio clock.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

impl Countdown for Deadline {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Countdown that expires only when told to. Used by callers that own
/// their own notion of time (and by tests).
#[derive(Debug, Default)]
pub struct ManualCountdown {
    expired: AtomicBool,
}

impl ManualCountdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }
}

impl Countdown for ManualCountdown {
    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn remaining(&self) -> Duration {
        if self.expired() {
            Duration::ZERO
        } else {
            // Far enough out that idle waits are woken by other events first.
            Duration::from_secs(24 * 60 * 60)
        }
    }
}
