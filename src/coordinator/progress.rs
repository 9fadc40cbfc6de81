//! Coalesced progress notifications.
//!
//! A long-running operation reports intermediate device statuses (a touch
//! is needed, the device is busy) to its caller. The same status is only
//! reported once in a row for the whole operation, no matter how many
//! devices or retries produce it.

use crate::token::StatusCode;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One intermediate status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub status: StatusCode,
    pub any_devices_found: bool,
}

/// Shared, de-duplicating progress sink for one operation.
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    inner: Arc<NotifierState>,
}

#[derive(Debug)]
struct NotifierState {
    tx: Option<mpsc::Sender<Progress>>,
    last: Mutex<Option<StatusCode>>,
    any_devices_found: AtomicBool,
}

impl ProgressNotifier {
    pub fn new(tx: mpsc::Sender<Progress>) -> Self {
        Self::with_sender(Some(tx))
    }

    /// A notifier nobody listens to. Device discovery is still tracked.
    pub fn disabled() -> Self {
        Self::with_sender(None)
    }

    fn with_sender(tx: Option<mpsc::Sender<Progress>>) -> Self {
        Self {
            inner: Arc::new(NotifierState {
                tx,
                last: Mutex::new(None),
                any_devices_found: AtomicBool::new(false),
            }),
        }
    }

    pub fn mark_devices_found(&self) {
        self.inner.any_devices_found.store(true, Ordering::SeqCst);
    }

    pub fn any_devices_found(&self) -> bool {
        self.inner.any_devices_found.load(Ordering::SeqCst)
    }

    /// Report `status` unless it equals the last reported status.
    /// Returns whether a notification was emitted.
    pub fn notify(&self, status: StatusCode) -> bool {
        {
            let mut last = self.inner.last.lock();
            if *last == Some(status) {
                return false;
            }
            *last = Some(status);
        }
        let progress = Progress {
            status,
            any_devices_found: self.any_devices_found(),
        };
        tracing::debug!(status = %status, "Progress");
        if let Some(tx) = &self.inner.tx {
            if let Err(e) = tx.try_send(progress) {
                tracing::debug!("Progress dropped: {e}");
            }
        }
        true
    }
}
