//! The two-flag control mailbox.
//!
//! The tracker cooperates with one external producer process through exactly
//! two signals: "new scan data ready" and "shutdown requested", plus a small
//! request record naming the input and the operating mode. This mailbox is
//! the in-process representation of that contract; the transport behind it
//! (shared memory, a socket, the sim harness calling methods directly) is
//! not the engine's concern.
//!
//! Discipline on the tracker side: `poll()` never blocks, and the ready
//! flag is cleared only after a scan transition has fully committed —
//! never across a blocking operation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Operating mode requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Re-track an entire scan file from scratch (batch, no IPC)
    Retrack,
    /// Initialize the lineage store and track scan 0 only
    PrepareNew,
    /// Resume or initialize, then track all remaining scans
    PrepareAppend,
    /// Track just the newest scan (the steady-state incremental mode)
    TrackLast,
}

/// The request record accompanying a "data ready" signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Path to the current scan input
    pub input_path: PathBuf,
    /// Requested operating mode
    pub mode: OperatingMode,
    /// Whether the tracker should restart itself after a fatal error
    pub auto_restart: bool,
}

/// A signal observed by a `poll()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// New scan data is ready under the given request
    DataReady(ControlRequest),
    /// The producer asked the tracker to exit
    Shutdown,
}

struct MailboxInner {
    ready: AtomicBool,
    shutdown: AtomicBool,
    request: Mutex<Option<ControlRequest>>,
}

/// Two-flag mailbox shared between the producer side and the tracker side.
///
/// Clones share state; the producer holds one clone, the tracker the other.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                ready: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                request: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Posts a request and raises the ready flag.
    pub fn signal_ready(&self, request: ControlRequest) {
        {
            let mut slot = self.inner.request.lock().expect("mailbox poisoned");
            *slot = Some(request);
        }
        self.inner.ready.store(true, Ordering::Release);
    }

    /// Raises the shutdown flag.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Tracker side
    // ------------------------------------------------------------------

    /// Non-blocking check for a pending signal.
    ///
    /// Shutdown takes precedence over data-ready. Observing `DataReady`
    /// does NOT clear the flag: the tracker calls `clear_ready()` itself
    /// once the scan transition has fully committed.
    pub fn poll(&self) -> Option<Signal> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Some(Signal::Shutdown);
        }
        if self.inner.ready.load(Ordering::Acquire) {
            let slot = self.inner.request.lock().expect("mailbox poisoned");
            if let Some(request) = slot.as_ref() {
                return Some(Signal::DataReady(request.clone()));
            }
        }
        None
    }

    /// Lowers the ready flag. Call only after the durable write for the
    /// signalled scan has completed.
    pub fn clear_ready(&self) {
        self.inner.ready.store(false, Ordering::Release);
    }

    /// Has a shutdown been requested?
    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: OperatingMode) -> ControlRequest {
        ControlRequest {
            input_path: PathBuf::from("/data/scans.json"),
            mode,
            auto_restart: false,
        }
    }

    #[test]
    fn test_poll_empty_mailbox() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.poll(), None);
    }

    #[test]
    fn test_ready_persists_until_cleared() {
        let mailbox = Mailbox::new();
        let producer = mailbox.clone();

        producer.signal_ready(request(OperatingMode::TrackLast));

        // Two polls see the same signal: observing does not consume.
        assert!(matches!(mailbox.poll(), Some(Signal::DataReady(_))));
        assert!(matches!(mailbox.poll(), Some(Signal::DataReady(_))));

        mailbox.clear_ready();
        assert_eq!(mailbox.poll(), None);
    }

    #[test]
    fn test_shutdown_takes_precedence() {
        let mailbox = Mailbox::new();
        mailbox.signal_ready(request(OperatingMode::TrackLast));
        mailbox.request_shutdown();

        assert_eq!(mailbox.poll(), Some(Signal::Shutdown));
        assert!(mailbox.shutdown_requested());
    }
}
