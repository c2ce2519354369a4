//! Run cancellation registry.
//!
//! Every live run registers a cancel handle; the control API flips it
//! and the run's driver observes the flip at its next await point. The
//! flag makes the signal level-triggered, so a cancel issued before the
//! driver starts waiting is never lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct CancelHandle {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the handle is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Registry of cancel handles for in-flight runs. Cheap to clone.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CancelHandle>>>>,
}

impl CancelRegistry {
    pub fn register(&self, run_id: &str) -> Arc<CancelHandle> {
        let handle = Arc::new(CancelHandle::default());
        self.inner
            .lock()
            .expect("cancel registry lock poisoned")
            .insert(run_id.to_string(), handle.clone());
        handle
    }

    /// Signal a run to cancel. Returns false when the run is not live
    /// in this process.
    pub fn cancel(&self, run_id: &str) -> bool {
        let handle = self
            .inner
            .lock()
            .expect("cancel registry lock poisoned")
            .get(run_id)
            .cloned();
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, run_id: &str) {
        self.inner
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_before_wait_is_not_lost() {
        let handle = CancelHandle::default();
        handle.cancel();
        handle.cancelled().await;
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn registry_signals_registered_runs_only() {
        let registry = CancelRegistry::default();
        let handle = registry.register("run-1");
        assert!(registry.cancel("run-1"));
        assert!(handle.is_cancelled());
        assert!(!registry.cancel("run-2"));

        registry.remove("run-1");
        assert!(!registry.cancel("run-1"));
    }
}
