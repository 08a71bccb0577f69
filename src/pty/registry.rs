//! Process-wide PTY table and the global pause/resume flag.
//!
//! A `lazy_static`-backed singleton, generalized from "one shared client"
//! to "one shared, lock-protected table" of running PTY handles. Pause/
//! resume uses a `tokio::sync::watch` channel rather than a polled flag.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::watch;

/// A live PTY's externally-controllable surface, registered by `message_id`
/// so an out-of-band caller (not the stream consumer) can write, kill, or
/// request a pause without holding the stream itself.
#[derive(Clone)]
pub struct PtyControlHandle {
    pub message_id: String,
    write_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    kill_tx: tokio::sync::mpsc::Sender<()>,
}

impl PtyControlHandle {
    pub fn new(
        message_id: String,
        write_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
        kill_tx: tokio::sync::mpsc::Sender<()>,
    ) -> Self {
        Self {
            message_id,
            write_tx,
            kill_tx,
        }
    }

    /// Write raw bytes to the subprocess. A no-op (success, data dropped)
    /// if the PTY has already exited — writes to an exited PTY are
    /// specified as no-ops, not errors.
    pub async fn write(&self, data: &[u8]) {
        let _ = self.write_tx.send(data.to_vec()).await;
    }

    /// Request a hard kill (external kill always tries graceful exit
    /// first — this is the escape hatch for callers that already did).
    pub async fn kill(&self) {
        let _ = self.kill_tx.send(()).await;
    }
}

struct Table {
    entries: HashMap<String, PtyControlHandle>,
}

/// Shared registry. A single instance lives in [`GLOBAL`] for production
/// use; tests that need isolation construct their own with [`PtyRegistry::new`].
pub struct PtyRegistry {
    table: RwLock<Table>,
    pause_tx: watch::Sender<bool>,
}

impl PtyRegistry {
    pub fn new() -> Self {
        let (pause_tx, _rx) = watch::channel(false);
        Self {
            table: RwLock::new(Table {
                entries: HashMap::new(),
            }),
            pause_tx,
        }
    }

    pub fn register(&self, handle: PtyControlHandle) {
        self.table
            .write()
            .expect("pty registry lock poisoned")
            .entries
            .insert(handle.message_id.clone(), handle);
    }

    pub fn unregister(&self, message_id: &str) {
        self.table
            .write()
            .expect("pty registry lock poisoned")
            .entries
            .remove(message_id);
    }

    pub fn get(&self, message_id: &str) -> Option<PtyControlHandle> {
        self.table
            .read()
            .expect("pty registry lock poisoned")
            .entries
            .get(message_id)
            .cloned()
    }

    /// Subscribe a PTY engine instance to the global pause flag.
    pub fn subscribe_pause(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Idempotent: pausing an already-paused registry is a no-op.
    pub fn pause(&self) {
        if !*self.pause_tx.borrow() {
            let _ = self.pause_tx.send(true);
        }
    }

    pub fn resume(&self) {
        if *self.pause_tx.borrow() {
            let _ = self.pause_tx.send(false);
        }
    }
}

impl Default for PtyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref GLOBAL: PtyRegistry = PtyRegistry::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_pause_calls_are_idempotent() {
        let registry = PtyRegistry::new();
        let mut rx = registry.subscribe_pause();
        registry.pause();
        assert!(*rx.borrow_and_update());
        registry.pause();
        // No new value was sent on the second call; `has_changed` would be
        // false for a receiver that already observed `true`.
        assert!(registry.is_paused());
    }

    #[test]
    fn resume_without_prior_pause_is_a_noop() {
        let registry = PtyRegistry::new();
        registry.resume();
        assert!(!registry.is_paused());
    }
}
