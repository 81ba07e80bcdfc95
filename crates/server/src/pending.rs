//! Ephemeral acceptance decisions for incoming transfer requests.
//!
//! `prepare-upload` suspends its HTTP response on one of these until the
//! user decides or the window elapses. Each entry resolves exactly once:
//! the oneshot sender is removed from the table before it fires, so a
//! concurrent second resolution finds nothing and is a no-op.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

pub struct PendingAcceptances {
    inner: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl Default for PendingAcceptances {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingAcceptances {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, session_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert(session_id.to_string(), tx);
        rx
    }

    /// Resolves the pending decision. Returns false when nothing was pending
    /// (already resolved, timed out, or never registered).
    pub fn resolve(&self, session_id: &str, accepted: bool) -> bool {
        let sender = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.remove(session_id)
        };
        match sender {
            Some(sender) => sender.send(accepted).is_ok(),
            None => false,
        }
    }

    /// Drops the entry without resolving; the waiter observes a closed
    /// channel, which counts as a rejection.
    pub fn forget(&self, session_id: &str) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.contains_key(session_id)
    }

    /// Awaits the user's decision. Timeout and a dropped resolver are both
    /// rejections; the table entry is cleared either way.
    pub async fn await_decision(
        &self,
        session_id: &str,
        rx: oneshot::Receiver<bool>,
        timeout_ms: u64,
    ) -> bool {
        let decision = tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await;
        let accepted = matches!(decision, Ok(Ok(true)));
        if !accepted {
            self.forget(session_id);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_should_deliver_decision_once() {
        let pending = PendingAcceptances::new();
        let rx = pending.register("session-1");

        assert!(pending.resolve("session-1", true));
        // second resolution finds nothing
        assert!(!pending.resolve("session-1", false));

        let accepted = pending.await_decision("session-1", rx, 1_000).await;
        assert!(accepted);
    }

    #[tokio::test]
    async fn await_decision_should_reject_on_timeout() {
        let pending = PendingAcceptances::new();
        let rx = pending.register("session-2");

        let accepted = pending.await_decision("session-2", rx, 20).await;
        assert!(!accepted);
        assert!(!pending.contains("session-2"));
        // resolving after the window is a no-op
        assert!(!pending.resolve("session-2", true));
    }

    #[tokio::test]
    async fn forget_should_read_as_rejection() {
        let pending = PendingAcceptances::new();
        let rx = pending.register("session-3");
        pending.forget("session-3");

        let accepted = pending.await_decision("session-3", rx, 1_000).await;
        assert!(!accepted);
    }
}
