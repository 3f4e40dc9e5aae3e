use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Cooperative abort flag shared between the CLI signal handler and the
/// process runner. Only the first reason is kept.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        if self
            .inner
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut guard) = self.inner.reason.lock() {
                *guard = Some(reason.into());
            }
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|guard| guard.clone())
    }

    /// Resolves once `abort` has been called; immediately if it already was.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_reason_wins() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        signal.abort("ctrl-c");
        signal.abort("second");
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().as_deref(), Some("ctrl-c"));
    }

    #[tokio::test]
    async fn waiters_wake_on_abort() {
        let signal = AbortSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.aborted().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.abort("test");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn already_aborted_resolves_immediately() {
        let signal = AbortSignal::new();
        signal.abort("early");
        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("should not block");
    }
}
