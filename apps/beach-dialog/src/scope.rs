use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

struct ScopeInner {
    generation: u64,
    cancelled: AtomicBool,
    notify: Notify,
}

/// Lifetime of one connected session. Work spawned for a session checks its
/// scope before applying a result; once cancelled, late results are dropped.
#[derive(Clone)]
pub struct SessionScope {
    inner: Arc<ScopeInner>,
}

impl SessionScope {
    pub fn new(generation: u64) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                generation,
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true the first time only.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_active() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScope")
            .field("generation", &self.generation())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters_once() {
        let scope = SessionScope::new(4);
        let waiter = tokio::spawn({
            let scope = scope.clone();
            async move { scope.cancelled().await }
        });
        tokio::task::yield_now().await;
        assert!(scope.cancel());
        assert!(!scope.cancel());
        waiter.await.unwrap();
        assert!(!scope.is_active());
        assert_eq!(scope.generation(), 4);
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_cancel() {
        let scope = SessionScope::new(1);
        scope.cancel();
        scope.cancelled().await;
    }
}
