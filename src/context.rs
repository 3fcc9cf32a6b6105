//! Execution context: cancellation and deadlines, passed explicitly as the
//! first parameter to every phase and policy wrapper (spec §9, "Context
//! passing"). There is deliberately no thread-local fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cheaply cloneable handle threaded through a `Run`.
///
/// Cancellation and timeouts are tracked separately: cancelling a `Ctx`
/// (or any ancestor) is an *explicit* stop request that also stops every
/// child; a child's own deadline elapsing only stops that child — a
/// per-node Exec timeout must not cancel the rest of the Run (spec §5,
/// "Per-node timeout wraps only Exec").
#[derive(Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<std::time::Instant>,
    timed_out: Arc<AtomicBool>,
}

impl Ctx {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A child context: cancelling it does not cancel `self`, but
    /// cancelling `self` cancels it (and every other child).
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A child bounded additionally by `timeout`, used to wrap a single
    /// Exec attempt (spec §4.3 step 4). Its deadline elapsing marks only
    /// this child as timed out; it never cancels `self`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let new_deadline = std::time::Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < new_deadline => Some(existing),
            _ => Some(new_deadline),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True only for explicit (ancestor) cancellation, never for a local
    /// deadline elapsing.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once this context's own deadline has elapsed.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<std::time::Instant> {
        self.deadline
    }

    /// Resolves once the context is cancelled or its own deadline
    /// elapses, whichever comes first. Suspension points (store ops
    /// excluded per spec §5) should race this against their own work.
    async fn stopped(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        self.timed_out.store(true, Ordering::SeqCst);
                    }
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Races `fut` against cancellation/deadline. Returns `None` if the
    /// context stopped first; callers distinguish the reason with
    /// [`Ctx::is_cancelled`] / [`Ctx::is_timed_out`].
    pub async fn race<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.stopped() => None,
            out = fut => Some(out),
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

/// Sharable handle to a `Ctx` for APIs that want an owned reference.
pub type SharedCtx = Arc<Ctx>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_sets_timed_out_not_cancelled() {
        let ctx = Ctx::new();
        let child = ctx.child_with_timeout(Duration::from_millis(10));
        let out = child.race(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(out.is_none());
        assert!(child.is_timed_out());
        assert!(!child.is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn explicit_cancel_propagates_to_children() {
        let ctx = Ctx::new();
        let child = ctx.child();
        ctx.cancel();
        let out = child.race(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(out.is_none());
        assert!(child.is_cancelled());
        assert!(!child.is_timed_out());
    }
}
