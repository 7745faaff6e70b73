//! Per-call context: deadline, cancellation, tracing pass-through.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// The context a handler runs under.
///
/// Cancellation fans out through a token: canceling a context cancels
/// every child derived from it. The deadline is advisory and propagated
/// over the wire as a header; enforcement happens at suspension points.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    traceparent: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never canceled and never expires.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            traceparent: None,
        }
    }

    /// Derive a child context; canceling the parent cancels the child,
    /// not the other way around.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            traceparent: self.traceparent.clone(),
        }
    }

    /// Tie this context to an external cancellation source, e.g. the
    /// session a request arrived on.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;

        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });

        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_traceparent(mut self, traceparent: String) -> Self {
        self.traceparent = Some(traceparent);

        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn traceparent(&self) -> Option<&str> {
        self.traceparent.as_deref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is canceled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            None => self.cancel.cancelled().await,
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_children() {
        let parent = Context::background();
        let child = parent.child();

        parent.cancel();

        assert!(child.is_canceled());
        child.done().await;
    }

    #[tokio::test]
    async fn child_cancel_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();

        assert!(!parent.is_canceled());
    }

    #[test]
    fn deadlines_only_tighten() {
        let near = Instant::now() + Duration::from_secs(1);
        let far = Instant::now() + Duration::from_secs(60);

        let cx = Context::background().with_deadline(near).with_deadline(far);

        assert_eq!(cx.deadline(), Some(near));
    }
}
