use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-side cancellation signal and optional deadline for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl DispatchContext {
    /// Never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves once the token fires or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Token handed to the backend; cancelling it never affects the caller's token.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_is_open() {
        let context = DispatchContext::background();
        assert!(!context.is_done());
        assert!(context.deadline().is_none());

        context.cancel();
        assert!(context.is_done());
        context.done().await;
    }

    #[tokio::test]
    async fn deadline_fires_without_cancel() {
        let context = DispatchContext::with_timeout(Duration::from_millis(10));
        assert!(!context.token().is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), context.done())
            .await
            .unwrap();
        assert!(context.is_done());
    }

    #[tokio::test]
    async fn tighter_deadline_wins() {
        let now = Instant::now();
        let context = DispatchContext::with_timeout(Duration::from_secs(60))
            .with_deadline(now + Duration::from_millis(5));

        assert_eq!(context.deadline(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn child_token_follows_parent() {
        let context = DispatchContext::background();
        let child = context.child_token();

        child.cancel();
        assert!(!context.is_done());

        let child = context.child_token();
        context.cancel();
        assert!(child.is_cancelled());
    }
}
