use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation flag shared between the Event Loop and whatever the
/// agent is doing. `Agent::run` receives one inside `ExecContext` and is
/// expected to check it at its own suspension points.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The execution context derived from the caller's context at dispatch
/// time: `deadline = min(caller deadline, options.max_run_duration)`, and
/// a cancel token that either inherits the caller's cancellation or is
/// detached from it (per `options.detached_cancel`).
#[derive(Clone)]
pub struct ExecContext {
    cancel: CancelToken,
    deadline: Option<chrono::DateTime<chrono::Utc>>,
}

impl ExecContext {
    pub fn new(cancel: CancelToken, deadline: Option<chrono::DateTime<chrono::Utc>>) -> Self {
        Self { cancel, deadline }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn deadline(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| chrono::Utc::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn exec_context_without_deadline_never_exceeded() {
        let ctx = ExecContext::new(CancelToken::new(), None);
        assert!(!ctx.deadline_exceeded());
    }

    #[test]
    fn exec_context_past_deadline_is_exceeded() {
        let past = chrono::Utc::now() - chrono::Duration::seconds(1);
        let ctx = ExecContext::new(CancelToken::new(), Some(past));
        assert!(ctx.deadline_exceeded());
    }
}
