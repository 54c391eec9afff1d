use crate::metadata::Deadline;
use crate::status::Status;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Wakes suspended stream operations with a prearmed failure cause.
///
/// The first armed cause wins: a deadline firing during a user-initiated
/// cancel reports whichever was armed first. Child tokens observe the
/// parent's cancellation; cancelling a child leaves the parent untouched.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cause: Mutex<Option<Status>>,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self, cause: Status) -> bool {
        let armed = {
            let mut slot = self.cause.lock().expect("cancel cause lock");
            if slot.is_some() {
                false
            } else {
                *slot = Some(cause.clone());
                true
            }
        };
        if armed {
            self.notify.notify_waiters();
            let children = std::mem::take(&mut *self.children.lock().expect("cancel children lock"));
            for child in children {
                if let Some(child) = child.upgrade() {
                    child.cancel(cause.clone());
                }
            }
        }
        armed
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the token. Returns false if a cause was already armed; the
    /// original cause is kept.
    pub fn cancel(&self, cause: Status) -> bool {
        self.inner.cancel(cause)
    }

    pub fn cause(&self) -> Option<Status> {
        self.inner.cause.lock().expect("cancel cause lock").clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// Errors with the armed cause, for checking before a suspension.
    pub fn check(&self) -> Result<(), Status> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Resolves with the cause once the token is cancelled.
    pub async fn cancelled(&self) -> Status {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before the cause re-check so a concurrent cancel
            // cannot slip between them
            notified.as_mut().enable();
            if let Some(cause) = self.cause() {
                return cause;
            }
            notified.await;
        }
    }

    /// A token cancelled whenever `self` is. Used to nest a deadline scope
    /// inside a user-cancellable call.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let pre_armed = self.cause();
        match pre_armed {
            Some(cause) => {
                child.inner.cancel(cause);
            }
            None => {
                self.inner
                    .children
                    .lock()
                    .expect("cancel children lock")
                    .push(Arc::downgrade(&child.inner));
            }
        }
        child
    }
}

/// Arms a token with DEADLINE_EXCEEDED when the deadline passes. Dropping
/// the timer (stream completed in time) disarms it.
pub struct DeadlineTimer {
    handle: JoinHandle<()>,
}

impl DeadlineTimer {
    pub fn arm(token: &CancelToken, deadline: Deadline) -> Self {
        Self::arm_with(token, deadline, || {})
    }

    /// `on_fire` runs only if this timer is the first to arm the token.
    pub fn arm_with(
        token: &CancelToken,
        deadline: Deadline,
        on_fire: impl FnOnce() + Send + 'static,
    ) -> Self {
        let token = token.clone();
        let at = tokio::time::Instant::from_std(deadline.instant());
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if token.cancel(Status::deadline_exceeded("deadline exceeded")) {
                on_fire();
            }
        });
        Self { handle }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use std::time::Duration;

    #[tokio::test]
    async fn first_cause_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(Status::cancelled("user")));
        assert!(!token.cancel(Status::deadline_exceeded("late")));
        assert_eq!(token.cause().unwrap().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn wakes_suspended_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel(Status::cancelled("stop"));
        let cause = task.await.unwrap();
        assert_eq!(cause.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn pre_armed_cause_seen_before_suspension() {
        let token = CancelToken::new();
        token.cancel(Status::deadline_exceeded("already over"));
        assert_eq!(token.check().unwrap_err().code(), Code::DeadlineExceeded);
        assert_eq!(token.cancelled().await.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel(Status::cancelled("parent gone"));
        assert_eq!(child.cancelled().await.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel(Status::deadline_exceeded("inner deadline"));
        assert!(!parent.is_cancelled());
        assert_eq!(child.cause().unwrap().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn child_of_cancelled_parent_is_pre_armed() {
        let parent = CancelToken::new();
        parent.cancel(Status::cancelled("done"));
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_timer_fires() {
        let token = CancelToken::new();
        let _timer = DeadlineTimer::arm(
            &token,
            Deadline::from_timeout(Duration::from_millis(50)),
        );
        assert_eq!(token.cancelled().await.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timer_never_fires() {
        let token = CancelToken::new();
        let timer = DeadlineTimer::arm(
            &token,
            Deadline::from_timeout(Duration::from_millis(10)),
        );
        drop(timer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
    }
}
