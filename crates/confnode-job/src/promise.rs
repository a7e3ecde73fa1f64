//! Single-assignment value shared between the tasks of one job.

use crate::error::{JobError, Result};
use tokio::sync::watch;

/// Resolved at most once, by value or by error. Every waiter, early or late,
/// observes the same outcome.
#[derive(Debug)]
pub struct Promise<T> {
    slot: watch::Sender<Option<Result<T>>>,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Resolve with a value. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fail every current and future waiter. Returns false if already settled.
    pub fn fail(&self, err: JobError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.slot.subscribe();
        // The sender lives in `self`, so this only fails if it is dropped
        // mid-wait, which a borrow of `self` rules out.
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(JobError::Abandoned)),
            Err(_) => Err(JobError::Abandoned),
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_writer_wins() {
        let promise = Promise::new();
        assert!(promise.resolve(1));
        assert!(!promise.resolve(2));
        assert!(!promise.fail(JobError::Abandoned));
        assert_eq!(promise.wait().await, Ok(1));
        assert_eq!(promise.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn early_waiters_see_failure() {
        let promise = Arc::new(Promise::<u32>::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let promise = promise.clone();
                tokio::spawn(async move { promise.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        assert!(promise.fail(JobError::Abandoned));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(JobError::Abandoned));
        }
        // Late waiters too.
        assert_eq!(promise.wait().await, Err(JobError::Abandoned));
    }

    #[tokio::test]
    async fn unsettled_wait_is_pending() {
        let promise = Promise::<u8>::new();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), promise.wait())
                .await
                .is_err()
        );
    }
}
