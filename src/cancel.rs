//! Cooperative cancellation signal
//!
//! A [`Cancellation`] is cloned into every async entry point. Acquiring a
//! context, running a query and pulling the next row all race against it.

use std::{future::Future, sync::Arc};

use tokio::sync::watch;

use crate::error::{QueryError, Result};

/// Shared cancellation flag; all clones observe the same signal
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal every clone of this handle
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`Cancellation::cancel`] has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` unless cancellation fires first
    pub async fn run<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(QueryError::Cancelled),
            result = future => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_run_completes_without_cancel() {
        let cancel = Cancellation::new();
        let value = cancel.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_stops_pending_future_on_cancel() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = cancel.run(std::future::pending::<Result<()>>()).await;
        assert!(matches!(result, Err(QueryError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_short_circuits() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let result = cancel.run(async { Ok(1) }).await;
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }
}
