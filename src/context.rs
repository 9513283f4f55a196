//! Ephemeral query contexts and their factories
//!
//! A [`QueryContext`] is the short-lived resource a backend opens for one
//! terminal operation: a database connection, a snapshot of a document store.
//! It also acts as the native query engine for that operation. Contexts are
//! produced by a [`ContextFactory`] and wrapped in a [`Leased`] value by the
//! provider, which ties each one to a [`Lease`] on the provider's
//! [`LeaseTracker`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::error::Result;
use crate::expression::{EntityDescriptor, Expression};
use crate::record::Record;

/// Lazily produced records, synchronous flavor
pub type RecordIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Lazily produced records, asynchronous flavor
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// A native query engine bound to one opened resource
///
/// Every method receives an expression whose placeholder has already been
/// replaced with the expression returned by [`QueryContext::source`].
#[async_trait]
pub trait QueryContext: Send + 'static {
    /// Identifier of this context instance
    fn id(&self) -> Uuid;

    /// The native source expression for `entity` within this context
    fn source(&self, entity: &EntityDescriptor) -> Result<Expression>;

    /// Run an expression to completion
    ///
    /// Sequence expressions produce an array of records; terminal operators
    /// produce their scalar.
    fn execute(&mut self, expression: &Expression) -> Result<JsonValue>;

    /// Asynchronous counterpart of [`QueryContext::execute`]
    async fn execute_async(&mut self, expression: &Expression) -> Result<JsonValue>;

    /// Consume the context into a lazy record iterator over `expression`
    ///
    /// The iterator owns the context; the resource is closed when it drops.
    fn into_records(self, expression: Expression) -> Result<RecordIter>
    where
        Self: Sized;

    /// Consume the context into a lazy record stream over `expression`
    fn into_record_stream(self, expression: Expression) -> Result<RecordStream>
    where
        Self: Sized;
}

/// Opens a fresh [`QueryContext`] per terminal operation
#[async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    type Context: QueryContext;

    /// Name of the backend, for logs
    fn backend(&self) -> &'static str;

    /// Open a context synchronously
    fn create(&self) -> Result<Self::Context>;

    /// Open a context asynchronously, giving up when `cancel` fires
    async fn create_async(&self, cancel: &Cancellation) -> Result<Self::Context>;
}

#[derive(Debug, Default)]
struct LeaseCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Counts context acquisitions and releases for one provider
#[derive(Debug, Clone, Default)]
pub struct LeaseTracker {
    counters: Arc<LeaseCounters>,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition and hand out the lease that will record its release
    pub fn acquire(&self, backend: &'static str, context_id: Uuid) -> Lease {
        let operation_id = Uuid::new_v4();
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(%operation_id, %context_id, backend, "acquired query context");
        Lease {
            counters: self.counters.clone(),
            operation_id,
            context_id,
            backend,
        }
    }

    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Contexts acquired and not yet released
    pub fn active(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Proof of one open context; dropping it records the release
#[derive(Debug)]
pub struct Lease {
    counters: Arc<LeaseCounters>,
    operation_id: Uuid,
    context_id: Uuid,
    backend: &'static str,
}

impl Lease {
    /// Identifier of the terminal operation holding this lease
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!(
            operation_id = %self.operation_id,
            context_id = %self.context_id,
            backend = self.backend,
            "released query context"
        );
    }
}

/// A context paired with its lease
///
/// Fields drop in declaration order: the context closes before the lease
/// records the release.
pub struct Leased<C> {
    pub context: C,
    pub lease: Lease,
}

impl<C: QueryContext> Leased<C> {
    pub fn new(context: C, tracker: &LeaseTracker, backend: &'static str) -> Self {
        let lease = tracker.acquire(backend, context.id());
        Self { context, lease }
    }

    pub fn into_parts(self) -> (C, Lease) {
        (self.context, self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_release_is_recorded_on_drop() {
        let tracker = LeaseTracker::new();
        let lease = tracker.acquire("memory", Uuid::new_v4());
        assert_eq!((tracker.acquired(), tracker.released(), tracker.active()), (1, 0, 1));

        drop(lease);
        assert_eq!((tracker.acquired(), tracker.released(), tracker.active()), (1, 1, 0));
    }

    #[test]
    fn test_clones_share_counters() {
        let tracker = LeaseTracker::new();
        let clone = tracker.clone();
        let _a = tracker.acquire("memory", Uuid::new_v4());
        let _b = clone.acquire("memory", Uuid::new_v4());
        assert_eq!(tracker.active(), 2);
    }
}
