//! Lazy enumeration with resource-scoped release
//!
//! Both enumerators acquire their context on the first pull, keep it open
//! while rows are consumed and release it as soon as the sequence ends,
//! fails, is cancelled, or the enumerator is dropped. The synchronous side
//! relies on ownership alone. The asynchronous side also exposes an explicit
//! [`AsyncEnumerator::dispose`] so callers can release deterministically
//! without waiting for a drop.

use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{
    Stream, StreamExt,
    future::BoxFuture,
};

use tracing::debug;

use crate::cancel::Cancellation;
use crate::context::{Lease, RecordIter, RecordStream};
use crate::error::{ExecutionPhase, QueryError, Result};
use crate::expression::{Element, Expression};
use crate::provider::QueryProvider;
use crate::record::{Record, decode};

/// A native record iterator paired with the lease of the context behind it
pub struct LeasedRecords {
    // Declared before `lease`: the records (and their context) drop first
    records: RecordIter,
    lease: Lease,
}

impl LeasedRecords {
    pub fn new(records: RecordIter, lease: Lease) -> Self {
        Self { records, lease }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl Iterator for LeasedRecords {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

/// A native record stream paired with the lease of the context behind it
pub struct LeasedRecordStream {
    stream: RecordStream,
    lease: Lease,
}

impl LeasedRecordStream {
    pub fn new(stream: RecordStream, lease: Lease) -> Self {
        Self { stream, lease }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Close the native stream, then release the lease
    pub fn release(self) {
        let Self { stream, lease } = self;
        drop(stream);
        drop(lease);
    }
}

impl Stream for LeasedRecordStream {
    type Item = Result<Record>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

enum EnumeratorState {
    Pending {
        provider: Arc<dyn QueryProvider>,
        expression: Expression,
    },
    Active(LeasedRecords),
    Finished,
}

/// Synchronous lazy sequence over a queryable
pub struct Enumerator<T> {
    state: EnumeratorState,
    element: PhantomData<fn() -> T>,
}

impl<T: Element> Enumerator<T> {
    pub(crate) fn new(provider: Arc<dyn QueryProvider>, expression: Expression) -> Self {
        Self {
            state: EnumeratorState::Pending { provider, expression },
            element: PhantomData,
        }
    }

    /// Whether a context is currently held
    pub fn is_active(&self) -> bool {
        matches!(self.state, EnumeratorState::Active(_))
    }

    /// Release the context now instead of on drop
    pub fn close(&mut self) {
        self.state = EnumeratorState::Finished;
    }

    fn start(&mut self) -> Result<()> {
        if let EnumeratorState::Pending { provider, expression } = &self.state {
            match provider.enumerate(expression) {
                Ok(records) => self.state = EnumeratorState::Active(records),
                Err(err) => {
                    self.state = EnumeratorState::Finished;
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl<T: Element> Iterator for Enumerator<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.start() {
            return Some(Err(err));
        }
        let EnumeratorState::Active(records) = &mut self.state else {
            return None;
        };

        let item = match records.next() {
            Some(Ok(record)) => decode::<T>(record).map_err(|err| QueryError::execution(ExecutionPhase::Materialize, err)),
            Some(Err(err)) => Err(QueryError::execution(ExecutionPhase::Enumerate, err)),
            None => {
                self.close();
                return None;
            }
        };
        if let Err(err) = &item {
            debug!(operation_id = %records.lease().operation_id(), error = %err, "enumeration failed");
            self.close();
        }
        Some(item)
    }
}

impl<T> fmt::Debug for Enumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            EnumeratorState::Pending { .. } => "pending",
            EnumeratorState::Active(_) => "active",
            EnumeratorState::Finished => "finished",
        };
        f.debug_struct("Enumerator").field("state", &state).finish()
    }
}

/// Asynchronous lazy sequence over a queryable
///
/// Each call to [`AsyncEnumerable::enumerator`] starts an independent
/// enumeration with its own context.
pub struct AsyncEnumerable<T> {
    provider: Arc<dyn QueryProvider>,
    expression: Expression,
    cancel: Cancellation,
    element: PhantomData<fn() -> T>,
}

impl<T: Element> AsyncEnumerable<T> {
    pub(crate) fn new(provider: Arc<dyn QueryProvider>, expression: Expression, cancel: Cancellation) -> Self {
        Self {
            provider,
            expression,
            cancel,
            element: PhantomData,
        }
    }

    pub fn enumerator(&self) -> AsyncEnumerator<T> {
        AsyncEnumerator::new(self.provider.clone(), self.expression.clone(), self.cancel.clone())
    }

    /// Enumerate to the end and collect every element
    pub async fn to_list(&self) -> Result<Vec<T>> {
        let mut enumerator = self.enumerator();
        let mut items = Vec::new();
        while let Some(item) = enumerator.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

enum AsyncState {
    Pending {
        provider: Arc<dyn QueryProvider>,
        expression: Expression,
    },
    Acquiring(BoxFuture<'static, Result<LeasedRecordStream>>),
    Active(LeasedRecordStream),
    Disposed,
}

/// Adapter pairing a native record stream with the context that feeds it
///
/// Yields decoded elements. The context is released exactly once: on
/// exhaustion, on the first error, on cancellation, on [`dispose`] or on
/// drop, whichever comes first.
///
/// [`dispose`]: AsyncEnumerator::dispose
pub struct AsyncEnumerator<T> {
    state: AsyncState,
    cancel: Cancellation,
    cancelled: BoxFuture<'static, ()>,
    element: PhantomData<fn() -> T>,
}

impl<T: Element> AsyncEnumerator<T> {
    fn new(provider: Arc<dyn QueryProvider>, expression: Expression, cancel: Cancellation) -> Self {
        let signal = cancel.clone();
        Self {
            state: AsyncState::Pending { provider, expression },
            cancel,
            cancelled: Box::pin(async move { signal.cancelled().await }),
            element: PhantomData,
        }
    }

    /// Advance to the next element; `Ok(None)` once the sequence is exhausted
    pub async fn move_next(&mut self) -> Result<Option<T>> {
        self.next().await.transpose()
    }

    /// Whether a context is currently held
    pub fn is_active(&self) -> bool {
        matches!(self.state, AsyncState::Active(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, AsyncState::Disposed)
    }
}

impl<T> AsyncEnumerator<T> {
    /// Close the native stream, then release its context
    ///
    /// Safe to call at any point and any number of times.
    pub fn dispose(&mut self) {
        match std::mem::replace(&mut self.state, AsyncState::Disposed) {
            AsyncState::Active(stream) => stream.release(),
            // Dropping an in-flight acquisition abandons it before a lease exists
            AsyncState::Acquiring(acquisition) => drop(acquisition),
            AsyncState::Pending { .. } | AsyncState::Disposed => {}
        }
    }
}

impl<T: Element> Stream for AsyncEnumerator<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.is_disposed() {
                return Poll::Ready(None);
            }
            if this.cancelled.as_mut().poll(cx).is_ready() {
                this.dispose();
                return Poll::Ready(Some(Err(QueryError::execution(
                    ExecutionPhase::Enumerate,
                    QueryError::Cancelled,
                ))));
            }

            match &mut this.state {
                AsyncState::Pending { provider, expression } => {
                    let provider = provider.clone();
                    let expression = expression.clone();
                    let cancel = this.cancel.clone();
                    this.state = AsyncState::Acquiring(Box::pin(async move {
                        provider.enumerate_async(&expression, &cancel).await
                    }));
                }
                AsyncState::Acquiring(acquisition) => match acquisition.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(stream)) => this.state = AsyncState::Active(stream),
                    Poll::Ready(Err(err)) => {
                        this.dispose();
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                AsyncState::Active(stream) => {
                    let item = match stream.poll_next_unpin(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Some(Ok(record))) => decode::<T>(record)
                            .map_err(|err| QueryError::execution(ExecutionPhase::Materialize, err)),
                        Poll::Ready(Some(Err(err))) => Err(QueryError::execution(ExecutionPhase::Enumerate, err)),
                        Poll::Ready(None) => {
                            this.dispose();
                            return Poll::Ready(None);
                        }
                    };
                    if let Err(err) = &item {
                        debug!(operation_id = %stream.lease().operation_id(), error = %err, "enumeration failed");
                        this.dispose();
                    }
                    return Poll::Ready(Some(item));
                }
                AsyncState::Disposed => return Poll::Ready(None),
            }
        }
    }
}

impl<T> Drop for AsyncEnumerator<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for AsyncEnumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            AsyncState::Pending { .. } => "pending",
            AsyncState::Acquiring(_) => "acquiring",
            AsyncState::Active(_) => "active",
            AsyncState::Disposed => "disposed",
        };
        f.debug_struct("AsyncEnumerator").field("state", &state).finish()
    }
}
