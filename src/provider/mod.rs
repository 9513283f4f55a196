//! Deferred query provider
//!
//! Queryables built on a [`DeferredQueryProvider`] never hold a backend
//! resource. Each terminal operation opens a fresh context through the
//! provider's [`ContextFactory`], binds the query to that context's native
//! source, delegates execution and releases the context before returning
//! (or, for enumerations, once the enumeration is finished with it).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::context::{ContextFactory, LeaseTracker, Leased, QueryContext};
use crate::enumeration::{LeasedRecordStream, LeasedRecords};
use crate::error::{ExecutionPhase, QueryError, Result};
use crate::expression::{Constant, Element, Entity, Expression, SourceRewriter};
use crate::queryable::Queryable;
use crate::record::decode_value;

pub mod registry;

pub use registry::{AnyQueryable, QueryableRegistry};

/// Executes expression trees on behalf of queryables
#[async_trait]
pub trait QueryProvider: Send + Sync + 'static {
    /// Identifier stamped into every placeholder this provider creates
    fn id(&self) -> Uuid;

    /// Constructors for untyped query creation
    fn registry(&self) -> &QueryableRegistry;

    /// Run a terminal expression (or materialize a sequence) synchronously
    fn execute(&self, expression: &Expression) -> Result<JsonValue>;

    /// Run a terminal expression asynchronously
    async fn execute_async(&self, expression: &Expression, cancel: &Cancellation) -> Result<JsonValue>;

    /// Start a lazy synchronous enumeration of a sequence expression
    fn enumerate(&self, expression: &Expression) -> Result<LeasedRecords>;

    /// Start a lazy asynchronous enumeration of a sequence expression
    async fn enumerate_async(&self, expression: &Expression, cancel: &Cancellation) -> Result<LeasedRecordStream>;
}

/// Wrap `expression` in a queryable of statically known element type
pub fn create_query<T: Element>(provider: &Arc<dyn QueryProvider>, expression: Expression) -> Queryable<T> {
    debug_assert!(
        expression.element_type().is_some_and(|element| element.id() == std::any::TypeId::of::<T>()),
        "expression element type does not match the requested queryable"
    );
    Queryable::from_parts(provider.clone(), expression)
}

/// Wrap `expression` in a queryable typed by its runtime element type
pub fn create_query_untyped(provider: &Arc<dyn QueryProvider>, expression: Expression) -> Result<Box<dyn AnyQueryable>> {
    provider.registry().construct(provider.clone(), expression)
}

/// Run a terminal expression and decode its result as `R`
pub fn execute_as<R: Element>(provider: &dyn QueryProvider, expression: &Expression) -> Result<R> {
    let value = provider.execute(expression)?;
    decode_value(value).map_err(|err| QueryError::execution(ExecutionPhase::Materialize, err))
}

/// Asynchronous counterpart of [`execute_as`]
pub async fn execute_as_async<R: Element>(
    provider: &dyn QueryProvider,
    expression: &Expression,
    cancel: &Cancellation,
) -> Result<R> {
    let value = provider.execute_async(expression, cancel).await?;
    decode_value(value).map_err(|err| QueryError::execution(ExecutionPhase::Materialize, err))
}

/// Provider opening one context per terminal operation from a factory
pub struct DeferredQueryProvider<F: ContextFactory> {
    id: Uuid,
    factory: F,
    registry: Arc<QueryableRegistry>,
    leases: LeaseTracker,
}

impl<F: ContextFactory> DeferredQueryProvider<F> {
    pub fn new(factory: F) -> Arc<Self> {
        Self::with_registry(factory, Arc::new(QueryableRegistry::new()))
    }

    /// Provider sharing an existing registry of element types
    pub fn with_registry(factory: F, registry: Arc<QueryableRegistry>) -> Arc<Self> {
        let id = Uuid::new_v4();
        debug!(provider = %id, backend = factory.backend(), "created deferred query provider");
        Arc::new(Self {
            id,
            factory,
            registry,
            leases: LeaseTracker::new(),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Acquire/release counters for every context this provider opened
    pub fn leases(&self) -> &LeaseTracker {
        &self.leases
    }

    pub fn shared_registry(&self) -> Arc<QueryableRegistry> {
        self.registry.clone()
    }

    /// Root queryable over the entity `E`, registering `E` for untyped construction
    pub fn queryable<E: Entity>(self: &Arc<Self>) -> Queryable<E> {
        self.registry.register::<E>();
        let provider: Arc<dyn QueryProvider> = self.clone();
        Queryable::root(provider)
    }

    fn acquire(&self) -> Result<Leased<F::Context>> {
        let context = self
            .factory
            .create()
            .map_err(|err| QueryError::execution(ExecutionPhase::Acquire, err))?;
        Ok(Leased::new(context, &self.leases, self.factory.backend()))
    }

    async fn acquire_async(&self, cancel: &Cancellation) -> Result<Leased<F::Context>> {
        let context = cancel
            .run(self.factory.create_async(cancel))
            .await
            .map_err(|err| QueryError::execution(ExecutionPhase::Acquire, err))?;
        Ok(Leased::new(context, &self.leases, self.factory.backend()))
    }

    /// Replace the placeholder with the context's native source
    fn bind(&self, context: &F::Context, expression: &Expression) -> Result<Expression> {
        let entity = match expression.root() {
            Constant::Placeholder(placeholder) if placeholder.provider_id == self.id => placeholder.entity,
            Constant::Placeholder(placeholder) => {
                return Err(QueryError::ForeignExpression {
                    expected: self.id,
                    found: placeholder.provider_id,
                });
            }
            Constant::Native(_) => return Err(QueryError::PlaceholderCount(0)),
        };
        let native = context.source(&entity)?;
        SourceRewriter::new(entity, native).rewrite(expression)
    }

    fn prepare(&self, leased: &Leased<F::Context>, expression: &Expression) -> Result<Expression> {
        self.bind(&leased.context, expression)
            .map_err(|err| QueryError::execution(ExecutionPhase::Rewrite, err))
    }

    fn require_sequence(expression: &Expression) -> Result<()> {
        if expression.is_sequence() {
            return Ok(());
        }
        Err(QueryError::execution(
            ExecutionPhase::Enumerate,
            QueryError::NotASequence(expression.to_string()),
        ))
    }
}

#[async_trait]
impl<F: ContextFactory> QueryProvider for DeferredQueryProvider<F> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn registry(&self) -> &QueryableRegistry {
        &self.registry
    }

    #[instrument(level = "debug", err, skip_all, fields(provider = %self.id, backend = self.factory.backend(), expression = %expression))]
    fn execute(&self, expression: &Expression) -> Result<JsonValue> {
        let mut leased = self.acquire()?;
        let bound = self.prepare(&leased, expression)?;
        let result = leased
            .context
            .execute(&bound)
            .map_err(|err| QueryError::execution(ExecutionPhase::Delegate, err));
        drop(leased);
        result
    }

    #[instrument(level = "debug", err, skip_all, fields(provider = %self.id, backend = self.factory.backend(), expression = %expression))]
    async fn execute_async(&self, expression: &Expression, cancel: &Cancellation) -> Result<JsonValue> {
        let mut leased = self.acquire_async(cancel).await?;
        let bound = self.prepare(&leased, expression)?;
        let result = cancel
            .run(leased.context.execute_async(&bound))
            .await
            .map_err(|err| QueryError::execution(ExecutionPhase::Delegate, err));
        drop(leased);
        result
    }

    #[instrument(level = "debug", err, skip_all, fields(provider = %self.id, backend = self.factory.backend(), expression = %expression))]
    fn enumerate(&self, expression: &Expression) -> Result<LeasedRecords> {
        Self::require_sequence(expression)?;
        let leased = self.acquire()?;
        let bound = self.prepare(&leased, expression)?;
        let (context, lease) = leased.into_parts();
        let records = context
            .into_records(bound)
            .map_err(|err| QueryError::execution(ExecutionPhase::Delegate, err))?;
        Ok(LeasedRecords::new(records, lease))
    }

    #[instrument(level = "debug", err, skip_all, fields(provider = %self.id, backend = self.factory.backend(), expression = %expression))]
    async fn enumerate_async(&self, expression: &Expression, cancel: &Cancellation) -> Result<LeasedRecordStream> {
        Self::require_sequence(expression)?;
        let leased = self.acquire_async(cancel).await?;
        let bound = self.prepare(&leased, expression)?;
        let (context, lease) = leased.into_parts();
        let stream = context
            .into_record_stream(bound)
            .map_err(|err| QueryError::execution(ExecutionPhase::Delegate, err))?;
        Ok(LeasedRecordStream::new(stream, lease))
    }
}

impl<F: ContextFactory> fmt::Debug for DeferredQueryProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueryProvider")
            .field("id", &self.id)
            .field("backend", &self.factory.backend())
            .field("registry", &self.registry)
            .field("leases", &self.leases)
            .finish()
    }
}
