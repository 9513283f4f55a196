//! Repository boundary over deferred queryables
//!
//! Repositories hand out root queryables and never hold a context themselves,
//! so a repository can be shared freely and outlive any number of operations.

use std::{fmt, marker::PhantomData, sync::Arc};

use async_trait::async_trait;

use crate::cancel::Cancellation;
use crate::context::ContextFactory;
use crate::error::Result;
use crate::expression::{Entity, Scalar};
use crate::provider::DeferredQueryProvider;
use crate::queryable::Queryable;

/// Query access to one entity type
#[async_trait]
pub trait QueryRepository<E: Entity>: Send + Sync {
    /// Root queryable over every stored `E`
    fn as_queryable(&self) -> Queryable<E>;

    /// Entities matching `predicate`, still deferred
    fn find(&self, predicate: Scalar) -> Queryable<E> {
        self.as_queryable().filter(predicate)
    }

    /// Count entities matching `predicate`
    fn count_where(&self, predicate: Scalar) -> Result<u64> {
        self.find(predicate).count()
    }

    /// Check if any entity matches `predicate`
    fn exists(&self, predicate: Scalar) -> Result<bool> {
        self.find(predicate).any()
    }

    /// List every entity
    async fn list(&self, cancel: &Cancellation) -> Result<Vec<E>> {
        self.as_queryable().to_list_async(cancel).await
    }

    /// Count entities matching `predicate` without blocking
    async fn count_where_async(&self, predicate: Scalar, cancel: &Cancellation) -> Result<u64> {
        self.find(predicate).count_async(cancel).await
    }
}

/// Factory-backed repository for the entity `E`
pub struct Repository<E, F: ContextFactory> {
    provider: Arc<DeferredQueryProvider<F>>,
    entity: PhantomData<fn() -> E>,
}

impl<E: Entity, F: ContextFactory> Repository<E, F> {
    pub fn new(provider: Arc<DeferredQueryProvider<F>>) -> Self {
        Self {
            provider,
            entity: PhantomData,
        }
    }

    pub fn provider(&self) -> &Arc<DeferredQueryProvider<F>> {
        &self.provider
    }
}

impl<E: Entity, F: ContextFactory> QueryRepository<E> for Repository<E, F> {
    fn as_queryable(&self) -> Queryable<E> {
        self.provider.queryable::<E>()
    }
}

impl<E, F: ContextFactory> Clone for Repository<E, F> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            entity: PhantomData,
        }
    }
}

impl<E, F: ContextFactory> fmt::Debug for Repository<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &std::any::type_name::<E>())
            .field("provider", &self.provider)
            .finish()
    }
}

/// Creates repositories that all share one provider
pub struct RepositoryFactory<F: ContextFactory> {
    provider: Arc<DeferredQueryProvider<F>>,
}

impl<F: ContextFactory> RepositoryFactory<F> {
    pub fn new(factory: F) -> Self {
        Self {
            provider: DeferredQueryProvider::new(factory),
        }
    }

    pub fn with_provider(provider: Arc<DeferredQueryProvider<F>>) -> Self {
        Self { provider }
    }

    /// Get the shared provider
    pub fn provider(&self) -> &Arc<DeferredQueryProvider<F>> {
        &self.provider
    }

    /// Create a repository for `E`
    pub fn repository<E: Entity>(&self) -> Repository<E, F> {
        Repository::new(self.provider.clone())
    }
}

impl<F: ContextFactory> Clone for RepositoryFactory<F> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
        }
    }
}
