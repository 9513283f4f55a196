//! Deferred-execution query provider
//!
//! Queryables compose an immutable expression tree rooted at a placeholder
//! for their data source. Every terminal operation opens a short-lived
//! context from a [`ContextFactory`], swaps the placeholder for that
//! context's native source, runs the query on the native engine and releases
//! the context. Lazy enumerations keep their context exactly as long as the
//! enumeration is alive.
//!
//! ```no_run
//! use deferred_query::{DeferredQueryProvider, DocumentStore, Entity, MemoryContextFactory, field};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     id: i64,
//!     total: f64,
//! }
//!
//! impl Entity for Order {
//!     const SOURCE: &'static str = "orders";
//! }
//!
//! # fn main() -> deferred_query::Result<()> {
//! let store = DocumentStore::new();
//! store.insert(&Order { id: 1, total: 250.0 })?;
//!
//! let provider = DeferredQueryProvider::new(MemoryContextFactory::new(store));
//! let large = provider
//!     .queryable::<Order>()
//!     .filter(field("total").gt(100))
//!     .order_by_descending(field("id"))
//!     .to_list()?;
//! assert_eq!(large.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod context;
pub mod enumeration;
pub mod error;
pub mod expression;
pub mod logging;
pub mod provider;
pub mod queryable;
pub mod record;
pub mod repository;

#[cfg(test)]
mod tests;

pub use backend::memory::{DocumentStore, MemoryContext, MemoryContextFactory};
pub use backend::sqlite::{SqliteContext, SqliteContextFactory};
pub use cancel::Cancellation;
pub use config::ProviderConfig;
pub use context::{ContextFactory, Lease, LeaseTracker, QueryContext};
pub use enumeration::{AsyncEnumerable, AsyncEnumerator, Enumerator};
pub use error::{ErrorCategory, ExecutionPhase, QueryError, Result};
pub use expression::{Element, ElementType, Entity, Expression, Projection, Scalar, field, lit};
pub use provider::{
    AnyQueryable, DeferredQueryProvider, QueryProvider, QueryableRegistry, create_query, create_query_untyped,
};
pub use queryable::Queryable;
pub use repository::{QueryRepository, Repository, RepositoryFactory};
