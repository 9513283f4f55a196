//! Runtime dispatch from element types to typed queryable constructors

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::debug;

use crate::error::{QueryError, Result};
use crate::expression::{Element, ElementType, Expression, ExpressionShape};
use crate::provider::QueryProvider;
use crate::queryable::Queryable;

/// A queryable whose element type is only known at runtime
pub trait AnyQueryable: fmt::Debug + Send + Sync {
    fn expression(&self) -> &Expression;

    fn element_type(&self) -> ElementType;

    fn provider(&self) -> &Arc<dyn QueryProvider>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl dyn AnyQueryable {
    /// Recover the typed queryable, if `T` is its element type
    pub fn downcast<T: Element>(self: Box<Self>) -> Option<Queryable<T>> {
        self.into_any().downcast::<Queryable<T>>().ok().map(|queryable| *queryable)
    }

    pub fn downcast_ref<T: Element>(&self) -> Option<&Queryable<T>> {
        self.as_any().downcast_ref::<Queryable<T>>()
    }
}

type Constructor = fn(Arc<dyn QueryProvider>, Expression) -> Box<dyn AnyQueryable>;

fn construct_typed<T: Element>(provider: Arc<dyn QueryProvider>, expression: Expression) -> Box<dyn AnyQueryable> {
    Box::new(Queryable::<T>::from_parts(provider, expression))
}

/// Table of element types that can be constructed without static type knowledge
///
/// Entity types are registered when their root queryable is created; projected
/// element types have to be registered explicitly before untyped construction
/// can produce them.
#[derive(Default)]
pub struct QueryableRegistry {
    constructors: RwLock<HashMap<ElementType, Constructor>>,
}

impl QueryableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `T` constructible by [`QueryableRegistry::construct`]
    pub fn register<T: Element>(&self) {
        let element = ElementType::of::<T>();
        let mut constructors = self.constructors.write().unwrap_or_else(PoisonError::into_inner);
        if constructors.insert(element, construct_typed::<T>).is_none() {
            debug!(%element, "registered queryable element type");
        }
    }

    pub fn is_registered(&self, element: ElementType) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&element)
    }

    pub fn len(&self) -> usize {
        self.constructors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a queryable typed by the expression's runtime element type
    ///
    /// Fails with [`QueryError::Construction`] for scalar expressions and
    /// unregistered element types. Never touches a backend.
    pub fn construct(&self, provider: Arc<dyn QueryProvider>, expression: Expression) -> Result<Box<dyn AnyQueryable>> {
        let element = match expression.shape() {
            ExpressionShape::Sequence(element) => element,
            ExpressionShape::Scalar => {
                return Err(QueryError::construction(
                    "<scalar>",
                    QueryError::NotASequence(expression.to_string()),
                ));
            }
        };

        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&element)
            .copied();
        match constructor {
            Some(constructor) => Ok(constructor(provider, expression)),
            None => Err(QueryError::construction(
                element.name(),
                QueryError::UnregisteredElementType(element.name().to_string()),
            )),
        }
    }
}

impl fmt::Debug for QueryableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let constructors = self.constructors.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(constructors.keys()).finish()
    }
}
