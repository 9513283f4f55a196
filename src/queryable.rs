//! Typed, composable query facade

use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use serde_json::Value as JsonValue;

use crate::cancel::Cancellation;
use crate::enumeration::{AsyncEnumerable, Enumerator};
use crate::error::{ExecutionPhase, QueryError, Result};
use crate::expression::{
    AggregateFunction, Element, ElementType, Entity, EntityDescriptor, Expression, ExpressionNode,
    OrderDirection, Projection, Scalar,
};
use crate::provider::{AnyQueryable, QueryProvider, create_query, execute_as, execute_as_async};
use crate::record::{decode_value, is_truthy};

/// An immutable query over elements of type `T`
///
/// Composing operators return new queryables sharing the expression built so
/// far. Nothing touches a backend until a terminal operation (or the first
/// pull of an enumerator) runs, and every such run opens and releases its own
/// context.
pub struct Queryable<T> {
    expression: Expression,
    provider: Arc<dyn QueryProvider>,
    element: PhantomData<fn() -> T>,
}

impl<T: Entity> Queryable<T> {
    /// Root queryable over the entity's source, rooted at a placeholder
    pub fn root(provider: Arc<dyn QueryProvider>) -> Self {
        let expression = Expression::placeholder(provider.id(), EntityDescriptor::of::<T>());
        Self::from_parts(provider, expression)
    }
}

impl<T: Element> Queryable<T> {
    pub(crate) fn from_parts(provider: Arc<dyn QueryProvider>, expression: Expression) -> Self {
        Self {
            expression,
            provider,
            element: PhantomData,
        }
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn element_type(&self) -> ElementType {
        ElementType::of::<T>()
    }

    pub fn provider(&self) -> &Arc<dyn QueryProvider> {
        &self.provider
    }

    fn compose(&self, node: ExpressionNode) -> Self {
        create_query(&self.provider, Expression::new(node))
    }

    fn source(&self) -> Expression {
        self.expression.clone()
    }

    pub fn filter(&self, predicate: Scalar) -> Self {
        self.compose(ExpressionNode::Filter {
            source: self.source(),
            predicate,
        })
    }

    fn ordered(&self, key: Scalar, direction: OrderDirection, then: bool) -> Self {
        self.compose(ExpressionNode::OrderBy {
            source: self.source(),
            key,
            direction,
            then,
        })
    }

    /// Sort ascending by `key`, replacing any earlier ordering
    pub fn order_by(&self, key: Scalar) -> Self {
        self.ordered(key, OrderDirection::Asc, false)
    }

    pub fn order_by_descending(&self, key: Scalar) -> Self {
        self.ordered(key, OrderDirection::Desc, false)
    }

    /// Append an ascending secondary key to the current ordering
    pub fn then_by(&self, key: Scalar) -> Self {
        self.ordered(key, OrderDirection::Asc, true)
    }

    pub fn then_by_descending(&self, key: Scalar) -> Self {
        self.ordered(key, OrderDirection::Desc, true)
    }

    pub fn skip(&self, count: u64) -> Self {
        self.compose(ExpressionNode::Skip {
            source: self.source(),
            count,
        })
    }

    pub fn take(&self, count: u64) -> Self {
        self.compose(ExpressionNode::Take {
            source: self.source(),
            count,
        })
    }

    pub fn distinct(&self) -> Self {
        self.compose(ExpressionNode::Distinct { source: self.source() })
    }

    /// Project every element into `U` through named columns
    pub fn select<U: Element>(&self, projection: Projection) -> Queryable<U> {
        let node = ExpressionNode::Select {
            source: self.source(),
            projection,
            element: ElementType::of::<U>(),
        };
        create_query(&self.provider, Expression::new(node))
    }

    /// Lazy synchronous enumeration; acquires on the first `next`
    pub fn iter(&self) -> Enumerator<T> {
        Enumerator::new(self.provider.clone(), self.source())
    }

    /// Lazy asynchronous enumeration observing `cancel`
    pub fn stream(&self, cancel: &Cancellation) -> AsyncEnumerable<T> {
        AsyncEnumerable::new(self.provider.clone(), self.source(), cancel.clone())
    }

    pub fn to_list(&self) -> Result<Vec<T>> {
        self.iter().collect()
    }

    pub async fn to_list_async(&self, cancel: &Cancellation) -> Result<Vec<T>> {
        self.stream(cancel).to_list().await
    }

    fn count_node(&self) -> Expression {
        Expression::new(ExpressionNode::Count { source: self.source() })
    }

    fn any_node(&self) -> Expression {
        Expression::new(ExpressionNode::Any { source: self.source() })
    }

    fn first_node(&self, or_default: bool) -> Expression {
        Expression::new(ExpressionNode::First {
            source: self.source(),
            or_default,
        })
    }

    fn single_node(&self) -> Expression {
        Expression::new(ExpressionNode::Single { source: self.source() })
    }

    fn aggregate_node(&self, function: AggregateFunction, key: Scalar) -> Expression {
        Expression::new(ExpressionNode::Aggregate {
            source: self.source(),
            function,
            key,
        })
    }

    pub fn count(&self) -> Result<u64> {
        execute_as(self.provider.as_ref(), &self.count_node())
    }

    pub async fn count_async(&self, cancel: &Cancellation) -> Result<u64> {
        execute_as_async(self.provider.as_ref(), &self.count_node(), cancel).await
    }

    pub fn any(&self) -> Result<bool> {
        Ok(is_truthy(&self.provider.execute(&self.any_node())?))
    }

    pub async fn any_async(&self, cancel: &Cancellation) -> Result<bool> {
        Ok(is_truthy(&self.provider.execute_async(&self.any_node(), cancel).await?))
    }

    /// First element; fails with [`QueryError::NoElements`] on an empty sequence
    pub fn first(&self) -> Result<T> {
        execute_as(self.provider.as_ref(), &self.first_node(false))
    }

    pub async fn first_async(&self, cancel: &Cancellation) -> Result<T> {
        execute_as_async(self.provider.as_ref(), &self.first_node(false), cancel).await
    }

    pub fn first_or_default(&self) -> Result<Option<T>> {
        execute_as(self.provider.as_ref(), &self.first_node(true))
    }

    pub async fn first_or_default_async(&self, cancel: &Cancellation) -> Result<Option<T>> {
        execute_as_async(self.provider.as_ref(), &self.first_node(true), cancel).await
    }

    /// The only element; fails when the sequence is empty or has more than one
    pub fn single(&self) -> Result<T> {
        execute_as(self.provider.as_ref(), &self.single_node())
    }

    pub async fn single_async(&self, cancel: &Cancellation) -> Result<T> {
        execute_as_async(self.provider.as_ref(), &self.single_node(), cancel).await
    }

    /// Sum of `key`; zero for an empty sequence
    pub fn sum(&self, key: Scalar) -> Result<f64> {
        let value = self.provider.execute(&self.aggregate_node(AggregateFunction::Sum, key))?;
        Ok(decode_optional::<f64>(value)?.unwrap_or_default())
    }

    pub async fn sum_async(&self, key: Scalar, cancel: &Cancellation) -> Result<f64> {
        let node = self.aggregate_node(AggregateFunction::Sum, key);
        let value = self.provider.execute_async(&node, cancel).await?;
        Ok(decode_optional::<f64>(value)?.unwrap_or_default())
    }

    /// Smallest non-null `key`, `None` when there is none
    pub fn min<R: Element>(&self, key: Scalar) -> Result<Option<R>> {
        decode_optional(self.provider.execute(&self.aggregate_node(AggregateFunction::Min, key))?)
    }

    pub async fn min_async<R: Element>(&self, key: Scalar, cancel: &Cancellation) -> Result<Option<R>> {
        let node = self.aggregate_node(AggregateFunction::Min, key);
        decode_optional(self.provider.execute_async(&node, cancel).await?)
    }

    /// Largest non-null `key`, `None` when there is none
    pub fn max<R: Element>(&self, key: Scalar) -> Result<Option<R>> {
        decode_optional(self.provider.execute(&self.aggregate_node(AggregateFunction::Max, key))?)
    }

    pub async fn max_async<R: Element>(&self, key: Scalar, cancel: &Cancellation) -> Result<Option<R>> {
        let node = self.aggregate_node(AggregateFunction::Max, key);
        decode_optional(self.provider.execute_async(&node, cancel).await?)
    }

    /// Mean of the non-null `key` values, `None` when there is none
    pub fn average(&self, key: Scalar) -> Result<Option<f64>> {
        decode_optional(self.provider.execute(&self.aggregate_node(AggregateFunction::Avg, key))?)
    }

    pub async fn average_async(&self, key: Scalar, cancel: &Cancellation) -> Result<Option<f64>> {
        let node = self.aggregate_node(AggregateFunction::Avg, key);
        decode_optional(self.provider.execute_async(&node, cancel).await?)
    }
}

fn decode_optional<R: Element>(value: JsonValue) -> Result<Option<R>> {
    if value.is_null() {
        return Ok(None);
    }
    decode_value(value)
        .map(Some)
        .map_err(|err| QueryError::execution(ExecutionPhase::Materialize, err))
}

impl<T: Element> IntoIterator for &Queryable<T> {
    type Item = Result<T>;
    type IntoIter = Enumerator<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> Clone for Queryable<T> {
    fn clone(&self) -> Self {
        Self {
            expression: self.expression.clone(),
            provider: self.provider.clone(),
            element: PhantomData,
        }
    }
}

impl<T> PartialEq for Queryable<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl<T> fmt::Debug for Queryable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queryable")
            .field("element", &std::any::type_name::<T>())
            .field("expression", &format_args!("{}", self.expression))
            .finish()
    }
}

impl<T: Element> AnyQueryable for Queryable<T> {
    fn expression(&self) -> &Expression {
        &self.expression
    }

    fn element_type(&self) -> ElementType {
        ElementType::of::<T>()
    }

    fn provider(&self) -> &Arc<dyn QueryProvider> {
        &self.provider
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
