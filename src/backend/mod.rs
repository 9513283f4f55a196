//! Native query engines behind the deferred provider
//!
//! Each backend supplies a [`ContextFactory`](crate::context::ContextFactory)
//! and a [`QueryContext`](crate::context::QueryContext) that can evaluate a
//! rewritten expression tree.

pub mod memory;
pub mod sqlite;

use crate::error::{QueryError, Result};
use crate::expression::{Constant, Expression, ExpressionNode, NativeSource, OrderDirection, Scalar};

/// Ordering keys of an `OrderBy` chain, primary key first
pub(crate) type OrderKeys = Vec<(Scalar, OrderDirection)>;

/// Split an `OrderBy` node into the input it sorts and its full key list
///
/// `then_by` nodes append to the ordering beneath them; a plain `order_by`
/// starts a new one and hides any ordering further down.
pub(crate) fn ordering(expression: &Expression) -> Result<(Expression, OrderKeys)> {
    let mut keys = Vec::new();
    let mut current = expression;
    loop {
        match current.node() {
            ExpressionNode::OrderBy {
                source,
                key,
                direction,
                then,
            } => {
                keys.push((key.clone(), *direction));
                current = source;
                if !*then {
                    break;
                }
            }
            _ => return Err(QueryError::unsupported("then_by must follow an order_by")),
        }
    }
    keys.reverse();
    Ok((current.clone(), keys))
}

/// The native source of a bound expression, checked against the context that owns it
pub(crate) fn native_source<'a>(
    expression: &'a Expression,
    backend: &str,
    context_id: uuid::Uuid,
) -> Result<&'a NativeSource> {
    match expression.root() {
        Constant::Native(source) if source.backend == backend && source.context_id == context_id => Ok(source),
        Constant::Native(source) => Err(QueryError::unsupported(format!(
            "source {}({}) belongs to another context",
            source.backend, source.name
        ))),
        Constant::Placeholder(_) => Err(QueryError::unsupported("expression has not been bound to a source")),
    }
}
