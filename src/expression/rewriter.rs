//! Placeholder substitution

use tracing::trace;

use crate::error::{QueryError, Result};
use crate::expression::{
    Constant, ConstantType, EntityDescriptor, Expression, ExpressionNode, ExpressionVisitor,
};

/// Replaces the placeholder leaf for one entity with a native source
///
/// Every tree built by a queryable has exactly one placeholder; anything else
/// means the tree was assembled by hand or spliced from another provider, and
/// [`SourceRewriter::rewrite`] refuses it.
pub struct SourceRewriter {
    target: ConstantType,
    replacement: Expression,
    substitutions: usize,
}

impl SourceRewriter {
    /// Rewriter swapping the placeholder for `entity` with `replacement`
    pub fn new(entity: EntityDescriptor, replacement: Expression) -> Self {
        Self {
            target: ConstantType::Placeholder(entity),
            replacement,
            substitutions: 0,
        }
    }

    /// Rewrite `expression`, requiring exactly one substitution
    pub fn rewrite(mut self, expression: &Expression) -> Result<Expression> {
        let rewritten = self.visit(expression)?;
        if self.substitutions != 1 {
            return Err(QueryError::PlaceholderCount(self.substitutions));
        }
        trace!(%rewritten, "rewrote query source");
        Ok(rewritten)
    }
}

impl ExpressionVisitor for SourceRewriter {
    fn visit_constant(&mut self, expression: &Expression, constant: &Constant) -> Result<Expression> {
        if constant.declared_type() == self.target {
            self.substitutions += 1;
            return Ok(self.replacement.clone());
        }
        Ok(expression.clone())
    }
}

/// Count the placeholder leaves of `expression`
pub fn count_placeholders(expression: &Expression) -> usize {
    let own = usize::from(matches!(
        expression.node(),
        ExpressionNode::Constant(Constant::Placeholder(_))
    ));
    own + expression.source().map_or(0, count_placeholders)
}
