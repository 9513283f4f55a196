//! Structural traversal of expression trees

use crate::error::Result;
use crate::expression::{Constant, Expression, ExpressionNode};

/// Rebuilding visitor over an [`Expression`]
///
/// The default methods walk the tree bottom-up and rebuild each node over its
/// visited input. Nodes whose input comes back unchanged are reused as-is, so
/// a visitor that changes nothing returns the original tree.
pub trait ExpressionVisitor {
    fn visit(&mut self, expression: &Expression) -> Result<Expression> {
        match expression.node() {
            ExpressionNode::Constant(constant) => self.visit_constant(expression, constant),
            _ => self.visit_operator(expression),
        }
    }

    /// Called for every constant leaf; returns the leaf unchanged by default
    fn visit_constant(&mut self, expression: &Expression, _constant: &Constant) -> Result<Expression> {
        Ok(expression.clone())
    }

    /// Called for every non-leaf node
    fn visit_operator(&mut self, expression: &Expression) -> Result<Expression> {
        match expression.source() {
            Some(source) => {
                let visited = self.visit(source)?;
                Ok(expression.with_source(visited))
            }
            None => Ok(expression.clone()),
        }
    }
}
