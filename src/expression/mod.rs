//! Immutable query expression trees
//!
//! A composed query is a chain of [`ExpressionNode`]s rooted at a single
//! constant leaf. Before execution that leaf is a [`Placeholder`] standing in
//! for the not-yet-opened data source; at execution time it is swapped for a
//! backend's [`NativeSource`] by the [`rewriter::SourceRewriter`].
//!
//! Nodes are shared through `Arc`, so extending a query never copies the
//! tree it extends and cloning an [`Expression`] is a reference-count bump.

use std::{
    any::TypeId,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

pub mod rewriter;
pub mod scalar;
pub mod visitor;

pub use rewriter::SourceRewriter;
pub use scalar::{
    AggregateFunction, ArithmeticOperator, ConditionOperator, LogicalOperator, OrderDirection,
    Projection, Scalar, field, lit,
};
pub use visitor::ExpressionVisitor;

/// Anything a query can yield: records are decoded into it with serde
pub trait Element: DeserializeOwned + Send + Sync + 'static {}

impl<T> Element for T where T: DeserializeOwned + Send + Sync + 'static {}

/// A stored entity type with a named table or collection
pub trait Entity: Element + Serialize {
    /// Table (relational) or collection (document) name
    const SOURCE: &'static str;
}

/// Runtime descriptor of an element type
#[derive(Clone, Copy)]
pub struct ElementType {
    id: TypeId,
    name: &'static str,
}

impl ElementType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ElementType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ElementType {}

impl Hash for ElementType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An entity type together with its source name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityDescriptor {
    pub source: &'static str,
    pub element: ElementType,
}

impl EntityDescriptor {
    pub fn of<E: Entity>() -> Self {
        Self {
            source: E::SOURCE,
            element: ElementType::of::<E>(),
        }
    }
}

/// Stand-in for a data source that has not been opened yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    /// Provider that created the root queryable
    pub provider_id: Uuid,
    pub entity: EntityDescriptor,
}

/// A source that belongs to one opened backend context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSource {
    /// Backend name, e.g. `sqlite` or `memory`
    pub backend: &'static str,
    /// Table or collection the backend reads from
    pub name: String,
    pub entity: EntityDescriptor,
    /// Context instance the source was obtained from
    pub context_id: Uuid,
}

/// The declared type of a constant leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantType {
    Placeholder(EntityDescriptor),
    Native(EntityDescriptor),
}

/// Constant leaf of an expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Placeholder(Placeholder),
    Native(NativeSource),
}

impl Constant {
    pub fn declared_type(&self) -> ConstantType {
        match self {
            Self::Placeholder(placeholder) => ConstantType::Placeholder(placeholder.entity),
            Self::Native(source) => ConstantType::Native(source.entity),
        }
    }

    pub fn entity(&self) -> EntityDescriptor {
        match self {
            Self::Placeholder(placeholder) => placeholder.entity,
            Self::Native(source) => source.entity,
        }
    }
}

/// One node of a query expression
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Constant(Constant),
    Filter {
        source: Expression,
        predicate: Scalar,
    },
    /// `then` marks a secondary key appended to the ordering below it
    OrderBy {
        source: Expression,
        key: Scalar,
        direction: OrderDirection,
        then: bool,
    },
    Skip {
        source: Expression,
        count: u64,
    },
    Take {
        source: Expression,
        count: u64,
    },
    Distinct {
        source: Expression,
    },
    Select {
        source: Expression,
        projection: Projection,
        element: ElementType,
    },

    // Terminal operators: these produce a single value rather than a sequence
    Count {
        source: Expression,
    },
    Any {
        source: Expression,
    },
    First {
        source: Expression,
        or_default: bool,
    },
    Single {
        source: Expression,
    },
    Aggregate {
        source: Expression,
        function: AggregateFunction,
        key: Scalar,
    },
}

/// What an expression evaluates to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionShape {
    Sequence(ElementType),
    Scalar,
}

/// Shared handle to an immutable expression node
#[derive(Clone, PartialEq)]
pub struct Expression(Arc<ExpressionNode>);

impl Expression {
    pub fn new(node: ExpressionNode) -> Self {
        Self(Arc::new(node))
    }

    pub fn constant(constant: Constant) -> Self {
        Self::new(ExpressionNode::Constant(constant))
    }

    /// The root leaf for a queryable over `entity` created by `provider_id`
    pub fn placeholder(provider_id: Uuid, entity: EntityDescriptor) -> Self {
        Self::constant(Constant::Placeholder(Placeholder { provider_id, entity }))
    }

    pub fn node(&self) -> &ExpressionNode {
        &self.0
    }

    /// Whether both handles point at the very same node
    pub fn ptr_eq(&self, other: &Expression) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The input of this node, `None` for a constant leaf
    pub fn source(&self) -> Option<&Expression> {
        match self.node() {
            ExpressionNode::Constant(_) => None,
            ExpressionNode::Filter { source, .. }
            | ExpressionNode::OrderBy { source, .. }
            | ExpressionNode::Skip { source, .. }
            | ExpressionNode::Take { source, .. }
            | ExpressionNode::Distinct { source }
            | ExpressionNode::Select { source, .. }
            | ExpressionNode::Count { source }
            | ExpressionNode::Any { source }
            | ExpressionNode::First { source, .. }
            | ExpressionNode::Single { source }
            | ExpressionNode::Aggregate { source, .. } => Some(source),
        }
    }

    /// Rebuild this node over a different input
    ///
    /// Returns a clone of `self` when `source` is the node it already wraps.
    pub fn with_source(&self, source: Expression) -> Expression {
        if self.source().is_some_and(|current| current.ptr_eq(&source)) {
            return self.clone();
        }

        let node = match self.node().clone() {
            ExpressionNode::Constant(constant) => ExpressionNode::Constant(constant),
            ExpressionNode::Filter { predicate, .. } => ExpressionNode::Filter { source, predicate },
            ExpressionNode::OrderBy {
                key, direction, then, ..
            } => ExpressionNode::OrderBy {
                source,
                key,
                direction,
                then,
            },
            ExpressionNode::Skip { count, .. } => ExpressionNode::Skip { source, count },
            ExpressionNode::Take { count, .. } => ExpressionNode::Take { source, count },
            ExpressionNode::Distinct { .. } => ExpressionNode::Distinct { source },
            ExpressionNode::Select {
                projection, element, ..
            } => ExpressionNode::Select {
                source,
                projection,
                element,
            },
            ExpressionNode::Count { .. } => ExpressionNode::Count { source },
            ExpressionNode::Any { .. } => ExpressionNode::Any { source },
            ExpressionNode::First { or_default, .. } => ExpressionNode::First { source, or_default },
            ExpressionNode::Single { .. } => ExpressionNode::Single { source },
            ExpressionNode::Aggregate { function, key, .. } => ExpressionNode::Aggregate {
                source,
                function,
                key,
            },
        };
        Expression::new(node)
    }

    /// The constant leaf this expression is built on
    pub fn root(&self) -> &Constant {
        let mut current = self;
        while let Some(source) = current.source() {
            current = source;
        }
        match current.node() {
            ExpressionNode::Constant(constant) => constant,
            _ => unreachable!("only constant nodes have no source"),
        }
    }

    /// Static type of the expression: a sequence of some element, or a scalar
    pub fn shape(&self) -> ExpressionShape {
        match self.node() {
            ExpressionNode::Constant(constant) => ExpressionShape::Sequence(constant.entity().element),
            ExpressionNode::Select { element, .. } => ExpressionShape::Sequence(*element),
            ExpressionNode::Filter { source, .. }
            | ExpressionNode::OrderBy { source, .. }
            | ExpressionNode::Skip { source, .. }
            | ExpressionNode::Take { source, .. }
            | ExpressionNode::Distinct { source } => source.shape(),
            ExpressionNode::Count { .. }
            | ExpressionNode::Any { .. }
            | ExpressionNode::First { .. }
            | ExpressionNode::Single { .. }
            | ExpressionNode::Aggregate { .. } => ExpressionShape::Scalar,
        }
    }

    /// Element type of a sequence expression
    pub fn element_type(&self) -> Option<ElementType> {
        match self.shape() {
            ExpressionShape::Sequence(element) => Some(element),
            ExpressionShape::Scalar => None,
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.shape(), ExpressionShape::Sequence(_))
    }

    /// Number of nodes from this node down to the leaf, inclusive
    pub fn depth(&self) -> usize {
        1 + self.source().map_or(0, Expression::depth)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.node(), f)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = self.source() {
            write!(f, "{source}.")?;
        }
        match self.node() {
            ExpressionNode::Constant(Constant::Placeholder(placeholder)) => {
                write!(f, "placeholder({})", placeholder.entity.source)
            }
            ExpressionNode::Constant(Constant::Native(source)) => {
                write!(f, "{}({})", source.backend, source.name)
            }
            ExpressionNode::Filter { predicate, .. } => write!(f, "filter({predicate})"),
            ExpressionNode::OrderBy {
                key, direction, then, ..
            } => {
                let op = if *then { "then_by" } else { "order_by" };
                write!(f, "{op}({key} {})", direction.as_sql())
            }
            ExpressionNode::Skip { count, .. } => write!(f, "skip({count})"),
            ExpressionNode::Take { count, .. } => write!(f, "take({count})"),
            ExpressionNode::Distinct { .. } => write!(f, "distinct()"),
            ExpressionNode::Select { projection, .. } => write!(f, "select({projection})"),
            ExpressionNode::Count { .. } => write!(f, "count()"),
            ExpressionNode::Any { .. } => write!(f, "any()"),
            ExpressionNode::First { or_default, .. } => {
                if *or_default {
                    write!(f, "first_or_default()")
                } else {
                    write!(f, "first()")
                }
            }
            ExpressionNode::Single { .. } => write!(f, "single()"),
            ExpressionNode::Aggregate { function, key, .. } => {
                write!(f, "{}({key})", function.as_sql().to_lowercase())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Widget {
        id: i64,
    }

    impl Entity for Widget {
        const SOURCE: &'static str = "widgets";
    }

    #[derive(Debug, Deserialize)]
    struct WidgetId {
        #[allow(dead_code)]
        id: i64,
    }

    fn root() -> Expression {
        Expression::placeholder(Uuid::new_v4(), EntityDescriptor::of::<Widget>())
    }

    #[test]
    fn test_extending_shares_the_prior_tree() {
        let base = root();
        let filtered = Expression::new(ExpressionNode::Filter {
            source: base.clone(),
            predicate: field("id").gt(1),
        });

        assert!(filtered.source().unwrap().ptr_eq(&base));
        assert_eq!(filtered.depth(), 2);
        assert!(matches!(filtered.root(), Constant::Placeholder(_)));
    }

    #[test]
    fn test_shape_follows_projection_and_terminals() {
        let base = root();
        let projected = Expression::new(ExpressionNode::Select {
            source: base.clone(),
            projection: Projection::new().field("id"),
            element: ElementType::of::<WidgetId>(),
        });
        let counted = Expression::new(ExpressionNode::Count { source: projected.clone() });

        assert_eq!(base.element_type(), Some(ElementType::of::<Widget>()));
        assert_eq!(projected.element_type(), Some(ElementType::of::<WidgetId>()));
        assert_eq!(counted.shape(), ExpressionShape::Scalar);
    }

    #[test]
    fn test_with_source_keeps_operator_metadata() {
        let base = root();
        let take = Expression::new(ExpressionNode::Take {
            source: base.clone(),
            count: 3,
        });
        let other = root();

        let moved = take.with_source(other.clone());
        assert!(moved.source().unwrap().ptr_eq(&other));
        assert!(matches!(moved.node(), ExpressionNode::Take { count: 3, .. }));
        assert!(take.with_source(base).ptr_eq(&take));
    }

    #[test]
    fn test_display_renders_the_chain() {
        let expr = Expression::new(ExpressionNode::OrderBy {
            source: Expression::new(ExpressionNode::Filter {
                source: root(),
                predicate: field("id").gt(1),
            }),
            key: field("id"),
            direction: OrderDirection::Desc,
            then: false,
        });

        assert_eq!(expr.to_string(), "placeholder(widgets).filter((id > 1)).order_by(id DESC)");
    }
}
