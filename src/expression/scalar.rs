//! Scalar sub-expressions used by query operators
//!
//! Predicates, ordering keys, projections and aggregate arguments are all
//! [`Scalar`] trees. They refer to record fields by name and never contain a
//! query source, so rewriting a query never has to look inside them.

use std::fmt;

use serde_json::Value as JsonValue;

/// Condition operator for comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    /// Equal (=)
    Equal,
    /// Not equal (!=)
    NotEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal (>=)
    GreaterThanOrEqual,
    /// Less than (<)
    LessThan,
    /// Less than or equal (<=)
    LessThanOrEqual,
}

impl ConditionOperator {
    /// Get the SQL representation of the operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
        }
    }
}

/// Logical operator for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    /// AND
    And,
    /// OR
    Or,
}

impl LogicalOperator {
    /// Get the SQL representation of the operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Arithmetic operator for computed values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOperator {
    /// Get the SQL representation of the operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }
}

/// Order direction for sorting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl OrderDirection {
    /// Get the SQL representation of the direction
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Aggregation function for terminal aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// COUNT of non-null values
    Count,
    /// SUM
    Sum,
    /// AVG
    Avg,
    /// MIN
    Min,
    /// MAX
    Max,
}

impl AggregateFunction {
    /// Get the SQL representation of the aggregation function
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// A value computed per record
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// A named field of the current record
    Field(String),
    /// A constant value
    Literal(JsonValue),
    /// Binary comparison
    Compare {
        left: Box<Scalar>,
        op: ConditionOperator,
        right: Box<Scalar>,
    },
    /// AND / OR
    Logical {
        left: Box<Scalar>,
        op: LogicalOperator,
        right: Box<Scalar>,
    },
    /// Arithmetic on two numeric values
    Arithmetic {
        left: Box<Scalar>,
        op: ArithmeticOperator,
        right: Box<Scalar>,
    },
    Not(Box<Scalar>),
    IsNull(Box<Scalar>),
    IsNotNull(Box<Scalar>),
    /// SQL `LIKE` with `%` and `_` wildcards, ASCII case-insensitive
    Like { expr: Box<Scalar>, pattern: String },
    /// Membership in a literal list
    In { expr: Box<Scalar>, values: Vec<JsonValue> },
}

/// Builds a field-reference scalar
pub fn field(name: impl Into<String>) -> Scalar {
    Scalar::Field(name.into())
}

/// Builds a literal scalar from anything convertible to JSON
pub fn lit(value: impl Into<JsonValue>) -> Scalar {
    Scalar::Literal(value.into())
}

impl Scalar {
    fn compare(self, op: ConditionOperator, right: impl Into<Scalar>) -> Scalar {
        Scalar::Compare {
            left: Box::new(self),
            op,
            right: Box::new(right.into()),
        }
    }

    fn arithmetic(self, op: ArithmeticOperator, right: impl Into<Scalar>) -> Scalar {
        Scalar::Arithmetic {
            left: Box::new(self),
            op,
            right: Box::new(right.into()),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn eq(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::Equal, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn ne(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::NotEqual, right)
    }

    pub fn gt(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::GreaterThan, right)
    }

    pub fn ge(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::GreaterThanOrEqual, right)
    }

    pub fn lt(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::LessThan, right)
    }

    pub fn le(self, right: impl Into<Scalar>) -> Scalar {
        self.compare(ConditionOperator::LessThanOrEqual, right)
    }

    pub fn and(self, right: Scalar) -> Scalar {
        Scalar::Logical {
            left: Box::new(self),
            op: LogicalOperator::And,
            right: Box::new(right),
        }
    }

    pub fn or(self, right: Scalar) -> Scalar {
        Scalar::Logical {
            left: Box::new(self),
            op: LogicalOperator::Or,
            right: Box::new(right),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Scalar {
        Scalar::Not(Box::new(self))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, right: impl Into<Scalar>) -> Scalar {
        self.arithmetic(ArithmeticOperator::Add, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, right: impl Into<Scalar>) -> Scalar {
        self.arithmetic(ArithmeticOperator::Subtract, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, right: impl Into<Scalar>) -> Scalar {
        self.arithmetic(ArithmeticOperator::Multiply, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(self, right: impl Into<Scalar>) -> Scalar {
        self.arithmetic(ArithmeticOperator::Divide, right)
    }

    pub fn is_null(self) -> Scalar {
        Scalar::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Scalar {
        Scalar::IsNotNull(Box::new(self))
    }

    pub fn like(self, pattern: impl Into<String>) -> Scalar {
        Scalar::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
        }
    }

    pub fn is_in<I, V>(self, values: I) -> Scalar
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        Scalar::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

macro_rules! scalar_from_literal {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Scalar {
                fn from(value: $ty) -> Self {
                    Scalar::Literal(value.into())
                }
            }
        )*
    };
}

scalar_from_literal!(bool, i32, i64, u32, u64, f64, String, &str, JsonValue);

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{name}"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Compare { left, op, right } => write!(f, "({left} {} {right})", op.as_sql()),
            Self::Logical { left, op, right } => write!(f, "({left} {} {right})", op.as_sql()),
            Self::Arithmetic { left, op, right } => write!(f, "({left} {} {right})", op.as_sql()),
            Self::Not(expr) => write!(f, "NOT {expr}"),
            Self::IsNull(expr) => write!(f, "{expr} IS NULL"),
            Self::IsNotNull(expr) => write!(f, "{expr} IS NOT NULL"),
            Self::Like { expr, pattern } => write!(f, "{expr} LIKE {pattern:?}"),
            Self::In { expr, values } => {
                let values = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                write!(f, "{expr} IN ({})", values.join(", "))
            }
        }
    }
}

/// Named output columns of a `select`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    columns: Vec<(String, Scalar)>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output column computed by `value`
    pub fn column(mut self, alias: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.columns.push((alias.into(), value.into()));
        self
    }

    /// Add an output column copying `name` unchanged
    pub fn field(self, name: &str) -> Self {
        self.column(name, field(name))
    }

    pub fn columns(&self) -> &[(String, Scalar)] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = self
            .columns
            .iter()
            .map(|(alias, value)| format!("{value} AS {alias}"))
            .collect::<Vec<_>>();
        write!(f, "{}", columns.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_nest_left_to_right() {
        let predicate = field("total").gt(100).and(field("status").eq("open"));

        assert_eq!(predicate.to_string(), r#"((total > 100) AND (status = "open"))"#);
    }

    #[test]
    fn test_projection_keeps_column_order() {
        let projection = Projection::new()
            .field("id")
            .column("gross", field("total").mul(1.2));

        let aliases: Vec<_> = projection.columns().iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(aliases, ["id", "gross"]);
    }
}
