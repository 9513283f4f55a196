//! Translation of bound expression trees into SQLite statements
//!
//! Sequence operators fold into a single `SELECT` while SQL clause order
//! allows it; an operator that would change meaning if merged (a filter after
//! a `LIMIT`, a projection over a projection) pushes the statement built so far
//! into a subquery.

use serde_json::Value as JsonValue;
use sqlx::{QueryBuilder, Sqlite};

use crate::backend::{OrderKeys, ordering};
use crate::error::{QueryError, Result};
use crate::expression::{AggregateFunction, Constant, Expression, ExpressionNode, Projection, Scalar};

#[derive(Debug, Clone, PartialEq)]
enum FromClause {
    Table(String),
    Subquery(Box<SelectStatement>),
}

/// One `SELECT` with its clauses, possibly over a nested statement
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectStatement {
    from: FromClause,
    projection: Option<Projection>,
    distinct: bool,
    filters: Vec<Scalar>,
    order: OrderKeys,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectStatement {
    fn table(name: &str) -> Self {
        Self::over(FromClause::Table(name.to_string()))
    }

    fn over(from: FromClause) -> Self {
        Self {
            from,
            projection: None,
            distinct: false,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Push this statement into a subquery of a fresh `SELECT *`
    ///
    /// The ordering is repeated outside. Under a projection only its leading
    /// keys that are output columns survive, renamed to their aliases.
    fn wrap(self) -> Self {
        let order = match &self.projection {
            None => self.order.clone(),
            Some(projection) => self
                .order
                .iter()
                .map_while(|(key, direction)| exposed(projection, key).map(|key| (key, *direction)))
                .collect(),
        };
        let mut outer = Self::over(FromClause::Subquery(Box::new(self)));
        outer.order = order;
        outer
    }

    fn filter(mut self, predicate: &Scalar) -> Self {
        if self.projection.is_some() || self.is_paged() {
            self = self.wrap();
        }
        self.filters.push(predicate.clone());
        self
    }

    /// A new ordering is primary; the previous one breaks its ties
    ///
    /// Keys naming output columns of an unpaged projection are ordered on the
    /// same `SELECT`, so the earlier keys still apply.
    fn order_by(mut self, keys: OrderKeys) -> Self {
        let resolved = match &self.projection {
            Some(projection) if !self.is_paged() && !self.distinct => keys
                .iter()
                .map(|(key, direction)| resolve(projection, key).map(|key| (key, *direction)))
                .collect::<Option<OrderKeys>>(),
            _ => None,
        };
        let keys = match resolved {
            Some(resolved) => resolved,
            None => {
                if self.projection.is_some() || self.is_paged() {
                    self = self.wrap();
                }
                keys
            }
        };
        let previous = std::mem::take(&mut self.order);
        self.order = keys.into_iter().chain(previous).collect();
        self
    }

    pub(crate) fn skip(mut self, count: u64) -> Self {
        if self.limit.is_some() {
            self = self.wrap();
        }
        self.offset = Some(self.offset.unwrap_or(0).saturating_add(count));
        self
    }

    pub(crate) fn take(mut self, count: u64) -> Self {
        self.limit = Some(self.limit.map_or(count, |limit| limit.min(count)));
        self
    }

    fn distinct(mut self) -> Self {
        if self.is_paged() {
            self = self.wrap();
        }
        self.distinct = true;
        self
    }

    fn select(mut self, projection: &Projection) -> Result<Self> {
        if projection.is_empty() {
            return Err(QueryError::unsupported("select requires at least one column"));
        }
        if self.projection.is_some() || self.distinct {
            self = self.wrap();
        }
        self.projection = Some(projection.clone());
        Ok(self)
    }

    /// Render into a fresh query builder
    pub(crate) fn build(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new("");
        self.render(&mut builder);
        builder
    }

    fn render(&self, builder: &mut QueryBuilder<'static, Sqlite>) {
        builder.push("SELECT ");
        if self.distinct {
            builder.push("DISTINCT ");
        }
        match &self.projection {
            None => {
                builder.push("*");
            }
            Some(projection) => {
                for (index, (alias, value)) in projection.columns().iter().enumerate() {
                    if index > 0 {
                        builder.push(", ");
                    }
                    render_scalar(value, builder);
                    builder.push(" AS ");
                    builder.push(quote_identifier(alias));
                }
            }
        }

        builder.push(" FROM ");
        match &self.from {
            FromClause::Table(name) => {
                builder.push(quote_identifier(name));
            }
            FromClause::Subquery(inner) => {
                builder.push("(");
                inner.render(builder);
                builder.push(")");
            }
        }

        for (index, predicate) in self.filters.iter().enumerate() {
            builder.push(if index == 0 { " WHERE " } else { " AND " });
            render_scalar(predicate, builder);
        }

        for (index, (key, direction)) in self.order.iter().enumerate() {
            builder.push(if index == 0 { " ORDER BY " } else { ", " });
            render_scalar(key, builder);
            builder.push(" ");
            builder.push(direction.as_sql());
        }

        if self.is_paged() {
            // SQLite has no OFFSET without LIMIT; -1 means unbounded
            builder.push(" LIMIT ");
            builder.push_bind(self.limit.map_or(-1, to_i64));
            if let Some(offset) = self.offset {
                builder.push(" OFFSET ");
                builder.push_bind(to_i64(offset));
            }
        }
    }
}

/// The output column of `projection` computing exactly `key`
fn exposed(projection: &Projection, key: &Scalar) -> Option<Scalar> {
    projection
        .columns()
        .iter()
        .find(|(_, value)| value == key)
        .map(|(alias, _)| Scalar::Field(alias.clone()))
}

/// The input expression behind an output column named by `key`
fn resolve(projection: &Projection, key: &Scalar) -> Option<Scalar> {
    let Scalar::Field(name) = key else {
        return None;
    };
    projection
        .columns()
        .iter()
        .find(|(alias, _)| alias == name)
        .map(|(_, value)| value.clone())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// How the rows of a compiled query become the operation's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultShape {
    /// Every row, as an array of records
    Rows,
    /// The first column of the only row
    Value,
    First { or_default: bool },
    Single,
}

/// A terminal operation ready to run
pub(crate) struct CompiledQuery {
    pub builder: QueryBuilder<'static, Sqlite>,
    pub shape: ResultShape,
}

/// Compile a sequence expression
pub(crate) fn compile_sequence(expression: &Expression) -> Result<SelectStatement> {
    let statement = match expression.node() {
        ExpressionNode::Constant(Constant::Native(source)) => SelectStatement::table(&source.name),
        ExpressionNode::Constant(Constant::Placeholder(_)) => {
            return Err(QueryError::unsupported("expression has not been bound to a source"));
        }
        ExpressionNode::Filter { source, predicate } => compile_sequence(source)?.filter(predicate),
        ExpressionNode::OrderBy { .. } => {
            let (input, keys) = ordering(expression)?;
            compile_sequence(&input)?.order_by(keys)
        }
        ExpressionNode::Skip { source, count } => compile_sequence(source)?.skip(*count),
        ExpressionNode::Take { source, count } => compile_sequence(source)?.take(*count),
        ExpressionNode::Distinct { source } => compile_sequence(source)?.distinct(),
        ExpressionNode::Select { source, projection, .. } => compile_sequence(source)?.select(projection)?,
        _ => return Err(QueryError::NotASequence(expression.to_string())),
    };
    Ok(statement)
}

/// Compile any bound expression, terminal or sequence
pub(crate) fn compile(expression: &Expression) -> Result<CompiledQuery> {
    let compiled = match expression.node() {
        ExpressionNode::Count { source } => {
            let inner = compile_sequence(source)?;
            CompiledQuery {
                builder: over_subquery("SELECT COUNT(*) FROM (", &inner),
                shape: ResultShape::Value,
            }
        }
        ExpressionNode::Any { source } => {
            let inner = compile_sequence(source)?;
            CompiledQuery {
                builder: over_subquery("SELECT EXISTS (", &inner),
                shape: ResultShape::Value,
            }
        }
        ExpressionNode::First { source, or_default } => CompiledQuery {
            builder: compile_sequence(source)?.take(1).build(),
            shape: ResultShape::First { or_default: *or_default },
        },
        ExpressionNode::Single { source } => CompiledQuery {
            builder: compile_sequence(source)?.take(2).build(),
            shape: ResultShape::Single,
        },
        ExpressionNode::Aggregate { source, function, key } => {
            let inner = compile_sequence(source)?;
            let mut builder = QueryBuilder::new("SELECT ");
            render_aggregate(*function, key, &mut builder);
            builder.push(" FROM (");
            inner.render(&mut builder);
            builder.push(")");
            CompiledQuery {
                builder,
                shape: ResultShape::Value,
            }
        }
        _ => CompiledQuery {
            builder: compile_sequence(expression)?.build(),
            shape: ResultShape::Rows,
        },
    };
    Ok(compiled)
}

fn over_subquery(head: &str, inner: &SelectStatement) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(head);
    inner.render(&mut builder);
    builder.push(")");
    builder
}

fn render_aggregate(function: AggregateFunction, key: &Scalar, builder: &mut QueryBuilder<'static, Sqlite>) {
    builder.push(function.as_sql());
    builder.push("(");
    render_scalar(key, builder);
    builder.push(")");
}

/// Double-quote an identifier, escaping embedded quotes
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_literal(value: &JsonValue, builder: &mut QueryBuilder<'static, Sqlite>) {
    match value {
        JsonValue::Null => {
            builder.push("NULL");
        }
        JsonValue::Bool(b) => {
            builder.push_bind(*b);
        }
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => {
                builder.push_bind(i);
            }
            None => {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        JsonValue::String(s) => {
            builder.push_bind(s.clone());
        }
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

fn render_scalar(scalar: &Scalar, builder: &mut QueryBuilder<'static, Sqlite>) {
    match scalar {
        Scalar::Field(name) => {
            builder.push(quote_identifier(name));
        }
        Scalar::Literal(value) => render_literal(value, builder),
        Scalar::Compare { left, op, right } => {
            render_binary(left, op.as_sql(), right, builder);
        }
        Scalar::Logical { left, op, right } => {
            render_binary(left, op.as_sql(), right, builder);
        }
        Scalar::Arithmetic { left, op, right } => {
            render_binary(left, op.as_sql(), right, builder);
        }
        Scalar::Not(inner) => {
            builder.push("(NOT ");
            render_scalar(inner, builder);
            builder.push(")");
        }
        Scalar::IsNull(inner) => {
            builder.push("(");
            render_scalar(inner, builder);
            builder.push(" IS NULL)");
        }
        Scalar::IsNotNull(inner) => {
            builder.push("(");
            render_scalar(inner, builder);
            builder.push(" IS NOT NULL)");
        }
        Scalar::Like { expr, pattern } => {
            builder.push("(");
            render_scalar(expr, builder);
            builder.push(" LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(")");
        }
        Scalar::In { expr, values } => {
            if values.is_empty() {
                builder.push("(CASE WHEN ");
                render_scalar(expr, builder);
                builder.push(" IS NULL THEN NULL ELSE 0 END)");
                return;
            }
            builder.push("(");
            render_scalar(expr, builder);
            builder.push(" IN (");
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                render_literal(value, builder);
            }
            builder.push("))");
        }
    }
}

fn render_binary(left: &Scalar, op: &str, right: &Scalar, builder: &mut QueryBuilder<'static, Sqlite>) {
    builder.push("(");
    render_scalar(left, builder);
    builder.push(" ");
    builder.push(op);
    builder.push(" ");
    render_scalar(right, builder);
    builder.push(")");
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::expression::{EntityDescriptor, NativeSource, OrderDirection, field};

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Order {
        total: f64,
    }

    impl crate::expression::Entity for Order {
        const SOURCE: &'static str = "orders";
    }

    fn table() -> Expression {
        Expression::constant(Constant::Native(NativeSource {
            backend: "sqlite",
            name: "orders".into(),
            entity: EntityDescriptor::of::<Order>(),
            context_id: Uuid::new_v4(),
        }))
    }

    fn node(node: ExpressionNode) -> Expression {
        Expression::new(node)
    }

    fn sql(expression: &Expression) -> String {
        compile(expression).unwrap().builder.sql().to_string()
    }

    #[test]
    fn test_filter_and_order_share_one_select() {
        let filtered = node(ExpressionNode::Filter {
            source: table(),
            predicate: field("total").gt(100),
        });
        let ordered = node(ExpressionNode::OrderBy {
            source: filtered,
            key: field("date"),
            direction: OrderDirection::Desc,
            then: false,
        });

        assert_eq!(
            sql(&ordered),
            r#"SELECT * FROM "orders" WHERE ("total" > ?) ORDER BY "date" DESC"#
        );
    }

    #[test]
    fn test_filter_after_take_uses_subquery() {
        let taken = node(ExpressionNode::Take { source: table(), count: 5 });
        let filtered = node(ExpressionNode::Filter {
            source: taken,
            predicate: field("total").is_not_null(),
        });

        assert_eq!(
            sql(&filtered),
            r#"SELECT * FROM (SELECT * FROM "orders" LIMIT ?) WHERE ("total" IS NOT NULL)"#
        );
    }

    #[test]
    fn test_skip_without_take_uses_unbounded_limit() {
        let skipped = node(ExpressionNode::Skip { source: table(), count: 3 });
        let skipped = node(ExpressionNode::Skip { source: skipped, count: 2 });

        let statement = compile_sequence(&skipped).unwrap();
        assert_eq!(statement.offset, Some(5));
        assert_eq!(sql(&skipped), r#"SELECT * FROM "orders" LIMIT ? OFFSET ?"#);
    }

    #[test]
    fn test_then_by_appends_and_order_by_takes_precedence() {
        let ordered = node(ExpressionNode::OrderBy {
            source: table(),
            key: field("customer"),
            direction: OrderDirection::Asc,
            then: false,
        });
        let then = node(ExpressionNode::OrderBy {
            source: ordered,
            key: field("total"),
            direction: OrderDirection::Desc,
            then: true,
        });
        let reordered = node(ExpressionNode::OrderBy {
            source: then.clone(),
            key: field("id"),
            direction: OrderDirection::Asc,
            then: false,
        });

        assert_eq!(
            sql(&then),
            r#"SELECT * FROM "orders" ORDER BY "customer" ASC, "total" DESC"#
        );
        assert_eq!(
            sql(&reordered),
            r#"SELECT * FROM "orders" ORDER BY "id" ASC, "customer" ASC, "total" DESC"#
        );
    }

    #[test]
    fn test_terminals_wrap_the_sequence() {
        let count = node(ExpressionNode::Count { source: table() });
        let any = node(ExpressionNode::Any { source: table() });
        let sum = node(ExpressionNode::Aggregate {
            source: table(),
            function: AggregateFunction::Sum,
            key: field("total"),
        });
        let single = node(ExpressionNode::Single { source: table() });

        assert_eq!(sql(&count), r#"SELECT COUNT(*) FROM (SELECT * FROM "orders")"#);
        assert_eq!(sql(&any), r#"SELECT EXISTS (SELECT * FROM "orders")"#);
        assert_eq!(sql(&sum), r#"SELECT SUM("total") FROM (SELECT * FROM "orders")"#);
        assert_eq!(sql(&single), r#"SELECT * FROM "orders" LIMIT ?"#);
        assert_eq!(compile(&single).unwrap().shape, ResultShape::Single);
    }

    #[test]
    fn test_projection_and_literals() {
        let projected = node(ExpressionNode::Select {
            source: table(),
            projection: Projection::new()
                .field("customer")
                .column("doubled", field("total").mul(2)),
            element: crate::expression::ElementType::of::<Order>(),
        });
        let filtered = node(ExpressionNode::Filter {
            source: projected,
            predicate: field("customer").is_in(["a", "b"]).and(field("doubled").ne(JsonValue::Null)),
        });

        assert_eq!(
            sql(&filtered),
            r#"SELECT * FROM (SELECT "customer" AS "customer", ("total" * ?) AS "doubled" FROM "orders") WHERE (("customer" IN (?, ?)) AND ("doubled" != NULL))"#
        );
    }

    fn summary(source: Expression) -> Expression {
        node(ExpressionNode::Select {
            source,
            projection: Projection::new().field("customer").field("total"),
            element: crate::expression::ElementType::of::<Order>(),
        })
    }

    #[test]
    fn test_order_over_projection_keeps_earlier_keys() {
        let newest = node(ExpressionNode::OrderBy {
            source: table(),
            key: field("id"),
            direction: OrderDirection::Desc,
            then: false,
        });
        let by_customer = node(ExpressionNode::OrderBy {
            source: summary(newest),
            key: field("customer"),
            direction: OrderDirection::Asc,
            then: false,
        });

        assert_eq!(
            sql(&by_customer),
            r#"SELECT "customer" AS "customer", "total" AS "total" FROM "orders" ORDER BY "customer" ASC, "id" DESC"#
        );
    }

    #[test]
    fn test_order_by_computed_column_orders_by_its_expression() {
        let projected = node(ExpressionNode::Select {
            source: table(),
            projection: Projection::new().column("doubled", field("total").mul(2)),
            element: crate::expression::ElementType::of::<Order>(),
        });
        let ordered = node(ExpressionNode::OrderBy {
            source: projected,
            key: field("doubled"),
            direction: OrderDirection::Desc,
            then: false,
        });

        assert_eq!(
            sql(&ordered),
            r#"SELECT ("total" * ?) AS "doubled" FROM "orders" ORDER BY ("total" * ?) DESC"#
        );
    }

    #[test]
    fn test_subquery_over_projection_repeats_exposed_keys() {
        let ordered = node(ExpressionNode::OrderBy {
            source: table(),
            key: field("customer"),
            direction: OrderDirection::Asc,
            then: false,
        });
        let then = node(ExpressionNode::OrderBy {
            source: ordered,
            key: field("id"),
            direction: OrderDirection::Asc,
            then: true,
        });
        let filtered = node(ExpressionNode::Filter {
            source: summary(then),
            predicate: field("total").gt(100),
        });

        assert_eq!(
            sql(&filtered),
            r#"SELECT * FROM (SELECT "customer" AS "customer", "total" AS "total" FROM "orders" ORDER BY "customer" ASC, "id" ASC) WHERE ("total" > ?) ORDER BY "customer" ASC"#
        );
    }

    #[test]
    fn test_order_over_paged_projection_still_wraps() {
        let taken = node(ExpressionNode::Take {
            source: summary(table()),
            count: 3,
        });
        let ordered = node(ExpressionNode::OrderBy {
            source: taken,
            key: field("customer"),
            direction: OrderDirection::Asc,
            then: false,
        });

        assert_eq!(
            sql(&ordered),
            r#"SELECT * FROM (SELECT "customer" AS "customer", "total" AS "total" FROM "orders" LIMIT ?) ORDER BY "customer" ASC"#
        );
    }

    #[test]
    fn test_empty_in_list_propagates_null() {
        let filtered = node(ExpressionNode::Filter {
            source: table(),
            predicate: field("status").is_in(Vec::<String>::new()).not(),
        });

        assert_eq!(
            sql(&filtered),
            r#"SELECT * FROM "orders" WHERE (NOT (CASE WHEN "status" IS NULL THEN NULL ELSE 0 END))"#
        );
    }

    #[test]
    fn test_unbound_placeholder_is_rejected() {
        let placeholder = Expression::placeholder(Uuid::new_v4(), EntityDescriptor::of::<Order>());
        assert!(matches!(compile(&placeholder), Err(QueryError::Unsupported(_))));
    }

    #[test]
    fn test_identifiers_are_escaped() {
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }
}
