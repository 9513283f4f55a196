//! In-process document store backend
//!
//! Collections are vectors of records behind copy-on-write `Arc`s, so opening
//! a context is cheap and every operation sees a consistent snapshot of each
//! collection it reads.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{Number, Value as JsonValue};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{native_source, ordering};
use crate::cancel::Cancellation;
use crate::context::{ContextFactory, QueryContext, RecordIter, RecordStream};
use crate::error::{QueryError, Result};
use crate::expression::{
    AggregateFunction, ArithmeticOperator, ConditionOperator, Constant, Entity, EntityDescriptor,
    Expression, ExpressionNode, LogicalOperator, NativeSource, OrderDirection, Projection, Scalar,
};
use crate::record::{Record, compare, is_truthy, like, sort_cmp};

pub const BACKEND: &str = "memory";

/// Named collections of records shared by every context of a factory
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    collections: Arc<RwLock<HashMap<String, Arc<Vec<Record>>>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entity` in its collection
    pub fn insert<E: Entity>(&self, entity: &E) -> Result<()> {
        self.insert_many(std::slice::from_ref(entity))
    }

    pub fn insert_many<E: Entity>(&self, entities: &[E]) -> Result<()> {
        let records = entities
            .iter()
            .map(|entity| match serde_json::to_value(entity)? {
                JsonValue::Object(record) => Ok(record),
                other => Err(QueryError::unsupported(format!(
                    "entities of `{}` must serialize to objects, got {other}",
                    E::SOURCE
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        self.insert_records(E::SOURCE, records);
        Ok(())
    }

    /// Append raw records to `collection`
    pub fn insert_records(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let entry = collections.entry(collection.to_string()).or_default();
        let before = entry.len();
        Arc::make_mut(entry).extend(records);
        debug!(collection, inserted = entry.len() - before, "inserted documents");
    }

    /// Current contents of `collection`; empty when it does not exist
    pub fn snapshot(&self, collection: &str) -> Arc<Vec<Record>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.snapshot(collection).len()
    }

    pub fn clear(&self, collection: &str) {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection);
    }
}

/// Opens a [`MemoryContext`] over a shared [`DocumentStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryContextFactory {
    store: DocumentStore,
}

impl MemoryContextFactory {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }
}

#[async_trait]
impl ContextFactory for MemoryContextFactory {
    type Context = MemoryContext;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn create(&self) -> Result<MemoryContext> {
        Ok(MemoryContext {
            id: Uuid::new_v4(),
            store: self.store.clone(),
            snapshots: HashMap::new(),
        })
    }

    async fn create_async(&self, _cancel: &Cancellation) -> Result<MemoryContext> {
        self.create()
    }
}

/// One operation's view of the document store
///
/// The first read of a collection pins its snapshot for the rest of the
/// context's life.
#[derive(Debug)]
pub struct MemoryContext {
    id: Uuid,
    store: DocumentStore,
    snapshots: HashMap<String, Arc<Vec<Record>>>,
}

impl MemoryContext {
    fn collection(&mut self, name: &str) -> Arc<Vec<Record>> {
        if let Some(snapshot) = self.snapshots.get(name) {
            return snapshot.clone();
        }
        let snapshot = self.store.snapshot(name);
        self.snapshots.insert(name.to_string(), snapshot.clone());
        snapshot
    }

    /// Evaluate a sequence expression into its records
    fn rows(&mut self, expression: &Expression) -> Result<Vec<Record>> {
        match expression.node() {
            ExpressionNode::Constant(Constant::Native(_)) => {
                let source = native_source(expression, BACKEND, self.id)?;
                Ok(self.collection(&source.name).as_ref().clone())
            }
            ExpressionNode::Constant(Constant::Placeholder(_)) => {
                Err(QueryError::unsupported("expression has not been bound to a source"))
            }
            ExpressionNode::Filter { source, predicate } => {
                let mut kept = Vec::new();
                for record in self.rows(source)? {
                    if is_truthy(&evaluate(predicate, &record)?) {
                        kept.push(record);
                    }
                }
                Ok(kept)
            }
            ExpressionNode::OrderBy { .. } => {
                let (input, keys) = ordering(expression)?;
                sort_records(self.rows(&input)?, &keys)
            }
            ExpressionNode::Skip { source, count } => {
                Ok(self.rows(source)?.into_iter().skip(to_usize(*count)).collect())
            }
            ExpressionNode::Take { source, count } => {
                Ok(self.rows(source)?.into_iter().take(to_usize(*count)).collect())
            }
            ExpressionNode::Distinct { source } => {
                let mut seen = HashSet::new();
                let mut unique = Vec::new();
                for record in self.rows(source)? {
                    if seen.insert(serde_json::to_string(&record)?) {
                        unique.push(record);
                    }
                }
                Ok(unique)
            }
            ExpressionNode::Select { source, projection, .. } => self
                .rows(source)?
                .iter()
                .map(|record| project(projection, record))
                .collect(),
            _ => Err(QueryError::NotASequence(expression.to_string())),
        }
    }

    fn evaluate_terminal(&mut self, expression: &Expression) -> Result<JsonValue> {
        match expression.node() {
            ExpressionNode::Count { source } => Ok(JsonValue::from(self.rows(source)?.len())),
            ExpressionNode::Any { source } => Ok(JsonValue::Bool(!self.rows(source)?.is_empty())),
            ExpressionNode::First { source, or_default } => match self.rows(source)?.into_iter().next() {
                Some(record) => Ok(JsonValue::Object(record)),
                None if *or_default => Ok(JsonValue::Null),
                None => Err(QueryError::NoElements),
            },
            ExpressionNode::Single { source } => {
                let mut rows = self.rows(source)?.into_iter();
                match (rows.next(), rows.next()) {
                    (Some(record), None) => Ok(JsonValue::Object(record)),
                    (None, _) => Err(QueryError::NoElements),
                    (Some(_), Some(_)) => Err(QueryError::MoreThanOneElement),
                }
            }
            ExpressionNode::Aggregate { source, function, key } => {
                let values = self
                    .rows(source)?
                    .iter()
                    .map(|record| evaluate(key, record))
                    .collect::<Result<Vec<_>>>()?;
                Ok(aggregate(*function, values))
            }
            _ => Ok(JsonValue::Array(
                self.rows(expression)?.into_iter().map(JsonValue::Object).collect(),
            )),
        }
    }
}

#[async_trait]
impl QueryContext for MemoryContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn source(&self, entity: &EntityDescriptor) -> Result<Expression> {
        Ok(Expression::constant(Constant::Native(NativeSource {
            backend: BACKEND,
            name: entity.source.to_string(),
            entity: *entity,
            context_id: self.id,
        })))
    }

    #[instrument(level = "trace", skip_all, fields(context = %self.id))]
    fn execute(&mut self, expression: &Expression) -> Result<JsonValue> {
        self.evaluate_terminal(expression)
    }

    async fn execute_async(&mut self, expression: &Expression) -> Result<JsonValue> {
        self.evaluate_terminal(expression)
    }

    fn into_records(mut self, expression: Expression) -> Result<RecordIter> {
        let rows = self.rows(&expression)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn into_record_stream(mut self, expression: Expression) -> Result<RecordStream> {
        let rows = self.rows(&expression)?;
        Ok(Box::pin(stream::iter(rows.into_iter().map(Ok))))
    }
}

fn to_usize(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

fn sort_records(records: Vec<Record>, keys: &[(Scalar, OrderDirection)]) -> Result<Vec<Record>> {
    let mut keyed = records
        .into_iter()
        .map(|record| {
            let values = keys
                .iter()
                .map(|(key, _)| evaluate(key, &record))
                .collect::<Result<Vec<_>>>()?;
            Ok((values, record))
        })
        .collect::<Result<Vec<_>>>()?;

    keyed.sort_by(|(left, _), (right, _)| {
        keys.iter()
            .zip(left.iter().zip(right))
            .map(|((_, direction), (l, r))| match direction {
                OrderDirection::Asc => sort_cmp(l, r),
                OrderDirection::Desc => sort_cmp(r, l),
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(keyed.into_iter().map(|(_, record)| record).collect())
}

fn project(projection: &Projection, record: &Record) -> Result<Record> {
    if projection.is_empty() {
        return Err(QueryError::unsupported("select requires at least one column"));
    }
    projection
        .columns()
        .iter()
        .map(|(alias, value)| Ok((alias.clone(), evaluate(value, record)?)))
        .collect()
}

/// Evaluate a scalar against one record with SQL NULL semantics
pub(crate) fn evaluate(scalar: &Scalar, record: &Record) -> Result<JsonValue> {
    let value = match scalar {
        Scalar::Field(name) => record.get(name).cloned().unwrap_or(JsonValue::Null),
        Scalar::Literal(value) => value.clone(),
        Scalar::Compare { left, op, right } => {
            let (left, right) = (evaluate(left, record)?, evaluate(right, record)?);
            match compare(&left, &right) {
                Some(ordering) => JsonValue::Bool(match op {
                    ConditionOperator::Equal => ordering.is_eq(),
                    ConditionOperator::NotEqual => ordering.is_ne(),
                    ConditionOperator::GreaterThan => ordering.is_gt(),
                    ConditionOperator::GreaterThanOrEqual => ordering.is_ge(),
                    ConditionOperator::LessThan => ordering.is_lt(),
                    ConditionOperator::LessThanOrEqual => ordering.is_le(),
                }),
                None => JsonValue::Null,
            }
        }
        Scalar::Logical { left, op, right } => {
            let (left, right) = (truth(&evaluate(left, record)?), truth(&evaluate(right, record)?));
            let result = match op {
                LogicalOperator::And => match (left, right) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                },
                LogicalOperator::Or => match (left, right) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                },
            };
            result.map_or(JsonValue::Null, JsonValue::Bool)
        }
        Scalar::Arithmetic { left, op, right } => arithmetic(*op, &evaluate(left, record)?, &evaluate(right, record)?),
        Scalar::Not(inner) => truth(&evaluate(inner, record)?).map_or(JsonValue::Null, |b| JsonValue::Bool(!b)),
        Scalar::IsNull(inner) => JsonValue::Bool(evaluate(inner, record)?.is_null()),
        Scalar::IsNotNull(inner) => JsonValue::Bool(!evaluate(inner, record)?.is_null()),
        Scalar::Like { expr, pattern } => match evaluate(expr, record)? {
            JsonValue::Null => JsonValue::Null,
            JsonValue::String(text) => JsonValue::Bool(like(&text, pattern)),
            other => JsonValue::Bool(like(&other.to_string(), pattern)),
        },
        Scalar::In { expr, values } => {
            let value = evaluate(expr, record)?;
            if value.is_null() {
                JsonValue::Null
            } else {
                JsonValue::Bool(values.iter().any(|candidate| compare(&value, candidate).is_some_and(|o| o.is_eq())))
            }
        }
    };
    Ok(value)
}

fn truth(value: &JsonValue) -> Option<bool> {
    if value.is_null() { None } else { Some(is_truthy(value)) }
}

fn arithmetic(op: ArithmeticOperator, left: &JsonValue, right: &JsonValue) -> JsonValue {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            ArithmeticOperator::Add => a.checked_add(b),
            ArithmeticOperator::Subtract => a.checked_sub(b),
            ArithmeticOperator::Multiply => a.checked_mul(b),
            // Integer division truncates; division by zero yields NULL
            ArithmeticOperator::Divide => a.checked_div(b),
        };
        if let Some(result) = result {
            return JsonValue::from(result);
        }
        if matches!(op, ArithmeticOperator::Divide) {
            return JsonValue::Null;
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return JsonValue::Null;
    };
    let result = match op {
        ArithmeticOperator::Add => a + b,
        ArithmeticOperator::Subtract => a - b,
        ArithmeticOperator::Multiply => a * b,
        ArithmeticOperator::Divide if b == 0.0 => return JsonValue::Null,
        ArithmeticOperator::Divide => a / b,
    };
    Number::from_f64(result).map_or(JsonValue::Null, JsonValue::Number)
}

/// SQL aggregate over evaluated values; NULLs are ignored
fn aggregate(function: AggregateFunction, values: Vec<JsonValue>) -> JsonValue {
    let values: Vec<JsonValue> = values.into_iter().filter(|value| !value.is_null()).collect();
    match function {
        AggregateFunction::Count => JsonValue::from(values.len()),
        AggregateFunction::Sum => {
            if values.is_empty() {
                return JsonValue::Null;
            }
            let integers: Option<Vec<i64>> = values.iter().map(JsonValue::as_i64).collect();
            if let Some(total) = integers.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
                return JsonValue::from(total);
            }
            let total: f64 = values.iter().filter_map(JsonValue::as_f64).sum();
            Number::from_f64(total).map_or(JsonValue::Null, JsonValue::Number)
        }
        AggregateFunction::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(JsonValue::as_f64).collect();
            if numbers.is_empty() {
                return JsonValue::Null;
            }
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Number::from_f64(mean).map_or(JsonValue::Null, JsonValue::Number)
        }
        AggregateFunction::Min => values.into_iter().min_by(sort_cmp).unwrap_or(JsonValue::Null),
        AggregateFunction::Max => values.into_iter().max_by(sort_cmp).unwrap_or(JsonValue::Null),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::expression::{field, lit};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: i64,
        title: String,
        score: Option<i64>,
    }

    impl Entity for Note {
        const SOURCE: &'static str = "notes";
    }

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn bound(context: &MemoryContext) -> Expression {
        context.source(&EntityDescriptor::of::<Note>()).unwrap()
    }

    fn store() -> DocumentStore {
        let store = DocumentStore::new();
        store
            .insert_many(&[
                Note { id: 1, title: "alpha".into(), score: Some(5) },
                Note { id: 2, title: "beta".into(), score: None },
                Note { id: 3, title: "gamma".into(), score: Some(9) },
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_null_comparisons_are_unknown() {
        let row = record(json!({"score": null}));
        assert_eq!(evaluate(&field("score").gt(1), &row).unwrap(), JsonValue::Null);
        assert_eq!(evaluate(&field("score").gt(1).not(), &row).unwrap(), JsonValue::Null);
        assert_eq!(evaluate(&field("score").is_null(), &row).unwrap(), json!(true));
        // unknown OR true is true, unknown AND false is false
        assert_eq!(evaluate(&field("score").gt(1).or(lit(true)), &row).unwrap(), json!(true));
        assert_eq!(evaluate(&field("score").gt(1).and(lit(false)), &row).unwrap(), json!(false));
    }

    #[test]
    fn test_arithmetic_follows_sql() {
        let row = record(json!({"a": 7, "b": 2, "c": 0.5}));
        assert_eq!(evaluate(&field("a").div(field("b")), &row).unwrap(), json!(3));
        assert_eq!(evaluate(&field("a").mul(field("c")), &row).unwrap(), json!(3.5));
        assert_eq!(evaluate(&field("a").div(0), &row).unwrap(), JsonValue::Null);
    }

    #[test]
    fn test_filter_order_and_page() {
        let mut context = MemoryContextFactory::new(store()).create().unwrap();
        let base = bound(&context);
        let filtered = Expression::new(ExpressionNode::Filter {
            source: base,
            predicate: field("id").gt(1),
        });
        let ordered = Expression::new(ExpressionNode::OrderBy {
            source: filtered,
            key: field("id"),
            direction: OrderDirection::Desc,
            then: false,
        });
        let taken = Expression::new(ExpressionNode::Take { source: ordered, count: 1 });

        let rows = context.rows(&taken).unwrap();
        assert_eq!(rows, vec![record(json!({"id": 3, "title": "gamma", "score": 9}))]);
    }

    #[test]
    fn test_then_by_requires_order_by() {
        let mut context = MemoryContextFactory::new(store()).create().unwrap();
        let then = Expression::new(ExpressionNode::OrderBy {
            source: bound(&context),
            key: field("id"),
            direction: OrderDirection::Asc,
            then: true,
        });
        assert!(matches!(context.rows(&then), Err(QueryError::Unsupported(_))));
    }

    #[test]
    fn test_aggregates_ignore_nulls() {
        let mut context = MemoryContextFactory::new(store()).create().unwrap();
        let aggregate_of = |function| {
            Expression::new(ExpressionNode::Aggregate {
                source: bound(&context),
                function,
                key: field("score"),
            })
        };
        let sum = aggregate_of(AggregateFunction::Sum);
        let avg = aggregate_of(AggregateFunction::Avg);
        let count = aggregate_of(AggregateFunction::Count);
        let max = aggregate_of(AggregateFunction::Max);

        assert_eq!(context.execute(&sum).unwrap(), json!(14));
        assert_eq!(context.execute(&avg).unwrap(), json!(7.0));
        assert_eq!(context.execute(&count).unwrap(), json!(2));
        assert_eq!(context.execute(&max).unwrap(), json!(9));
    }

    #[test]
    fn test_snapshot_is_pinned_per_context() {
        let store = store();
        let mut context = MemoryContextFactory::new(store.clone()).create().unwrap();
        let count = Expression::new(ExpressionNode::Count { source: bound(&context) });

        assert_eq!(context.execute(&count).unwrap(), json!(3));
        store
            .insert(&Note { id: 4, title: "delta".into(), score: None })
            .unwrap();
        assert_eq!(context.execute(&count).unwrap(), json!(3));
        assert_eq!(store.len("notes"), 4);
    }

    #[test]
    fn test_rejects_source_of_another_context() {
        let factory = MemoryContextFactory::new(store());
        let other = factory.create().unwrap();
        let mut context = factory.create().unwrap();
        let count = Expression::new(ExpressionNode::Count { source: bound(&other) });

        assert!(matches!(context.execute(&count), Err(QueryError::Unsupported(_))));
    }
}
