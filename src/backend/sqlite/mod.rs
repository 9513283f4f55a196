//! SQLite backend
//!
//! Every context is one fresh `SqliteConnection`, opened for a single terminal
//! operation and closed when the context (or the enumeration that owns it) is
//! dropped. Rewritten expression trees are compiled to SQL by [`compile`] and
//! rows come back as records decoded column by column.

pub(crate) mod bridge;
pub(crate) mod compile;

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{Number, Value as JsonValue};
use sqlx::{
    Column, Connection, Executor, Row, SqliteConnection, TypeInfo, ValueRef,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use self::bridge::BlockingBridge;
use self::compile::{CompiledQuery, ResultShape, SelectStatement, compile, compile_sequence};
use super::native_source;
use crate::cancel::Cancellation;
use crate::config::{DEFAULT_PAGE_SIZE, ProviderConfig};
use crate::context::{ContextFactory, QueryContext, RecordIter, RecordStream};
use crate::error::{QueryError, Result};
use crate::expression::{Constant, EntityDescriptor, Expression, NativeSource};
use crate::record::Record;

pub const BACKEND: &str = "sqlite";

/// Opens one SQLite connection per terminal operation
#[derive(Debug, Clone)]
pub struct SqliteContextFactory {
    options: SqliteConnectOptions,
    page_size: usize,
    acquire_timeout: Duration,
}

impl SqliteContextFactory {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self {
            options,
            page_size: DEFAULT_PAGE_SIZE,
            acquire_timeout: ProviderConfig::default().acquire_timeout(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.connect_options()?)
            .with_page_size(config.page_size)
            .with_acquire_timeout(config.acquire_timeout()))
    }

    /// Factory configured from `DEFERRED_QUERY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(&ProviderConfig::from_env()?)
    }

    /// Rows fetched per round trip while enumerating
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn options(&self) -> &SqliteConnectOptions {
        &self.options
    }

    /// Open a connection with the factory's options, bounded by the acquire timeout
    #[instrument(level = "debug", skip(self), err)]
    pub async fn connect(&self) -> Result<SqliteConnection> {
        match tokio::time::timeout(self.acquire_timeout, SqliteConnection::connect_with(&self.options)).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(QueryError::Timeout(self.acquire_timeout)),
        }
    }
}

#[async_trait]
impl ContextFactory for SqliteContextFactory {
    type Context = SqliteContext;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn create(&self) -> Result<SqliteContext> {
        let bridge = BlockingBridge::current()?;
        let connection = bridge.block_on(self.connect())?;
        Ok(SqliteContext::new(connection, Some(bridge), self.page_size))
    }

    async fn create_async(&self, _cancel: &Cancellation) -> Result<SqliteContext> {
        let connection = self.connect().await?;
        Ok(SqliteContext::new(connection, None, self.page_size))
    }
}

/// One open connection acting as the native query engine for one operation
pub struct SqliteContext {
    id: Uuid,
    connection: SqliteConnection,
    bridge: Option<BlockingBridge>,
    page_size: usize,
}

impl SqliteContext {
    fn new(connection: SqliteConnection, bridge: Option<BlockingBridge>, page_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            bridge,
            page_size,
        }
    }

    fn bridge(&mut self) -> Result<BlockingBridge> {
        if let Some(bridge) = &self.bridge {
            return Ok(bridge.clone());
        }
        let bridge = BlockingBridge::current()?;
        self.bridge = Some(bridge.clone());
        Ok(bridge)
    }

    #[instrument(level = "debug", skip_all, fields(context = %self.id))]
    async fn run(&mut self, expression: &Expression) -> Result<JsonValue> {
        native_source(expression, BACKEND, self.id)?;
        let CompiledQuery { mut builder, shape } = compile(expression)?;
        debug!(sql = builder.sql(), "executing compiled query");
        let rows = builder.build().fetch_all(&mut self.connection).await?;
        shape_rows(shape, &rows)
    }

    fn into_cursor(self, expression: &Expression) -> Result<PageCursor> {
        native_source(expression, BACKEND, self.id)?;
        let statement = compile_sequence(expression)?;
        Ok(PageCursor {
            connection: self.connection,
            statement,
            page_size: self.page_size,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            reading: false,
        })
    }
}

#[async_trait]
impl QueryContext for SqliteContext {
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

    fn execute(&mut self, expression: &Expression) -> Result<JsonValue> {
        let bridge = self.bridge()?;
        bridge.block_on(self.run(expression))
    }

    async fn execute_async(&mut self, expression: &Expression) -> Result<JsonValue> {
        self.run(expression).await
    }

    fn into_records(mut self, expression: Expression) -> Result<RecordIter> {
        let bridge = self.bridge()?;
        let cursor = self.into_cursor(&expression)?;
        Ok(Box::new(SqliteRecords { cursor, bridge }))
    }

    fn into_record_stream(self, expression: Expression) -> Result<RecordStream> {
        let cursor = self.into_cursor(&expression)?;
        let records = stream::try_unfold(cursor, |mut cursor| async move {
            if cursor.needs_page() {
                cursor.fetch_page().await?;
            }
            let next = cursor.buffer.pop_front();
            Ok::<_, QueryError>(next.map(|record| (record, cursor)))
        });
        Ok(Box::pin(records))
    }
}

/// Page-by-page reader over a compiled sequence, owning its connection
///
/// All pages are read inside one read transaction, so writes committed by
/// other connections mid-enumeration do not shift the offsets. The
/// transaction is committed once the last page is read; dropping the cursor
/// early closes the connection, which rolls it back.
struct PageCursor {
    connection: SqliteConnection,
    statement: SelectStatement,
    page_size: usize,
    offset: u64,
    buffer: VecDeque<Record>,
    exhausted: bool,
    reading: bool,
}

impl PageCursor {
    fn needs_page(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted
    }

    async fn fetch_page(&mut self) -> Result<()> {
        if !self.reading {
            (&mut self.connection).execute(sqlx::raw_sql("BEGIN")).await?;
            self.reading = true;
        }

        let page = self.statement.clone().skip(self.offset).take(self.page_size as u64);
        let mut builder = page.build();
        let rows = (&mut self.connection).fetch_all(builder.build()).await?;
        trace!(offset = self.offset, fetched = rows.len(), "fetched page");

        self.exhausted = rows.len() < self.page_size;
        self.offset += rows.len() as u64;
        for row in &rows {
            self.buffer.push_back(decode_row(row)?);
        }

        if self.exhausted {
            (&mut self.connection).execute(sqlx::raw_sql("COMMIT")).await?;
            self.reading = false;
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.exhausted = true;
        self.buffer.clear();
    }
}

/// Synchronous record iterator driving a [`PageCursor`] through the bridge
struct SqliteRecords {
    cursor: PageCursor,
    bridge: BlockingBridge,
}

impl Iterator for SqliteRecords {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.needs_page() {
            if let Err(err) = self.bridge.block_on(self.cursor.fetch_page()) {
                self.cursor.fail();
                return Some(Err(err));
            }
        }
        self.cursor.buffer.pop_front().map(Ok)
    }
}

fn shape_rows(shape: ResultShape, rows: &[SqliteRow]) -> Result<JsonValue> {
    match shape {
        ResultShape::Rows => Ok(JsonValue::Array(
            rows.iter()
                .map(|row| decode_row(row).map(JsonValue::Object))
                .collect::<Result<_>>()?,
        )),
        ResultShape::Value => match rows.first() {
            Some(row) => match row.columns().first() {
                Some(column) => column_value(row, column.ordinal(), column.type_info().name()),
                None => Ok(JsonValue::Null),
            },
            None => Ok(JsonValue::Null),
        },
        ResultShape::First { or_default } => match rows.first() {
            Some(row) => Ok(JsonValue::Object(decode_row(row)?)),
            None if or_default => Ok(JsonValue::Null),
            None => Err(QueryError::NoElements),
        },
        ResultShape::Single => match rows {
            [row] => Ok(JsonValue::Object(decode_row(row)?)),
            [] => Err(QueryError::NoElements),
            _ => Err(QueryError::MoreThanOneElement),
        },
    }
}

/// Decode every column of `row` by its storage class
fn decode_row(row: &SqliteRow) -> Result<Record> {
    row.columns()
        .iter()
        .map(|column| {
            let value = column_value(row, column.ordinal(), column.type_info().name())?;
            Ok((column.name().to_string(), value))
        })
        .collect()
}

fn column_value(row: &SqliteRow, index: usize, declared: &str) -> Result<JsonValue> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" if declared.eq_ignore_ascii_case("BOOLEAN") => {
            JsonValue::Bool(row.try_get_unchecked::<bool, _>(index)?)
        }
        "INTEGER" | "BOOLEAN" | "INT" => JsonValue::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?).map_or(JsonValue::Null, JsonValue::Number),
        "BLOB" => JsonValue::from(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => JsonValue::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}
