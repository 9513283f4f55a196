//! Shared fixtures for provider tests
//!
//! Test data generators, backends with known contents, and lease assertions.

mod repository_tests;

/// Test data generators
pub mod generators {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    use crate::expression::Entity;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Order {
        pub id: i64,
        pub customer: String,
        pub total: f64,
        pub date: NaiveDate,
        pub status: String,
    }

    impl Entity for Order {
        const SOURCE: &'static str = "orders";
    }

    /// Projection of an order onto who paid what
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrderSummary {
        pub customer: String,
        pub total: f64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Customer {
        pub customer: String,
    }

    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// Generate a test order
    pub fn order(id: i64, customer: &str, total: f64, date: NaiveDate, status: &str) -> Order {
        Order {
            id,
            customer: customer.to_string(),
            total,
            date,
            status: status.to_string(),
        }
    }

    /// The fixed order book every backend is seeded with
    pub fn orders() -> Vec<Order> {
        vec![
            order(1, "alice", 250.0, date(2024, 3, 1), "shipped"),
            order(2, "bob", 80.0, date(2024, 3, 5), "pending"),
            order(3, "carol", 120.5, date(2024, 2, 20), "shipped"),
            order(4, "alice", 99.99, date(2024, 3, 10), "cancelled"),
            order(5, "dave", 310.0, date(2024, 1, 15), "pending"),
            order(6, "bob", 101.0, date(2024, 3, 12), "shipped"),
        ]
    }

    /// Ids of orders with a total above 100, newest first
    pub fn large_orders_newest_first() -> Vec<i64> {
        vec![6, 1, 3, 5]
    }
}

/// Backends with known contents
pub mod fixtures {
    use std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use futures_util::{StreamExt, stream};
    use serde_json::Value as JsonValue;
    use sqlx::{
        Connection,
        sqlite::{SqliteConnectOptions, SqliteJournalMode},
    };
    use uuid::Uuid;

    use super::generators::{Order, orders};
    use crate::backend::memory::{DocumentStore, MemoryContext, MemoryContextFactory};
    use crate::backend::sqlite::SqliteContextFactory;
    use crate::cancel::Cancellation;
    use crate::context::{ContextFactory, QueryContext, RecordIter, RecordStream};
    use crate::error::{QueryError, Result};
    use crate::expression::{EntityDescriptor, Expression};
    use crate::provider::DeferredQueryProvider;

    const SCHEMA: &str = r#"
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer TEXT NOT NULL,
            total REAL NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL
        );
    "#;

    pub fn init_logging() {
        let _ = crate::logging::try_init();
    }

    /// A document store holding [`orders`]
    pub fn order_store() -> DocumentStore {
        let store = DocumentStore::new();
        store.insert_many(&orders()).unwrap();
        store
    }

    pub fn memory_provider() -> Arc<DeferredQueryProvider<MemoryContextFactory>> {
        init_logging();
        DeferredQueryProvider::new(MemoryContextFactory::new(order_store()))
    }

    /// A seeded SQLite database file, removed on drop
    pub struct TestDatabase {
        path: PathBuf,
    }

    impl TestDatabase {
        pub async fn new() -> Result<Self> {
            init_logging();
            let database = Self {
                path: std::env::temp_dir().join(format!("deferred-query-{}.db", Uuid::new_v4())),
            };

            let mut connection = database.factory().connect().await?;
            sqlx::raw_sql(SCHEMA).execute(&mut connection).await?;
            connection.close().await?;
            for order in orders() {
                database.insert(&order).await?;
            }
            Ok(database)
        }

        /// Insert one order through a connection of its own
        pub async fn insert(&self, order: &Order) -> Result<()> {
            let mut connection = self.factory().connect().await?;
            sqlx::query("INSERT INTO orders (id, customer, total, date, status) VALUES (?, ?, ?, ?, ?)")
                .bind(order.id)
                .bind(&order.customer)
                .bind(order.total)
                .bind(order.date)
                .bind(&order.status)
                .execute(&mut connection)
                .await?;
            connection.close().await?;
            Ok(())
        }

        /// Seed a database from synchronous code
        pub fn blocking() -> Result<Self> {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(Self::new())
        }

        /// Factory with a small page size so enumerations span several pages
        pub fn factory(&self) -> SqliteContextFactory {
            let options = SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqliteContextFactory::new(options).with_page_size(4)
        }

        pub fn provider(&self) -> Arc<DeferredQueryProvider<SqliteContextFactory>> {
            DeferredQueryProvider::new(self.factory())
        }
    }

    impl Drop for TestDatabase {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.path.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Factory whose every attempt to open a context fails
    #[derive(Debug, Default)]
    pub struct FailingFactory {
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl ContextFactory for FailingFactory {
        type Context = MemoryContext;

        fn backend(&self) -> &'static str {
            "failing"
        }

        fn create(&self) -> Result<MemoryContext> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(QueryError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "backend unavailable",
            )))
        }

        async fn create_async(&self, _cancel: &Cancellation) -> Result<MemoryContext> {
            self.create()
        }
    }

    fn connection_lost() -> QueryError {
        QueryError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection lost mid-enumeration",
        ))
    }

    /// Memory backend whose enumerations fail after `yielded` records
    #[derive(Debug)]
    pub struct InterruptedFactory {
        inner: MemoryContextFactory,
        yielded: usize,
    }

    impl InterruptedFactory {
        pub fn after(yielded: usize) -> Self {
            Self {
                inner: MemoryContextFactory::new(order_store()),
                yielded,
            }
        }
    }

    #[async_trait]
    impl ContextFactory for InterruptedFactory {
        type Context = InterruptedContext;

        fn backend(&self) -> &'static str {
            self.inner.backend()
        }

        fn create(&self) -> Result<InterruptedContext> {
            Ok(InterruptedContext {
                inner: self.inner.create()?,
                yielded: self.yielded,
            })
        }

        async fn create_async(&self, cancel: &Cancellation) -> Result<InterruptedContext> {
            Ok(InterruptedContext {
                inner: self.inner.create_async(cancel).await?,
                yielded: self.yielded,
            })
        }
    }

    pub struct InterruptedContext {
        inner: MemoryContext,
        yielded: usize,
    }

    #[async_trait]
    impl QueryContext for InterruptedContext {
        fn id(&self) -> Uuid {
            self.inner.id()
        }

        fn source(&self, entity: &EntityDescriptor) -> Result<Expression> {
            self.inner.source(entity)
        }

        fn execute(&mut self, expression: &Expression) -> Result<JsonValue> {
            self.inner.execute(expression)
        }

        async fn execute_async(&mut self, expression: &Expression) -> Result<JsonValue> {
            self.inner.execute_async(expression).await
        }

        fn into_records(self, expression: Expression) -> Result<RecordIter> {
            let records = self.inner.into_records(expression)?;
            Ok(Box::new(records.take(self.yielded).chain(std::iter::once(Err(connection_lost())))))
        }

        fn into_record_stream(self, expression: Expression) -> Result<RecordStream> {
            let records = self.inner.into_record_stream(expression)?;
            let lost = stream::once(async { Err(connection_lost()) });
            Ok(Box::pin(records.take(self.yielded).chain(lost)))
        }
    }
}

/// Lease assertions
pub mod assertions {
    use crate::context::LeaseTracker;

    /// Assert `acquired` contexts were opened and every one was released
    pub fn assert_balanced(leases: &LeaseTracker, acquired: u64) {
        assert_eq!(leases.acquired(), acquired, "contexts acquired");
        assert_eq!(leases.released(), acquired, "contexts released");
        assert_eq!(leases.active(), 0, "contexts still open");
    }
}
