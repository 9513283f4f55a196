use crate::backend::memory::MemoryContextFactory;
use crate::cancel::Cancellation;
use crate::error::Result;
use crate::expression::field;
use crate::repository::{QueryRepository, RepositoryFactory};

use super::assertions::assert_balanced;
use super::fixtures::{TestDatabase, order_store};
use super::generators::Order;

fn factory() -> RepositoryFactory<MemoryContextFactory> {
    super::fixtures::init_logging();
    RepositoryFactory::new(MemoryContextFactory::new(order_store()))
}

#[test]
fn test_repository_hands_out_deferred_queries() -> Result<()> {
    let factory = factory();
    let orders = factory.repository::<Order>();

    let pending = orders.find(field("status").eq("pending"));
    assert_eq!(factory.provider().leases().acquired(), 0);

    let ids: Vec<i64> = pending.order_by(field("id")).to_list()?.into_iter().map(|o| o.id).collect();
    assert_eq!(ids, vec![2, 5]);
    assert_balanced(factory.provider().leases(), 1);
    Ok(())
}

#[test]
fn test_repository_counts_and_existence() -> Result<()> {
    let factory = factory();
    let orders = factory.repository::<Order>();

    assert_eq!(orders.count_where(field("customer").eq("alice"))?, 2);
    assert!(orders.exists(field("total").ge(310))?);
    assert!(!orders.exists(field("customer").eq("zoe"))?);
    assert_balanced(factory.provider().leases(), 3);
    Ok(())
}

#[test]
fn test_repositories_share_the_provider() {
    let factory = factory();
    let first = factory.repository::<Order>();
    let second = factory.clone().repository::<Order>();

    assert_eq!(first.as_queryable(), second.as_queryable());
    assert!(std::sync::Arc::ptr_eq(first.provider(), second.provider()));
}

#[tokio::test]
async fn test_repository_async_operations() -> Result<()> {
    let factory = factory();
    let orders = factory.repository::<Order>();
    let cancel = Cancellation::new();

    assert_eq!(orders.list(&cancel).await?.len(), 6);
    assert_eq!(orders.count_where_async(field("total").lt(100), &cancel).await?, 2);
    assert_balanced(factory.provider().leases(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repository_over_sqlite() -> Result<()> {
    let database = TestDatabase::new().await?;
    let factory = RepositoryFactory::new(database.factory());
    let orders = factory.repository::<Order>();
    let cancel = Cancellation::new();

    assert_eq!(orders.list(&cancel).await?.len(), 6);
    assert_eq!(orders.count_where(field("status").eq("shipped"))?, 3);
    assert_balanced(factory.provider().leases(), 2);
    Ok(())
}
