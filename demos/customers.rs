//! Resolves a customers -> address / orders -> items graph twice: once with a fetch per parent,
//! once through a request-scoped [`LoaderRegistry`]. Run with `RUST_LOG=info` (the default) to see
//! the queries each strategy sends to the mocked store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchload_rs::{BatchFunction, BatchResult, LoadError, LoaderConfig, LoaderRegistry};
use futures::future;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct Customer {
    id: i64,
    name: String,
    address_id: i64,
}

#[derive(Debug, Clone)]
struct Address {
    street: String,
    country: String,
}

#[derive(Debug, Clone)]
struct Order {
    id: i64,
    amount: f64,
}

#[derive(Debug, Clone)]
struct Item {
    name: String,
}

/// Mocked backend. Every query takes 5ms.
#[derive(Default)]
struct Store {
    queries: AtomicUsize,
}

impl Store {
    async fn query(&self, sql: String) {
        self.queries.fetch_add(1, Ordering::SeqCst);
        tracing::info!(%sql);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn take_query_count(&self) -> usize {
        self.queries.swap(0, Ordering::SeqCst)
    }

    async fn customers(&self) -> Vec<Customer> {
        self.query("SELECT * FROM customer".to_owned()).await;
        ["Bob", "Alice", "Eve", "Mallory", "Trent"]
            .iter()
            .zip(1..)
            .map(|(name, id)| Customer { id, name: name.to_string(), address_id: id * 2 })
            .collect()
    }
}

fn id_list(keys: &[i64]) -> String {
    keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn address(id: i64) -> Address {
    Address { street: format!("{} home street", id), country: "hometon".to_owned() }
}

fn orders(customer_id: i64) -> Vec<Order> {
    (0..3).map(|n| Order { id: customer_id * 10 + n, amount: 9.99 * (n + 1) as f64 }).collect()
}

fn items(order_id: i64) -> Vec<Item> {
    vec![Item { name: format!("widget #{}", order_id) }]
}

struct AddressById;

#[async_trait]
impl BatchFunction for AddressById {
    type Key = i64;
    type Value = Address;
    type Context = Arc<Store>;

    async fn load(keys: &[i64], store: &Arc<Store>) -> BatchResult<i64, Address> {
        store.query(format!("SELECT * FROM address WHERE id IN ({})", id_list(keys))).await;
        Ok(keys.iter().map(|id| (*id, Ok(address(*id)))).collect())
    }
}

struct OrdersByCustomer;

#[async_trait]
impl BatchFunction for OrdersByCustomer {
    type Key = i64;
    type Value = Vec<Order>;
    type Context = Arc<Store>;

    async fn load(keys: &[i64], store: &Arc<Store>) -> BatchResult<i64, Vec<Order>> {
        store.query(format!("SELECT * FROM orders WHERE customer_id IN ({})", id_list(keys))).await;
        Ok(keys.iter().map(|id| (*id, Ok(orders(*id)))).collect())
    }
}

struct ItemsByOrder;

#[async_trait]
impl BatchFunction for ItemsByOrder {
    type Key = i64;
    type Value = Vec<Item>;
    type Context = Arc<Store>;

    async fn load(keys: &[i64], store: &Arc<Store>) -> BatchResult<i64, Vec<Item>> {
        store.query(format!("SELECT * FROM items WHERE order_id IN ({})", id_list(keys))).await;
        Ok(keys.iter().map(|id| (*id, Ok(items(*id)))).collect())
    }
}

/// One fetch per parent edge.
async fn resolve_naive(store: &Store) -> usize {
    let mut rendered = 0;
    for customer in store.customers().await {
        store.query(format!("SELECT * FROM address WHERE id IN ({})", customer.address_id)).await;
        store.query(format!("SELECT * FROM orders WHERE customer_id IN ({})", customer.id)).await;
        for order in orders(customer.id) {
            store.query(format!("SELECT * FROM items WHERE order_id IN ({})", order.id)).await;
            rendered += items(order.id).len();
        }
    }
    rendered
}

async fn resolve_customer(
    customer: Customer,
    loaders: &LoaderRegistry,
) -> Result<usize, LoadError> {
    let (address, orders) = future::try_join(
        loaders.loader::<AddressById>()?.load(customer.address_id),
        loaders.loader::<OrdersByCustomer>()?.load(customer.id),
    )
    .await?;

    let order_ids = orders.iter().map(|order| order.id).collect();
    let items = loaders.loader::<ItemsByOrder>()?.load_many(order_ids).await;

    let mut rendered = 0;
    for (order, items) in orders.iter().zip(items) {
        let items = items?;
        tracing::debug!(
            customer = %customer.name,
            street = %address.street,
            country = %address.country,
            order = order.id,
            amount = order.amount,
            items = ?items.iter().map(|item| &item.name).collect::<Vec<_>>(),
        );
        rendered += items.len();
    }
    Ok(rendered)
}

/// One unit of work: the registry is created for this request, handed to every resolver and
/// dropped at the end.
async fn resolve_batched(store: &Arc<Store>, config: LoaderConfig) -> Result<usize, LoadError> {
    let loaders = LoaderRegistry::new(config)
        .with(AddressById, store.clone())
        .with(OrdersByCustomer, store.clone())
        .with(ItemsByOrder, store.clone());

    let customers = store.customers().await;
    let rendered =
        future::try_join_all(customers.into_iter().map(|c| resolve_customer(c, &loaders))).await?;
    Ok(rendered.into_iter().sum())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "customers=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LoaderConfig::from_env()?;
    let store = Arc::new(Store::default());

    tracing::info!("resolving with one fetch per parent");
    let naive_items = resolve_naive(&store).await;
    let naive_queries = store.take_query_count();

    tracing::info!(?config, "resolving through request-scoped loaders");
    let batched_items = resolve_batched(&store, config).await?;
    let batched_queries = store.take_query_count();

    assert_eq!(naive_items, batched_items);
    tracing::info!(naive_queries, batched_queries, items = batched_items, "done");
    Ok(())
}
