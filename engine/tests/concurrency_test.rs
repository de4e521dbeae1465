//! Concurrency integration tests.
//!
//! Races concurrent reservations against shared counters and verifies the
//! single property the whole engine exists for: no product is ever oversold,
//! under any interleaving.
//!
//! Run with: `cargo test --test concurrency_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use stockhold_core::{
    ClientId, KeyedMutexCoordinator, LockCoordinator, NoopLockCoordinator, OwnerId, ProductId,
    StockError, StockStore, SystemClock,
};
use stockhold_engine::{EngineConfig, StockEngine};
use stockhold_testing::mocks::InMemoryStockStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stockhold_engine=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn two_racing_reserves_leave_exactly_one_winner() {
    init_tracing();
    println!("🧪 Racing two reserve calls over 5 units of stock");

    let store = Arc::new(InMemoryStockStore::new());
    let engine = StockEngine::new(
        Arc::clone(&store) as Arc<dyn StockStore>,
        Arc::new(KeyedMutexCoordinator::new()),
        Arc::new(SystemClock),
    );
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 5, 0).await;

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let mut tasks = Vec::new();
    for row in 0..2 {
        let engine = engine.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .reserve(product, ClientId::new(), owner, 3, "live", &format!("row-{row}"))
                .await
        }));
    }

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1, "exactly one of the racing reserves may win");
    assert!(outcomes.iter().any(|o| matches!(
        o,
        Err(StockError::InsufficientStock {
            requested: 3,
            available: 2,
            ..
        })
    )));

    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.stock, 5);
    assert_eq!(availability.reserved, 3);
    assert_eq!(availability.available, 2);

    println!("  ✅ One winner, one InsufficientStock, counters intact");
}

#[tokio::test]
async fn a_flash_sale_never_oversells_the_product() {
    init_tracing();
    println!("🧪 20 buyers, 5 units, one SKU");

    let store = Arc::new(InMemoryStockStore::new());
    let engine = StockEngine::new(
        Arc::clone(&store) as Arc<dyn StockStore>,
        Arc::new(KeyedMutexCoordinator::new()),
        Arc::new(SystemClock),
    );
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 5, 0).await;

    let barrier = Arc::new(tokio::sync::Barrier::new(20));
    let mut tasks = Vec::new();
    for buyer in 0..20 {
        let engine = engine.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .reserve(product, ClientId::new(), owner, 1, "live", &format!("buyer-{buyer}"))
                .await
        }));
    }

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 5);
    assert_eq!(outcomes.len() - winners, 15);

    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.reserved, 5);
    assert_eq!(availability.available, 0);

    println!("  ✅ Exactly 5 of 20 buyers hold a reservation");
}

#[tokio::test]
async fn the_row_lock_alone_prevents_oversell() {
    // Same race with the advisory layer disabled: correctness must not
    // depend on it.
    let store = Arc::new(InMemoryStockStore::new());
    let engine = StockEngine::new(
        Arc::clone(&store) as Arc<dyn StockStore>,
        Arc::new(NoopLockCoordinator),
        Arc::new(SystemClock),
    );
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 1, 0).await;

    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let mut tasks = Vec::new();
    for row in 0..4 {
        let engine = engine.clone();
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .reserve(product, ClientId::new(), owner, 1, "live", &format!("row-{row}"))
                .await
        }));
    }

    let winners = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();
    assert_eq!(winners, 1);

    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.reserved, 1);
}

#[tokio::test]
async fn a_held_advisory_lock_times_out_the_operation() {
    let store = Arc::new(InMemoryStockStore::new());
    let locks = Arc::new(KeyedMutexCoordinator::new());
    let engine = StockEngine::with_config(
        Arc::clone(&store) as Arc<dyn StockStore>,
        Arc::clone(&locks) as Arc<dyn LockCoordinator>,
        Arc::new(SystemClock),
        EngineConfig::with_lock_timeout(Duration::from_millis(50)),
    );
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 5, 0).await;

    // Simulate a slow holder: take the product lock out from under the
    // engine and keep it for the duration of the call.
    let held = locks.acquire(product, Duration::from_millis(50)).await.unwrap();

    let err = engine
        .reserve(product, ClientId::new(), owner, 1, "live", "row-0")
        .await
        .unwrap_err();
    assert!(matches!(err, StockError::LockTimeout { .. }));
    assert!(err.is_retryable());

    // Nothing was written while the lock was contended.
    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.reserved, 0);

    drop(held);
    assert!(engine
        .reserve(product, ClientId::new(), owner, 1, "live", "row-0")
        .await
        .is_ok());
}
