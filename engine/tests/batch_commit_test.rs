//! Batch commit (all-or-nothing) tests.
//!
//! `commit_many` is the only operation with an explicit all-or-nothing
//! contract across multiple reservations; these tests force failures on the
//! last batch member and verify that nothing else was persisted.
//!
//! Run with: `cargo test --test batch_commit_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use stockhold_core::{
    ClientId, KeyedMutexCoordinator, MovementKind, OwnerId, ProductId, ReservationStatus,
    StockError, StockStore, SystemClock,
};
use stockhold_engine::StockEngine;
use stockhold_testing::mocks::InMemoryStockStore;

fn new_engine(store: &Arc<InMemoryStockStore>) -> StockEngine {
    StockEngine::new(
        Arc::clone(store) as Arc<dyn StockStore>,
        Arc::new(KeyedMutexCoordinator::new()),
        Arc::new(SystemClock),
    )
}

#[tokio::test]
async fn a_whole_live_batch_commits_in_one_transaction() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 10, 0).await;

    let mut batch = Vec::new();
    for row in 0..3 {
        batch.push(
            engine
                .reserve(product, ClientId::new(), owner, 2, "live", &format!("row-{row}"))
                .await
                .unwrap(),
        );
    }

    engine.commit_many(&batch, owner).await.unwrap();

    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.stock, 4);
    assert_eq!(availability.reserved, 0);
    for id in batch {
        let row = store.reservation(id, owner).await.unwrap().unwrap();
        assert_eq!(row.status, ReservationStatus::Committed);
        assert!(row.committed_at.is_some());
    }
}

#[tokio::test]
async fn one_bad_member_rolls_back_the_entire_batch() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 10, 0).await;

    let good_one = engine
        .reserve(product, ClientId::new(), owner, 2, "live", "row-0")
        .await
        .unwrap();
    let good_two = engine
        .reserve(product, ClientId::new(), owner, 2, "live", "row-1")
        .await
        .unwrap();
    let poisoned = engine
        .reserve(product, ClientId::new(), owner, 2, "live", "row-2")
        .await
        .unwrap();

    // Force the last member into a terminal state before the batch runs.
    engine.release(poisoned, owner).await.unwrap();

    let err = engine
        .commit_many(&[good_one, good_two, poisoned], owner)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StockError::InvalidReservationState {
            status: ReservationStatus::Released,
            ..
        }
    ));

    // Neither of the healthy members moved: counters and statuses are
    // exactly as before the batch.
    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.stock, 10);
    assert_eq!(availability.reserved, 4);
    for id in [good_one, good_two] {
        let row = store.reservation(id, owner).await.unwrap().unwrap();
        assert_eq!(row.status, ReservationStatus::Reserved);
    }

    // No commit movement leaked out of the rolled-back transaction.
    let commits = store
        .movements()
        .await
        .into_iter()
        .filter(|m| m.kind == MovementKind::Commit)
        .count();
    assert_eq!(commits, 0);
}

#[tokio::test]
async fn batches_span_products_with_ordered_locking() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();
    let first = ProductId::new();
    let second = ProductId::new();
    store.seed_product(owner, first, 5, 0).await;
    store.seed_product(owner, second, 5, 0).await;

    let on_first = engine
        .reserve(first, ClientId::new(), owner, 1, "live", "row-0")
        .await
        .unwrap();
    let on_second = engine
        .reserve(second, ClientId::new(), owner, 3, "live", "row-1")
        .await
        .unwrap();

    // Input order deliberately differs from product-id order; the engine
    // sorts the lock set itself.
    engine.commit_many(&[on_second, on_first], owner).await.unwrap();

    assert_eq!(engine.check_availability(first, owner).await.unwrap().stock, 4);
    assert_eq!(engine.check_availability(second, owner).await.unwrap().stock, 2);
}

#[tokio::test]
async fn duplicate_ids_in_a_batch_commit_once() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 10, 0).await;

    let reservation = engine
        .reserve(product, ClientId::new(), owner, 2, "live", "row-0")
        .await
        .unwrap();

    engine
        .commit_many(&[reservation, reservation], owner)
        .await
        .unwrap();

    let availability = engine.check_availability(product, owner).await.unwrap();
    assert_eq!(availability.stock, 8);
    assert_eq!(availability.reserved, 0);
}

#[tokio::test]
async fn an_empty_batch_is_a_no_op() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();

    engine.commit_many(&[], owner).await.unwrap();
    assert!(store.movements().await.is_empty());
}

#[tokio::test]
async fn an_unknown_member_fails_the_batch_before_any_locking() {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = new_engine(&store);
    let owner = OwnerId::new();
    let product = ProductId::new();
    store.seed_product(owner, product, 10, 0).await;

    let known = engine
        .reserve(product, ClientId::new(), owner, 2, "live", "row-0")
        .await
        .unwrap();

    let err = engine
        .commit_many(&[known, stockhold_core::ReservationId::new()], owner)
        .await
        .unwrap_err();
    assert!(matches!(err, StockError::ReservationNotFound { .. }));

    let row = store.reservation(known, owner).await.unwrap().unwrap();
    assert_eq!(row.status, ReservationStatus::Reserved);
}
