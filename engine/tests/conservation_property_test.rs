//! Property tests for counter conservation.
//!
//! Drives the engine with random operation sequences and checks, after every
//! single step, that the stored counters match a straightforward model and
//! that `reserved` equals the sum of quantities over active holds.
//!
//! Run with: `cargo test --test conservation_property_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use proptest::prelude::*;
use std::sync::Arc;
use stockhold_core::{
    AdjustmentKind, ClientId, KeyedMutexCoordinator, OwnerId, ProductId, ReservationId,
    StockError, StockStore, SystemClock,
};
use stockhold_engine::StockEngine;
use stockhold_testing::mocks::InMemoryStockStore;

const INITIAL_STOCK: u32 = 8;

#[derive(Clone, Debug)]
enum Op {
    Reserve(u32),
    Commit(usize),
    Release(usize),
    AdjustIn(u32),
    AdjustOut(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..=4).prop_map(Op::Reserve),
        (0usize..8).prop_map(Op::Commit),
        (0usize..8).prop_map(Op::Release),
        (1u32..=5).prop_map(Op::AdjustIn),
        (1u32..=5).prop_map(Op::AdjustOut),
    ]
}

async fn run_sequence(ops: Vec<Op>) {
    let store = Arc::new(InMemoryStockStore::new());
    let engine = StockEngine::new(
        Arc::clone(&store) as Arc<dyn StockStore>,
        Arc::new(KeyedMutexCoordinator::new()),
        Arc::new(SystemClock),
    );
    let owner = OwnerId::new();
    let product = ProductId::new();
    let client = ClientId::new();
    store.seed_product(owner, product, INITIAL_STOCK, 0).await;

    let mut expected_stock = INITIAL_STOCK;
    let mut expected_reserved = 0u32;
    let mut holds: Vec<ReservationId> = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::Reserve(qty) => {
                match engine
                    .reserve(product, client, owner, qty, "live", &format!("row-{step}"))
                    .await
                {
                    Ok(id) => {
                        holds.push(id);
                        expected_reserved += qty;
                    }
                    Err(StockError::InsufficientStock { .. }) => {}
                    Err(other) => panic!("unexpected reserve failure: {other:?}"),
                }
            }
            Op::Commit(pick) => {
                let Some(&id) = holds.get(pick % holds.len().max(1)) else {
                    continue;
                };
                let row = store.reservation(id, owner).await.unwrap().unwrap();
                match engine.commit(id, owner).await {
                    Ok(()) => {
                        expected_stock -= row.qty;
                        expected_reserved -= row.qty;
                    }
                    Err(StockError::InvalidReservationState { .. }) => {}
                    Err(other) => panic!("unexpected commit failure: {other:?}"),
                }
            }
            Op::Release(pick) => {
                let Some(&id) = holds.get(pick % holds.len().max(1)) else {
                    continue;
                };
                let row = store.reservation(id, owner).await.unwrap().unwrap();
                match engine.release(id, owner).await {
                    Ok(()) => expected_reserved -= row.qty,
                    Err(StockError::InvalidReservationState { .. }) => {}
                    Err(other) => panic!("unexpected release failure: {other:?}"),
                }
            }
            Op::AdjustIn(qty) => {
                engine
                    .adjust_stock(owner, product, qty, AdjustmentKind::Inbound, "stocktake", "in")
                    .await
                    .unwrap();
                expected_stock += qty;
            }
            Op::AdjustOut(qty) => {
                match engine
                    .adjust_stock(owner, product, qty, AdjustmentKind::Outbound, "stocktake", "out")
                    .await
                {
                    Ok(()) => expected_stock -= qty,
                    Err(StockError::InsufficientStock { .. }) => {}
                    Err(other) => panic!("unexpected adjustment failure: {other:?}"),
                }
            }
        }

        // The stored counters track the model exactly.
        let availability = engine.check_availability(product, owner).await.unwrap();
        assert_eq!(availability.stock, expected_stock);
        assert_eq!(availability.reserved, expected_reserved);
        assert!(availability.stock >= availability.reserved, "oversold");

        // Conservation: reserved equals the sum over active holds.
        let mut active_sum = 0u32;
        for id in &holds {
            let row = store.reservation(*id, owner).await.unwrap().unwrap();
            if row.is_active() {
                active_sum += row.qty;
            }
        }
        assert_eq!(availability.reserved, active_sum);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counters_always_match_the_active_holds(ops in proptest::collection::vec(op_strategy(), 1..32)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run_sequence(ops));
    }
}
