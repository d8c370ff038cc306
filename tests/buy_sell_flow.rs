//! End-to-end happy path: AMO buy placed from a recommendation, executed
//! at next open, limit sell at the computed target, position closed.

mod common;

use common::{USER, harness, seed_candles};
use chrono::Utc;
use rust_decimal_macros::dec;
use tradewarden::domain::repositories::{OrderRepository, PositionRepository};
use tradewarden::domain::types::{
    BrokerOrderState, OrderSide, OrderStatus, Recommendation, Variety, Verdict,
};

fn acme_recommendation() -> Recommendation {
    Recommendation {
        ticker: "ACME.NS".to_string(),
        symbol: "ACME".to_string(),
        suggested_qty: Some(dec!(10)),
        suggested_capital: None,
        target_price: None,
        entry_price_hint: Some(dec!(2500)),
        verdict: Verdict::Buy,
        indicators_snapshot: None,
    }
}

#[tokio::test]
async fn test_buy_to_sell_happy_path() -> anyhow::Result<()> {
    let h = harness();
    h.broker.set_cash(dec!(100000));
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));

    // 1. Evening: AMO buy from the recommendation
    let order = h
        .order_service
        .place_buy_from_recommendation(USER, &acme_recommendation(), Variety::Amo, dec!(2500))
        .await?
        .expect("order should be created");
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.variety, Variety::Amo);
    let broker_id = order.broker_order_id.clone().expect("broker ack");

    // 2. Next open: the broker executes the AMO
    h.broker.set_entry_state(
        &broker_id,
        BrokerOrderState::Executed {
            qty: dec!(10),
            price: dec!(2500),
        },
    );
    let report = h.monitor.monitor_all_orders(Utc::now()).await?;
    assert_eq!(report.executed, 1);

    let stored = h.orders.find(USER, &order.local_id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Ongoing);

    let pos = h.positions.find_open(USER, "ACME").await?.expect("position opens");
    assert_eq!(pos.quantity, dec!(10));
    assert_eq!(pos.avg_price, dec!(2500));

    // 3. Sell monitor places a limit sell at the computed target
    let sell = h
        .order_service
        .place_sell_for_position(&pos, dec!(2602.52))
        .await?
        .expect("sell placed");
    assert_eq!(sell.side, OrderSide::Sell);
    // Target snapped to the 0.05 tick
    assert_eq!(sell.price, Some(dec!(2602.50)));

    // A second pass does not stack another sell
    assert!(
        h.order_service
            .place_sell_for_position(&pos, dec!(2602.52))
            .await?
            .is_none()
    );

    // 4. Fill: order closes, position closes
    let sell_broker_id = sell.broker_order_id.clone().unwrap();
    h.broker.set_entry_state(
        &sell_broker_id,
        BrokerOrderState::Executed {
            qty: dec!(10),
            price: dec!(2602.50),
        },
    );
    h.monitor.monitor_all_orders(Utc::now()).await?;

    let sell_stored = h.orders.find(USER, &sell.local_id).await?.unwrap();
    assert_eq!(sell_stored.status, OrderStatus::Closed);
    assert!(h.positions.find_open(USER, "ACME").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_duplicate_placement_rejected_by_gates() -> anyhow::Result<()> {
    let h = harness();
    h.broker.set_cash(dec!(100000));
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));

    let first = h
        .order_service
        .place_buy_from_recommendation(USER, &acme_recommendation(), Variety::Amo, dec!(2500))
        .await?
        .unwrap();
    assert_eq!(first.status, OrderStatus::Pending);

    // Same symbol, same side: the duplicate gate fails it
    let second = h
        .order_service
        .place_buy_from_recommendation(USER, &acme_recommendation(), Variety::Amo, dec!(2500))
        .await?
        .unwrap();
    assert_eq!(second.status, OrderStatus::Failed);
    assert!(second.reason.unwrap().contains("duplicate"));

    // Exactly one broker placement happened
    assert_eq!(h.broker.placements.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_watch_verdict_is_filtered_without_order_row() -> anyhow::Result<()> {
    let h = harness();
    h.broker.set_cash(dec!(100000));
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));

    let mut rec = acme_recommendation();
    rec.verdict = Verdict::Watch;

    let result = h
        .order_service
        .place_buy_from_recommendation(USER, &rec, Variety::Amo, dec!(2500))
        .await?;
    assert!(result.is_none());
    assert!(h.broker.placements.lock().unwrap().is_empty());

    Ok(())
}
