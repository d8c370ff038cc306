//! Session-expiry semantics at the monitor: the tick is skipped with no
//! partial writes, and the next tick proceeds normally.

mod common;

use common::{USER, harness, seed_candles};
use chrono::Utc;
use rust_decimal_macros::dec;
use tradewarden::domain::errors::BrokerError;
use tradewarden::domain::repositories::OrderRepository;
use tradewarden::domain::types::{
    BrokerOrderState, OrderStatus, Recommendation, Variety, Verdict,
};

#[tokio::test]
async fn test_expired_session_skips_tick_then_recovers() -> anyhow::Result<()> {
    let h = harness();
    h.broker.set_cash(dec!(100000));
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));

    let rec = Recommendation {
        ticker: "ACME.NS".to_string(),
        symbol: "ACME".to_string(),
        suggested_qty: Some(dec!(10)),
        suggested_capital: None,
        target_price: None,
        entry_price_hint: Some(dec!(2500)),
        verdict: Verdict::StrongBuy,
        indicators_snapshot: None,
    };
    let order = h
        .order_service
        .place_buy_from_recommendation(USER, &rec, Variety::Amo, dec!(2500))
        .await?
        .unwrap();
    let broker_id = order.broker_order_id.clone().unwrap();

    h.broker.set_entry_state(
        &broker_id,
        BrokerOrderState::Executed {
            qty: dec!(10),
            price: dec!(2500),
        },
    );

    // The adapter's internal re-auth already failed; the monitor sees the
    // expired session and must skip the tick without touching state
    h.broker.fail_next(BrokerError::SessionExpired);
    let report = h.monitor.monitor_all_orders(Utc::now()).await?;
    assert!(report.aborted);

    let stored = h.orders.find(USER, &order.local_id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);

    // Next tick proceeds after the normal interval
    let report = h.monitor.monitor_all_orders(Utc::now()).await?;
    assert!(!report.aborted);
    assert_eq!(report.executed, 1);

    let stored = h.orders.find(USER, &order.local_id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Ongoing);

    Ok(())
}

#[tokio::test]
async fn test_transient_error_abandons_tick_without_partial_writes() -> anyhow::Result<()> {
    let h = harness();
    h.broker.set_cash(dec!(100000));
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));

    let rec = Recommendation {
        ticker: "ACME.NS".to_string(),
        symbol: "ACME".to_string(),
        suggested_qty: Some(dec!(10)),
        suggested_capital: None,
        target_price: None,
        entry_price_hint: Some(dec!(2500)),
        verdict: Verdict::Buy,
        indicators_snapshot: None,
    };
    let order = h
        .order_service
        .place_buy_from_recommendation(USER, &rec, Variety::Amo, dec!(2500))
        .await?
        .unwrap();

    h.broker.fail_next(BrokerError::Timeout { seconds: 15 });
    let report = h.monitor.monitor_all_orders(Utc::now()).await?;
    assert!(report.aborted);

    // Verification map from the failed tick stays empty
    let map = h.monitor.verification_map().await;
    assert!(map.is_empty());

    let stored = h.orders.find(USER, &order.local_id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(stored.last_status_check.is_none());

    Ok(())
}
