//! Retry queue behavior: recovery after an overnight deposit, and forced
//! expiry at next-trading-day market close.

mod common;

use common::{USER, harness, ist, seed_candles};
use rust_decimal_macros::dec;
use tradewarden::domain::repositories::OrderRepository;
use tradewarden::domain::types::{
    Order, OrderSide, OrderStatus, OrderType, Recommendation, Variety, Verdict,
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

/// A failed buy with a controlled `first_failed_at`.
fn failed_order(local_id: &str, first_failed_at: chrono::DateTime<chrono::Utc>) -> Order {
    Order {
        user_id: USER,
        local_id: local_id.to_string(),
        broker_order_id: None,
        symbol: "ACME".to_string(),
        ticker: "ACME.NS".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        variety: Variety::Amo,
        quantity: dec!(10),
        price: Some(dec!(2500)),
        status: OrderStatus::Failed,
        reason: Some("insufficient balance".to_string()),
        retry_count: 0,
        first_failed_at: Some(first_failed_at),
        last_retry_attempt: None,
        last_status_check: None,
        execution_price: None,
        execution_qty: None,
        execution_time: None,
        original_price: Some(dec!(2500)),
        original_quantity: Some(dec!(10)),
        is_manual: false,
        cancel_requested: false,
        source_order_id: None,
        placed_at: first_failed_at,
        updated_at: first_failed_at,
    }
}

#[tokio::test]
async fn test_insufficient_balance_then_overnight_recovery() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(500));

    // Initial placement fails validation
    let order = h
        .order_service
        .place_buy_from_recommendation(USER, &acme_recommendation(), Variety::Amo, dec!(2500))
        .await?
        .unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.retry_count, 0);
    assert!(order.first_failed_at.is_some());
    assert!(order.reason.as_ref().unwrap().contains("insufficient balance"));

    // Overnight deposit
    h.broker.set_cash(dec!(100000));
    h.validation.invalidate_broker_view().await;

    // Premarket retry the next morning, well inside the expiry window
    let now = order.first_failed_at.unwrap() + chrono::Duration::hours(10);
    let report = h.retry_queue.run_premarket(USER, now).await?;
    assert_eq!(report.dispatched, 1);

    let stored = h.orders.find(USER, &order.local_id).await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_retry_attempt.is_some());
    assert!(stored.broker_order_id.is_some());

    Ok(())
}

#[tokio::test]
async fn test_balance_still_short_counts_attempt_and_stays_failed() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(5)); // affords 0 shares

    let order = failed_order("o1", ist("2025-06-16", "16:00:00"));
    h.orders.insert(&order).await?;

    let report = h
        .retry_queue
        .run_premarket(USER, ist("2025-06-17", "09:00:00"))
        .await?;
    assert_eq!(report.still_failed, 1);
    assert_eq!(report.dispatched, 0);

    let stored = h.orders.find(USER, "o1").await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Failed);
    assert_eq!(stored.retry_count, 1);

    Ok(())
}

#[tokio::test]
async fn test_friday_failure_survives_monday_morning_retry() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(100000));

    // Failed Friday 2025-06-13 16:00 IST; expiry is Monday 15:30
    let order = failed_order("o1", ist("2025-06-13", "16:00:00"));
    h.orders.insert(&order).await?;

    let report = h
        .retry_queue
        .run_premarket(USER, ist("2025-06-16", "09:00:00"))
        .await?;
    assert_eq!(report.expired, 0);
    assert_eq!(report.dispatched, 1);

    Ok(())
}

#[tokio::test]
async fn test_expired_order_cancelled_past_next_trading_day_close() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(100000));

    // Failed Friday 16:00; Tuesday morning is past Monday's 15:30 close
    let order = failed_order("o1", ist("2025-06-13", "16:00:00"));
    h.orders.insert(&order).await?;

    let report = h
        .retry_queue
        .run_premarket(USER, ist("2025-06-17", "09:00:00"))
        .await?;
    assert_eq!(report.expired, 1);
    assert_eq!(report.dispatched, 0);

    let stored = h.orders.find(USER, "o1").await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert!(stored.reason.as_ref().unwrap().contains("expired"));

    // A later pass does not see it again
    let report = h
        .retry_queue
        .run_premarket(USER, ist("2025-06-18", "09:00:00"))
        .await?;
    assert_eq!(report.examined, 0);

    Ok(())
}

#[tokio::test]
async fn test_already_in_holdings_cancels_retry() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(100000));
    h.broker.set_holdings(vec![tradewarden::domain::ports::Holding {
        symbol: "ACME".to_string(),
        quantity: dec!(10),
        avg_price: dec!(2400),
    }]);

    let order = failed_order("o1", ist("2025-06-16", "16:00:00"));
    h.orders.insert(&order).await?;

    let report = h
        .retry_queue
        .run_premarket(USER, ist("2025-06-17", "09:00:00"))
        .await?;
    assert_eq!(report.cancelled, 1);

    let stored = h.orders.find(USER, "o1").await?.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.reason.as_deref(), Some("already in holdings"));

    Ok(())
}

#[tokio::test]
async fn test_retry_count_is_monotonic_across_passes() -> anyhow::Result<()> {
    let h = harness();
    seed_candles(&h.broker, "ACME.NS", dec!(2500), dec!(500000));
    h.broker.set_cash(dec!(5));

    let order = failed_order("o1", ist("2025-06-16", "16:00:00"));
    h.orders.insert(&order).await?;

    let mut last_count = 0;
    // Same trading window, several passes before expiry
    for time in ["09:00:00", "09:30:00", "10:00:00"] {
        h.retry_queue
            .run_premarket(USER, ist("2025-06-17", time))
            .await?;
        let stored = h.orders.find(USER, "o1").await?.unwrap();
        assert!(stored.retry_count >= last_count);
        last_count = stored.retry_count;
    }
    assert_eq!(last_count, 3);

    Ok(())
}
