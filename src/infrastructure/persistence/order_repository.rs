use super::mapping::{dec_text, from_opt_ts, from_ts, opt_dec_text, opt_ts, parse_opt_dec, ts};
use crate::domain::errors::TransitionError;
use crate::domain::order_lifecycle::transition_allowed;
use crate::domain::repositories::{OrderFilter, OrderRepository};
use crate::domain::types::{Order, OrderSide, OrderStatistics, OrderStatus, OrderType, Variety};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Order> {
        let side_str: String = row.try_get("side")?;
        let type_str: String = row.try_get("order_type")?;
        let variety_str: String = row.try_get("variety")?;
        let status_str: String = row.try_get("status")?;

        Ok(Order {
            user_id: row.try_get("user_id")?,
            local_id: row.try_get("local_id")?,
            broker_order_id: row.try_get("broker_order_id")?,
            symbol: row.try_get("symbol")?,
            ticker: row.try_get("ticker")?,
            side: OrderSide::from_str(&side_str).map_err(anyhow::Error::msg)?,
            order_type: OrderType::from_str(&type_str).map_err(anyhow::Error::msg)?,
            variety: Variety::from_str(&variety_str).map_err(anyhow::Error::msg)?,
            quantity: super::mapping::parse_dec(row.try_get("quantity")?),
            price: parse_opt_dec(row.try_get("price")?),
            status: OrderStatus::from_str(&status_str).map_err(anyhow::Error::msg)?,
            reason: row.try_get("reason")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            first_failed_at: from_opt_ts(row.try_get("first_failed_at")?),
            last_retry_attempt: from_opt_ts(row.try_get("last_retry_attempt")?),
            last_status_check: from_opt_ts(row.try_get("last_status_check")?),
            execution_price: parse_opt_dec(row.try_get("execution_price")?),
            execution_qty: parse_opt_dec(row.try_get("execution_qty")?),
            execution_time: from_opt_ts(row.try_get("execution_time")?),
            original_price: parse_opt_dec(row.try_get("original_price")?),
            original_quantity: parse_opt_dec(row.try_get("original_quantity")?),
            is_manual: row.try_get::<i64, _>("is_manual")? != 0,
            cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
            source_order_id: row.try_get("source_order_id")?,
            placed_at: from_ts(row.try_get("placed_at")?),
            updated_at: from_ts(row.try_get("updated_at")?),
        })
    }

    fn map_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Order>> {
        rows.iter().map(Self::map_row).collect()
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn insert(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                user_id, local_id, broker_order_id, symbol, ticker, side,
                order_type, variety, quantity, price, status, reason,
                retry_count, first_failed_at, last_retry_attempt,
                last_status_check, execution_price, execution_qty,
                execution_time, original_price, original_quantity, is_manual,
                cancel_requested, source_order_id, placed_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, local_id) DO NOTHING
            "#,
        )
        .bind(order.user_id)
        .bind(&order.local_id)
        .bind(&order.broker_order_id)
        .bind(&order.symbol)
        .bind(&order.ticker)
        .bind(order.side.to_string())
        .bind(order.order_type.to_string())
        .bind(order.variety.to_string())
        .bind(dec_text(&order.quantity))
        .bind(opt_dec_text(&order.price))
        .bind(order.status.to_string())
        .bind(&order.reason)
        .bind(order.retry_count as i64)
        .bind(opt_ts(&order.first_failed_at))
        .bind(opt_ts(&order.last_retry_attempt))
        .bind(opt_ts(&order.last_status_check))
        .bind(opt_dec_text(&order.execution_price))
        .bind(opt_dec_text(&order.execution_qty))
        .bind(opt_ts(&order.execution_time))
        .bind(opt_dec_text(&order.original_price))
        .bind(opt_dec_text(&order.original_quantity))
        .bind(order.is_manual as i64)
        .bind(order.cancel_requested as i64)
        .bind(&order.source_order_id)
        .bind(ts(&order.placed_at))
        .bind(ts(&order.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert order")?;

        Ok(())
    }

    async fn update(&self, order: &Order) -> Result<()> {
        // The transition table is enforced here, regardless of caller.
        let stored = self
            .find(order.user_id, &order.local_id)
            .await?
            .with_context(|| format!("Order {} not found for update", order.local_id))?;

        if stored.status != order.status {
            if stored.status.is_terminal() {
                return Err(TransitionError::Terminal {
                    local_id: order.local_id.clone(),
                    status: stored.status,
                }
                .into());
            }
            if !transition_allowed(stored.status, order.status) {
                return Err(TransitionError::Illegal {
                    local_id: order.local_id.clone(),
                    from: stored.status,
                    to: order.status,
                }
                .into());
            }
        }

        sqlx::query(
            r#"
            UPDATE orders SET
                broker_order_id = ?, status = ?, reason = ?, retry_count = ?,
                first_failed_at = ?, last_retry_attempt = ?, last_status_check = ?,
                execution_price = ?, execution_qty = ?, execution_time = ?,
                original_price = ?, original_quantity = ?, is_manual = ?,
                cancel_requested = ?, price = ?, quantity = ?, updated_at = ?
            WHERE user_id = ? AND local_id = ?
            "#,
        )
        .bind(&order.broker_order_id)
        .bind(order.status.to_string())
        .bind(&order.reason)
        .bind(order.retry_count as i64)
        .bind(opt_ts(&order.first_failed_at))
        .bind(opt_ts(&order.last_retry_attempt))
        .bind(opt_ts(&order.last_status_check))
        .bind(opt_dec_text(&order.execution_price))
        .bind(opt_dec_text(&order.execution_qty))
        .bind(opt_ts(&order.execution_time))
        .bind(opt_dec_text(&order.original_price))
        .bind(opt_dec_text(&order.original_quantity))
        .bind(order.is_manual as i64)
        .bind(order.cancel_requested as i64)
        .bind(opt_dec_text(&order.price))
        .bind(dec_text(&order.quantity))
        .bind(ts(&order.updated_at))
        .bind(order.user_id)
        .bind(&order.local_id)
        .execute(&self.pool)
        .await
        .context("Failed to update order")?;

        Ok(())
    }

    async fn find(&self, user_id: i64, local_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE user_id = ? AND local_id = ?")
            .bind(user_id)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_broker_id(
        &self,
        user_id: i64,
        broker_order_id: &str,
    ) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE user_id = ? AND broker_order_id = ?")
            .bind(user_id)
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_status(&self, user_id: i64, status: OrderStatus) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE user_id = ? AND status = ? ORDER BY placed_at ASC",
        )
        .bind(user_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        Self::map_rows(rows)
    }

    async fn find_active(&self, user_id: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE user_id = ? AND status IN ('pending', 'ongoing') ORDER BY placed_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Self::map_rows(rows)
    }

    async fn find_pending_for_symbol(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
    ) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT * FROM orders WHERE user_id = ? AND symbol = ? AND side = ? AND status = 'pending' LIMIT 1",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(side.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn search(&self, user_id: i64, filter: &OrderFilter) -> Result<Vec<Order>> {
        let mut sql = String::from("SELECT * FROM orders WHERE user_id = ?");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.reason_contains.is_some() {
            sql.push_str(" AND reason LIKE ?");
        }
        if filter.from.is_some() {
            sql.push_str(" AND placed_at >= ?");
        }
        if filter.to.is_some() {
            sql.push_str(" AND placed_at <= ?");
        }
        sql.push_str(" ORDER BY placed_at DESC");

        let mut query = sqlx::query(&sql).bind(user_id);
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(reason) = &filter.reason_contains {
            query = query.bind(format!("%{}%", reason));
        }
        if let Some(from) = &filter.from {
            query = query.bind(ts(from));
        }
        if let Some(to) = &filter.to {
            query = query.bind(ts(to));
        }

        let rows = query.fetch_all(&self.pool).await?;
        Self::map_rows(rows)
    }

    async fn statistics(&self, user_id: i64) -> Result<OrderStatistics> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) as count FROM orders WHERE user_id = ? GROUP BY status")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        let mut stats = OrderStatistics::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "ongoing" => stats.ongoing = count,
                "failed" => stats.failed = count,
                "closed" => stats.closed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
