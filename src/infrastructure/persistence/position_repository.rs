use super::mapping::{dec_text, from_opt_ts, from_ts, opt_ts, parse_dec, ts};
use crate::domain::repositories::PositionRepository;
use crate::domain::types::Position;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
        Ok(Position {
            user_id: row.try_get("user_id")?,
            symbol: row.try_get("symbol")?,
            quantity: parse_dec(row.try_get("quantity")?),
            avg_price: parse_dec(row.try_get("avg_price")?),
            opened_at: from_ts(row.try_get("opened_at")?),
            closed_at: from_opt_ts(row.try_get("closed_at")?),
        })
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn upsert(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (user_id, symbol, quantity, avg_price, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, symbol) DO UPDATE SET
                quantity = excluded.quantity,
                avg_price = excluded.avg_price,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(position.user_id)
        .bind(&position.symbol)
        .bind(dec_text(&position.quantity))
        .bind(dec_text(&position.avg_price))
        .bind(ts(&position.opened_at))
        .bind(opt_ts(&position.closed_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert position")?;

        Ok(())
    }

    async fn find_open(&self, user_id: i64, symbol: &str) -> Result<Option<Position>> {
        let row = sqlx::query(
            "SELECT * FROM positions WHERE user_id = ? AND symbol = ? AND closed_at IS NULL",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn open_positions(&self, user_id: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE user_id = ? AND closed_at IS NULL ORDER BY opened_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn count_open(&self, user_id: i64) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM positions WHERE user_id = ? AND closed_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }
}
