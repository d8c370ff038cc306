use super::mapping::{dec_text, parse_dec};
use crate::domain::repositories::TrackingRepository;
use crate::domain::types::{TrackingScope, TrackingStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteTrackingRepository {
    pool: SqlitePool,
}

impl SqliteTrackingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<TrackingScope> {
        let status_str: String = row.try_get("tracking_status")?;
        let related_json: String = row.try_get("related_order_ids")?;
        let related_order_ids: Vec<String> =
            serde_json::from_str(&related_json).unwrap_or_default();

        Ok(TrackingScope {
            user_id: row.try_get("user_id")?,
            symbol: row.try_get("symbol")?,
            system_qty: parse_dec(row.try_get("system_qty")?),
            pre_existing_qty: parse_dec(row.try_get("pre_existing_qty")?),
            current_tracked_qty: parse_dec(row.try_get("current_tracked_qty")?),
            tracking_status: TrackingStatus::from_str(&status_str).map_err(anyhow::Error::msg)?,
            initial_order_id: row.try_get("initial_order_id")?,
            related_order_ids,
            recommendation_source: row.try_get("source")?,
        })
    }
}

#[async_trait]
impl TrackingRepository for SqliteTrackingRepository {
    async fn upsert(&self, scope: &TrackingScope) -> Result<()> {
        let related_json = serde_json::to_string(&scope.related_order_ids)
            .context("Failed to serialize related order ids")?;

        sqlx::query(
            r#"
            INSERT INTO tracking_scope (
                user_id, symbol, system_qty, pre_existing_qty,
                current_tracked_qty, tracking_status, initial_order_id,
                related_order_ids, source
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, symbol) DO UPDATE SET
                system_qty = excluded.system_qty,
                pre_existing_qty = excluded.pre_existing_qty,
                current_tracked_qty = excluded.current_tracked_qty,
                tracking_status = excluded.tracking_status,
                initial_order_id = excluded.initial_order_id,
                related_order_ids = excluded.related_order_ids,
                source = excluded.source
            "#,
        )
        .bind(scope.user_id)
        .bind(&scope.symbol)
        .bind(dec_text(&scope.system_qty))
        .bind(dec_text(&scope.pre_existing_qty))
        .bind(dec_text(&scope.current_tracked_qty))
        .bind(scope.tracking_status.to_string())
        .bind(&scope.initial_order_id)
        .bind(related_json)
        .bind(&scope.recommendation_source)
        .execute(&self.pool)
        .await
        .context("Failed to upsert tracking scope")?;

        Ok(())
    }

    async fn find(&self, user_id: i64, symbol: &str) -> Result<Option<TrackingScope>> {
        let row = sqlx::query("SELECT * FROM tracking_scope WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn active_scopes(&self, user_id: i64) -> Result<Vec<TrackingScope>> {
        let rows = sqlx::query(
            "SELECT * FROM tracking_scope WHERE user_id = ? AND tracking_status = 'active'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }
}
