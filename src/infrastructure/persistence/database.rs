use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Database wrapper owning the connection pool.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                user_id INTEGER NOT NULL,
                local_id TEXT NOT NULL,
                broker_order_id TEXT,
                symbol TEXT NOT NULL,
                ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                variety TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                status TEXT NOT NULL,
                reason TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                first_failed_at INTEGER,
                last_retry_attempt INTEGER,
                last_status_check INTEGER,
                execution_price TEXT,
                execution_qty TEXT,
                execution_time INTEGER,
                original_price TEXT,
                original_quantity TEXT,
                is_manual INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                source_order_id TEXT,
                placed_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, local_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_user_status
            ON orders (user_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders status index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_user_broker_id
            ON orders (user_id, broker_order_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders broker id index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                PRIMARY KEY (user_id, symbol)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracking_scope (
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                system_qty TEXT NOT NULL,
                pre_existing_qty TEXT NOT NULL,
                current_tracked_qty TEXT NOT NULL,
                tracking_status TEXT NOT NULL,
                initial_order_id TEXT,
                related_order_ids TEXT NOT NULL DEFAULT '[]',
                source TEXT,
                PRIMARY KEY (user_id, symbol)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create tracking_scope table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                task_name TEXT PRIMARY KEY,
                schedule_time TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                is_hourly INTEGER NOT NULL DEFAULT 0,
                is_continuous INTEGER NOT NULL DEFAULT 0,
                end_time TEXT,
                updated_by TEXT,
                updated_at INTEGER
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create schedules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_status (
                user_id INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                last_execution_at INTEGER,
                next_execution_at INTEGER,
                process_handle TEXT,
                PRIMARY KEY (user_id, task_name)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create service_status table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
