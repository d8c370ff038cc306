use super::mapping::{from_opt_ts, opt_ts};
use crate::domain::repositories::{ScheduleRepository, ServiceStatusRepository};
use crate::domain::types::{ServiceStatus, TaskName, TaskSchedule};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveTime;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskSchedule> {
        let task_str: String = row.try_get("task_name")?;
        let time_str: String = row.try_get("schedule_time")?;
        let end_str: Option<String> = row.try_get("end_time")?;

        Ok(TaskSchedule {
            task: TaskName::from_str(&task_str).map_err(anyhow::Error::msg)?,
            schedule_time: NaiveTime::parse_from_str(&time_str, "%H:%M")
                .context("Bad schedule_time in schedules table")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            is_hourly: row.try_get::<i64, _>("is_hourly")? != 0,
            is_continuous: row.try_get::<i64, _>("is_continuous")? != 0,
            end_time: end_str
                .map(|s| NaiveTime::parse_from_str(&s, "%H:%M"))
                .transpose()
                .context("Bad end_time in schedules table")?,
            updated_by: row.try_get("updated_by")?,
            updated_at: from_opt_ts(row.try_get("updated_at")?),
        })
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn all(&self) -> Result<Vec<TaskSchedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY task_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn find(&self, task: TaskName) -> Result<Option<TaskSchedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE task_name = ?")
            .bind(task.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn upsert(&self, schedule: &TaskSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                task_name, schedule_time, enabled, is_hourly, is_continuous,
                end_time, updated_by, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_name) DO UPDATE SET
                schedule_time = excluded.schedule_time,
                enabled = excluded.enabled,
                is_hourly = excluded.is_hourly,
                is_continuous = excluded.is_continuous,
                end_time = excluded.end_time,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(schedule.task.as_str())
        .bind(schedule.schedule_time.format("%H:%M").to_string())
        .bind(schedule.enabled as i64)
        .bind(schedule.is_hourly as i64)
        .bind(schedule.is_continuous as i64)
        .bind(schedule.end_time.map(|t| t.format("%H:%M").to_string()))
        .bind(&schedule.updated_by)
        .bind(opt_ts(&schedule.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert schedule")?;

        Ok(())
    }
}

pub struct SqliteServiceStatusRepository {
    pool: SqlitePool,
}

impl SqliteServiceStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<ServiceStatus> {
        let task_str: String = row.try_get("task_name")?;

        Ok(ServiceStatus {
            user_id: row.try_get("user_id")?,
            task: TaskName::from_str(&task_str).map_err(anyhow::Error::msg)?,
            is_running: row.try_get::<i64, _>("is_running")? != 0,
            started_at: from_opt_ts(row.try_get("started_at")?),
            last_execution_at: from_opt_ts(row.try_get("last_execution_at")?),
            next_execution_at: from_opt_ts(row.try_get("next_execution_at")?),
            process_handle: row.try_get("process_handle")?,
        })
    }
}

#[async_trait]
impl ServiceStatusRepository for SqliteServiceStatusRepository {
    async fn upsert(&self, status: &ServiceStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_status (
                user_id, task_name, is_running, started_at, last_execution_at,
                next_execution_at, process_handle
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, task_name) DO UPDATE SET
                is_running = excluded.is_running,
                started_at = excluded.started_at,
                last_execution_at = excluded.last_execution_at,
                next_execution_at = excluded.next_execution_at,
                process_handle = excluded.process_handle
            "#,
        )
        .bind(status.user_id)
        .bind(status.task.as_str())
        .bind(status.is_running as i64)
        .bind(opt_ts(&status.started_at))
        .bind(opt_ts(&status.last_execution_at))
        .bind(opt_ts(&status.next_execution_at))
        .bind(&status.process_handle)
        .execute(&self.pool)
        .await
        .context("Failed to upsert service status")?;

        Ok(())
    }

    async fn find(&self, user_id: i64, task: TaskName) -> Result<Option<ServiceStatus>> {
        let row = sqlx::query("SELECT * FROM service_status WHERE user_id = ? AND task_name = ?")
            .bind(user_id)
            .bind(task.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn for_user(&self, user_id: i64) -> Result<Vec<ServiceStatus>> {
        let rows = sqlx::query("SELECT * FROM service_status WHERE user_id = ? ORDER BY task_name")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }
}
