//! HTTP control surface: order listing and disposition, service
//! start/stop/run-once, and the admin schedule store.

use crate::application::orders::OrderService;
use crate::application::supervisor::{ServiceManager, ServiceMode};
use crate::domain::errors::ServiceError;
use crate::domain::repositories::{OrderFilter, OrderRepository};
use crate::domain::types::{Order, OrderStatistics, OrderStatus, TaskName, TaskSchedule};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{delete, get, post};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

pub struct ApiState {
    pub orders: Arc<dyn OrderRepository>,
    pub order_services: HashMap<i64, Arc<OrderService>>,
    pub manager: Arc<ServiceManager>,
    pub admin_token: Option<String>,
}

type ApiError = (StatusCode, String);

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/statistics", get(order_statistics))
        .route("/orders/:id/retry", post(retry_order))
        .route("/orders/:id", delete(drop_order))
        .route("/services/:user_id/start", post(start_service))
        .route("/services/:user_id/stop", post(stop_service))
        .route("/services/:user_id/run-once", post(run_once))
        .route("/services/:user_id/status", get(service_status))
        .route("/schedules", get(get_schedules).put(put_schedule))
        .with_state(state)
}

fn internal(e: anyhow::Error) -> ApiError {
    // Typed service errors map to meaningful statuses
    if let Some(service_err) = e.downcast_ref::<ServiceError>() {
        let status = match service_err {
            ServiceError::AlreadyRunning { .. } | ServiceError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            ServiceError::NotRunning { .. } => StatusCode::NOT_FOUND,
            ServiceError::MarketClosed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::AdminOnly => StatusCode::FORBIDDEN,
        };
        return (status, service_err.to_string());
    }
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

#[derive(Debug, Deserialize)]
struct OrderListQuery {
    user_id: i64,
    status: Option<String>,
    reason: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn list_orders(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(OrderStatus::from_str)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let filter = OrderFilter {
        status,
        reason_contains: query.reason,
        from: query.from,
        to: query.to,
    };
    let orders = state
        .orders
        .search(query.user_id, &filter)
        .await
        .map_err(internal)?;
    Ok(Json(orders))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn order_statistics(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<OrderStatistics>, ApiError> {
    let stats = state
        .orders
        .statistics(query.user_id)
        .await
        .map_err(internal)?;
    Ok(Json(stats))
}

fn order_service_for(
    state: &ApiState,
    user_id: i64,
) -> Result<Arc<OrderService>, ApiError> {
    state
        .order_services
        .get(&user_id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown user {}", user_id)))
}

async fn retry_order(
    State(state): State<Arc<ApiState>>,
    Path(local_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Order>, ApiError> {
    let service = order_service_for(&state, query.user_id)?;
    let order = service
        .user_retry(query.user_id, &local_id)
        .await
        .map_err(internal)?;
    Ok(Json(order))
}

async fn drop_order(
    State(state): State<Arc<ApiState>>,
    Path(local_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Order>, ApiError> {
    let service = order_service_for(&state, query.user_id)?;
    let order = service
        .user_drop(query.user_id, &local_id)
        .await
        .map_err(internal)?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
struct StartBody {
    /// "unified" (default) or "individual"
    mode: Option<String>,
    task: Option<String>,
}

async fn start_service(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
    Json(body): Json<StartBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode = match body.mode.as_deref().unwrap_or("unified") {
        "unified" => ServiceMode::Unified,
        "individual" => {
            let task_str = body.task.as_deref().ok_or((
                StatusCode::BAD_REQUEST,
                "individual mode requires a task".to_string(),
            ))?;
            let task =
                TaskName::from_str(task_str).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
            ServiceMode::Individual(task)
        }
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Unknown mode: {}", other),
            ));
        }
    };

    state.manager.start(user_id, mode).await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "started": true })))
}

async fn stop_service(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.stop(user_id).await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "stopped": true })))
}

#[derive(Debug, Deserialize)]
struct RunOnceBody {
    task: String,
}

async fn run_once(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
    Json(body): Json<RunOnceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.manager.known_user(user_id) {
        return Err((StatusCode::NOT_FOUND, format!("Unknown user {}", user_id)));
    }
    let task = TaskName::from_str(&body.task).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let summary = state
        .manager
        .run_once(user_id, task)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}

async fn service_status(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<crate::domain::types::ServiceStatus>>, ApiError> {
    let statuses = state
        .manager
        .statuses_for(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(statuses))
}

async fn get_schedules(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<TaskSchedule>>, ApiError> {
    let schedules = state.manager.schedules().await.map_err(internal)?;
    Ok(Json(schedules))
}

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    task: String,
    schedule_time: String,
    enabled: bool,
    is_hourly: bool,
    is_continuous: bool,
    end_time: Option<String>,
}

async fn put_schedule(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let is_admin = state
        .admin_token
        .as_deref()
        .is_some_and(|expected| expected == presented);

    let task = TaskName::from_str(&body.task).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let schedule_time = NaiveTime::parse_from_str(&body.schedule_time, "%H:%M")
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Bad schedule_time: {}", e)))?;
    let end_time = body
        .end_time
        .as_deref()
        .map(|s| NaiveTime::parse_from_str(s, "%H:%M"))
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Bad end_time: {}", e)))?;

    let schedule = TaskSchedule {
        task,
        schedule_time,
        enabled: body.enabled,
        is_hourly: body.is_hourly,
        is_continuous: body.is_continuous,
        end_time,
        updated_by: None,
        updated_at: None,
    };

    state
        .manager
        .update_schedule(&schedule, "admin", is_admin)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({
        "updated": true,
        "notice": "takes effect at the next service restart"
    })))
}
