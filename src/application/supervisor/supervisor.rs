use super::scheduler::is_due;
use super::tasks::TaskRunner;
use crate::domain::market_calendar::MarketCalendar;
use crate::domain::repositories::ServiceStatusRepository;
use crate::domain::types::{ServiceStatus, TaskName, TaskSchedule};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Scheduler resolution. Fine enough to hit the hourly minute marks, far
/// below the 1-minute monitor tick.
const LOOP_RESOLUTION_SECS: u64 = 15;

/// Per-task execution bookkeeping shared between the supervisor loop and
/// ad-hoc run-once requests, used for conflict detection.
#[derive(Default)]
pub struct ExecutionState {
    inner: Mutex<HashMap<(i64, TaskName), ExecInfo>>,
}

#[derive(Default, Clone, Copy)]
struct ExecInfo {
    executing: bool,
    last_dispatch: Option<Instant>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the task is mid-execution or was dispatched within the
    /// conflict window.
    pub fn conflicts(&self, user_id: i64, task: TaskName, window_secs: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.get(&(user_id, task)) {
            Some(info) => {
                info.executing
                    || info
                        .last_dispatch
                        .is_some_and(|at| at.elapsed().as_secs() < window_secs)
            }
            None => false,
        }
    }

    pub fn is_executing(&self, user_id: i64, task: TaskName) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&(user_id, task))
            .is_some_and(|info| info.executing)
    }

    pub fn begin(&self, user_id: i64, task: TaskName) {
        let mut inner = self.inner.lock().unwrap();
        let info = inner.entry((user_id, task)).or_default();
        info.executing = true;
        info.last_dispatch = Some(Instant::now());
    }

    pub fn end(&self, user_id: i64, task: TaskName) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.get_mut(&(user_id, task)) {
            info.executing = false;
        }
    }
}

/// One user's long-lived supervisor: a single tick loop that fires the
/// scheduled tasks sequentially, so all repository writes for the user
/// stay ordered on one execution context.
///
/// Task failures are `failed_transient`: logged, recorded, and the loop
/// keeps ticking. The loop exits cooperatively when the shutdown channel
/// flips.
pub struct UserSupervisor {
    user_id: i64,
    runner: Arc<TaskRunner>,
    calendar: MarketCalendar,
    schedules: Vec<TaskSchedule>,
    statuses: Arc<dyn ServiceStatusRepository>,
    execution: Arc<ExecutionState>,
    monitor_interval_secs: u64,
    task_deadline_secs: u64,
    shutdown_rx: watch::Receiver<bool>,
}

impl UserSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        runner: Arc<TaskRunner>,
        calendar: MarketCalendar,
        schedules: Vec<TaskSchedule>,
        statuses: Arc<dyn ServiceStatusRepository>,
        execution: Arc<ExecutionState>,
        monitor_interval_secs: u64,
        task_deadline_secs: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            user_id,
            runner,
            calendar,
            schedules,
            statuses,
            execution,
            monitor_interval_secs,
            task_deadline_secs,
            shutdown_rx,
        }
    }

    pub async fn run(self) {
        info!(
            "Supervisor[{}]: Started with {} scheduled tasks",
            self.user_id,
            self.schedules.len()
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut last_fired: HashMap<TaskName, DateTime<Utc>> = HashMap::new();
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(LOOP_RESOLUTION_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    for schedule in &self.schedules {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if is_due(
                            schedule,
                            &self.calendar,
                            now,
                            last_fired.get(&schedule.task).copied(),
                            self.monitor_interval_secs,
                        ) {
                            last_fired.insert(schedule.task, now);
                            self.execute(schedule.task, now).await;
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervisor[{}]: Cooperative shutdown complete", self.user_id);
    }

    /// Run one task inline with a deadline. Failures are transient by
    /// policy: the supervisor never dies on a task error.
    async fn execute(&self, task: TaskName, now: DateTime<Utc>) {
        if self.execution.is_executing(self.user_id, task) {
            warn!(
                "Supervisor[{}]: {} still executing, tick skipped",
                self.user_id, task
            );
            return;
        }

        self.execution.begin(self.user_id, task);
        self.persist_status(task, true, now).await;

        let deadline = std::time::Duration::from_secs(self.task_deadline_secs);
        let outcome = tokio::time::timeout(deadline, self.runner.run(task, now)).await;

        match outcome {
            Ok(Ok(summary)) => {
                if task != TaskName::SellMonitor {
                    info!("Supervisor[{}]: {} done: {}", self.user_id, task, summary);
                }
            }
            Ok(Err(e)) => {
                // failed_transient: keep ticking
                error!("Supervisor[{}]: {} failed: {:#}", self.user_id, task, e);
            }
            Err(_) => {
                error!(
                    "Supervisor[{}]: {} exceeded {}s deadline",
                    self.user_id, task, self.task_deadline_secs
                );
            }
        }

        self.execution.end(self.user_id, task);
        self.persist_status(task, false, now).await;
    }

    async fn persist_status(&self, task: TaskName, running: bool, now: DateTime<Utc>) {
        let existing = self
            .statuses
            .find(self.user_id, task)
            .await
            .ok()
            .flatten();

        let status = ServiceStatus {
            user_id: self.user_id,
            task,
            is_running: running,
            started_at: existing.as_ref().and_then(|s| s.started_at).or(Some(now)),
            last_execution_at: if running {
                Some(now)
            } else {
                existing.as_ref().and_then(|s| s.last_execution_at)
            },
            next_execution_at: None,
            process_handle: Some(format!("supervisor-{}", self.user_id)),
        };

        if let Err(e) = self.statuses.upsert(&status).await {
            warn!("Supervisor[{}]: Failed to persist status for {}: {}", self.user_id, task, e);
        }
    }
}
