use super::scheduler::default_schedules;
use super::supervisor::{ExecutionState, UserSupervisor};
use super::tasks::TaskRunner;
use crate::domain::errors::ServiceError;
use crate::domain::market_calendar::MarketCalendar;
use crate::domain::repositories::{ScheduleRepository, ServiceStatusRepository};
use crate::domain::types::{TaskName, TaskSchedule};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

const RUN_ONCE_CONFLICT_WINDOW_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// One supervisor running every task for the user.
    Unified,
    /// A supervisor scoped to a single task.
    Individual(TaskName),
}

struct RunningEntry {
    mode: ServiceMode,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Per-user start/stop of unified vs individual services, run-once
/// dispatch, and the admin schedule store.
///
/// Invariant: a unified service and an individual service for the same
/// task are never running together for one user.
pub struct ServiceManager {
    runners: HashMap<i64, Arc<TaskRunner>>,
    schedules: Arc<dyn ScheduleRepository>,
    statuses: Arc<dyn ServiceStatusRepository>,
    calendar: MarketCalendar,
    execution: Arc<ExecutionState>,
    running: Mutex<HashMap<i64, Vec<RunningEntry>>>,
    monitor_interval_secs: u64,
    stop_grace_secs: u64,
    run_once_deadline_secs: u64,
}

impl ServiceManager {
    pub fn new(
        runners: HashMap<i64, Arc<TaskRunner>>,
        schedules: Arc<dyn ScheduleRepository>,
        statuses: Arc<dyn ServiceStatusRepository>,
        calendar: MarketCalendar,
        monitor_interval_secs: u64,
        stop_grace_secs: u64,
        run_once_deadline_secs: u64,
    ) -> Self {
        Self {
            runners,
            schedules,
            statuses,
            calendar,
            execution: Arc::new(ExecutionState::new()),
            running: Mutex::new(HashMap::new()),
            monitor_interval_secs,
            stop_grace_secs,
            run_once_deadline_secs,
        }
    }

    /// Load schedules, seeding the defaults on first run.
    pub async fn load_schedules(&self) -> Result<Vec<TaskSchedule>> {
        let mut stored = self.schedules.all().await?;
        if stored.is_empty() {
            stored = default_schedules();
            for schedule in &stored {
                self.schedules.upsert(schedule).await?;
            }
            info!("ServiceManager: Seeded default schedule table");
        }
        Ok(stored)
    }

    pub async fn start(&self, user_id: i64, mode: ServiceMode) -> Result<()> {
        let runner = self
            .runners
            .get(&user_id)
            .with_context(|| format!("Unknown user {}", user_id))?
            .clone();

        let mut running = self.running.lock().await;
        let entries = running.entry(user_id).or_default();
        entries.retain(|e| !e.handle.is_finished());

        let conflict = entries.iter().any(|e| match (&e.mode, &mode) {
            // Unified excludes everything, and vice versa
            (ServiceMode::Unified, _) | (_, ServiceMode::Unified) => true,
            (ServiceMode::Individual(running_task), ServiceMode::Individual(requested)) => {
                running_task == requested
            }
        });
        if conflict {
            return Err(ServiceError::AlreadyRunning { user_id }.into());
        }

        let all_schedules = self.load_schedules().await?;
        let schedules: Vec<TaskSchedule> = match mode {
            ServiceMode::Unified => all_schedules,
            ServiceMode::Individual(task) => all_schedules
                .into_iter()
                .filter(|s| s.task == task)
                .collect(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = UserSupervisor::new(
            user_id,
            runner,
            self.calendar.clone(),
            schedules,
            self.statuses.clone(),
            self.execution.clone(),
            self.monitor_interval_secs,
            self.run_once_deadline_secs,
            shutdown_rx,
        );
        let handle = tokio::spawn(supervisor.run());

        entries.push(RunningEntry {
            mode,
            shutdown_tx,
            handle,
        });
        info!("ServiceManager: Started {:?} service for user {}", mode, user_id);
        Ok(())
    }

    /// Cooperative stop: the in-flight tick completes, then the loop
    /// exits. Exceeding the grace period escalates to an abort. Orders
    /// already accepted by the broker remain live either way.
    pub async fn stop(&self, user_id: i64) -> Result<()> {
        let entries = {
            let mut running = self.running.lock().await;
            running.remove(&user_id).unwrap_or_default()
        };
        if entries.is_empty() {
            return Err(ServiceError::NotRunning { user_id }.into());
        }

        let grace = std::time::Duration::from_secs(self.stop_grace_secs);
        for entry in entries {
            let _ = entry.shutdown_tx.send(true);
            let abort = entry.handle.abort_handle();
            match tokio::time::timeout(grace, entry.handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "ServiceManager: User {} service exceeded {}s grace period, terminating",
                        user_id, self.stop_grace_secs
                    );
                    abort.abort();
                }
            }
        }

        info!("ServiceManager: Stopped services for user {}", user_id);
        Ok(())
    }

    /// Ad-hoc execution, bypassing the schedule but not market-hours
    /// requirements. `Conflict` when the same task is executing or was
    /// dispatched within the last 2 minutes.
    pub async fn run_once(&self, user_id: i64, task: TaskName) -> Result<String> {
        let runner = self
            .runners
            .get(&user_id)
            .with_context(|| format!("Unknown user {}", user_id))?
            .clone();

        if self
            .execution
            .conflicts(user_id, task, RUN_ONCE_CONFLICT_WINDOW_SECS)
        {
            return Err(ServiceError::Conflict { task }.into());
        }

        let now = Utc::now();
        if task.requires_live_prices() && !self.calendar.is_market_open(now) {
            return Err(ServiceError::MarketClosed { task }.into());
        }

        self.execution.begin(user_id, task);
        let deadline = std::time::Duration::from_secs(self.run_once_deadline_secs);
        let result = tokio::time::timeout(deadline, runner.run(task, now)).await;
        self.execution.end(user_id, task);

        match result {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(e.context(format!("run-once {} failed", task))),
            Err(_) => anyhow::bail!(
                "run-once {} exceeded the {}s deadline",
                task,
                self.run_once_deadline_secs
            ),
        }
    }

    /// Admin-only schedule edit. Applies to all users and takes effect at
    /// the next service restart; a notice is logged for the operator.
    pub async fn update_schedule(
        &self,
        schedule: &TaskSchedule,
        updated_by: &str,
        is_admin: bool,
    ) -> Result<()> {
        if !is_admin {
            return Err(ServiceError::AdminOnly.into());
        }

        let mut stamped = schedule.clone();
        stamped.updated_by = Some(updated_by.to_string());
        stamped.updated_at = Some(Utc::now());
        self.schedules.upsert(&stamped).await?;

        warn!(
            "ServiceManager: Schedule for {} changed by {}; running services pick it up at next restart",
            schedule.task, updated_by
        );
        Ok(())
    }

    pub async fn schedules(&self) -> Result<Vec<TaskSchedule>> {
        self.load_schedules().await
    }

    pub async fn statuses_for(&self, user_id: i64) -> Result<Vec<crate::domain::types::ServiceStatus>> {
        self.statuses.for_user(user_id).await
    }

    pub fn known_user(&self, user_id: i64) -> bool {
        self.runners.contains_key(&user_id)
    }
}
