use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error};

use super::checker::CheckContext;
use super::executor::MonitoringExecutor;
use super::params::TemplateVariableMap;
use super::types::CheckResult;

/// Ids of the checks currently executing
#[derive(Debug, Default)]
pub struct InFlightChecks {
    running: Mutex<HashSet<i64>>,
}

impl InFlightChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `check_id` as running. Returns `None` if it already is.
    pub fn try_register(self: &Arc<Self>, check_id: i64) -> Option<InFlightGuard> {
        let inserted = self.running.lock().unwrap_or_else(PoisonError::into_inner).insert(check_id);
        inserted.then(|| InFlightGuard { registry: Arc::clone(self), check_id })
    }

    #[cfg(test)]
    pub fn is_running(&self, check_id: i64) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).contains(&check_id)
    }
}

/// Removes its check from [`InFlightChecks`] when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightChecks>,
    check_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.running.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.check_id);
    }
}

/// One grid cell and the check that runs for it
#[derive(Debug, Clone)]
pub struct CellCheck {
    pub id: i64,
    pub grid_name: String,
    pub row_name: String,
    pub col_name: String,
    pub check_name: String,
    pub check_type: String,
    pub params: Map<String, Value>,
    pub row_vars: TemplateVariableMap,
    pub col_vars: TemplateVariableMap,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl CellCheck {
    pub fn context(&self) -> CheckContext<'_> {
        CheckContext {
            grid_name: &self.grid_name,
            row_name: &self.row_name,
            col_name: &self.col_name,
            params: &self.params,
            row_vars: &self.row_vars,
            col_vars: &self.col_vars,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Outcome of one scheduled run, sent to the result consumer
#[derive(Debug, Clone)]
pub struct CellResult {
    pub check_id: i64,
    pub grid_name: String,
    pub row_name: String,
    pub col_name: String,
    pub check_name: String,
    pub result: CheckResult,
    pub checked_at: DateTime<Utc>,
}

/// Monitoring scheduler - coordinates periodic execution of cell checks
#[derive(Clone)]
pub struct MonitoringScheduler {
    executor: Arc<MonitoringExecutor>,
    in_flight: Arc<InFlightChecks>,
    result_tx: mpsc::Sender<CellResult>,
}

impl MonitoringScheduler {
    pub fn new(executor: Arc<MonitoringExecutor>, result_tx: mpsc::Sender<CellResult>) -> Self {
        Self { executor, in_flight: Arc::new(InFlightChecks::new()), result_tx }
    }

    /// Run `cell` once unless a previous run of it is still going.
    ///
    /// Returns `None` when the check was skipped.
    pub async fn dispatch(&self, cell: &CellCheck) -> Option<CellResult> {
        let Some(_guard) = self.in_flight.try_register(cell.id) else {
            debug!(check_id = cell.id, grid = %cell.grid_name, "Check already running, skipping");
            return None;
        };

        let result = self.executor.execute(&cell.check_type, &cell.context()).await;
        Some(CellResult {
            check_id: cell.id,
            grid_name: cell.grid_name.clone(),
            row_name: cell.row_name.clone(),
            col_name: cell.col_name.clone(),
            check_name: cell.check_name.clone(),
            result,
            checked_at: Utc::now(),
        })
    }

    /// Schedule a single cell for periodic checking
    pub fn schedule_cell(&self, cell: CellCheck) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(cell.interval_seconds.max(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                timer.tick().await;

                let run = scheduler.clone();
                let cell = cell.clone();
                // a slow check must not hold up the timer; overlapping runs are refused by the in-flight registry
                tokio::spawn(async move {
                    let Some(result) = run.dispatch(&cell).await else {
                        return;
                    };
                    if let Err(e) = run.result_tx.send(result).await {
                        error!("Failed to send check result: {}", e);
                    }
                });

                if scheduler.result_tx.is_closed() {
                    break;
                }
            }
        })
    }

    /// Schedule multiple cells
    pub fn schedule_cells(&self, cells: Vec<CellCheck>) -> Vec<tokio::task::JoinHandle<()>> {
        cells.into_iter().map(|cell| self.schedule_cell(cell)).collect()
    }
}
