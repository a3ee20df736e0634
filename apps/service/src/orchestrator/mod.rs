
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::models::ProblemStateRecord;
use crate::database::{DatabaseImpl, ProblemStore, initialize_database};
use crate::monitoring::{CellCheck, CellResult, CheckRegistry, MonitoringExecutor, MonitoringScheduler};
use crate::notifications::extractor::StoreCatalog;
use crate::notifications::{
    CellStateEvaluator, CellStates, ChannelFactory, NotificationChannel, NotificationEngine, RunSummary,
};
use crate::notifications::NotificationConfig;
use crate::pool::LibsqlPool;

/// A registered notification ready to run
#[derive(Clone)]
pub struct ScheduledNotification {
    pub id: i64,
    pub name: String,
    pub interval_seconds: u64,
    pub config: NotificationConfig,
    pub channel: Arc<dyn NotificationChannel>,
}

/// Main orchestrator for the gridwatch service
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<dyn ProblemStore>,
    executor: Arc<MonitoringExecutor>,
    states: Arc<CellStates>,
    engine: Arc<NotificationEngine>,
    notifications: Vec<ScheduledNotification>,
    task_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Orchestrator {
    /// Create and start a new orchestrator
    /// This is a convenience method that creates and immediately runs the orchestrator
    pub async fn start(config: Config, pool: LibsqlPool) -> Result<()> {
        let mut orchestrator = Self::new(config, pool).await?;
        orchestrator.run().await
    }

    /// Create an orchestrator with the built-in check types and channels
    pub async fn new(config: Config, pool: LibsqlPool) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Self::with_registries(config, pool, CheckRegistry::with_defaults(client), ChannelFactory::with_defaults()).await
    }

    pub async fn with_registries(
        config: Config,
        pool: LibsqlPool,
        checks: CheckRegistry,
        channels: ChannelFactory,
    ) -> Result<Self> {
        config.validate(|kind| channels.is_valid_type(kind))?;
        let config = Arc::new(config);

        // Initialize database schema
        info!("Initializing database schema...");
        initialize_database(&*pool.get().await?).await?;
        let database: Arc<dyn ProblemStore> = Arc::new(DatabaseImpl::new_from_pool(pool));

        for grid in &config.grids {
            database.record_grid(&grid.name).await?;
            for check in grid.checks.iter().filter(|check| !checks.contains(&check.check_type)) {
                warn!(
                    grid = %grid.name,
                    check = %check.name,
                    check_type = %check.check_type,
                    "Unknown check type, its cells will report UNKNOWN"
                );
            }
        }

        let mut notifications = Vec::with_capacity(config.notifications.len());
        for settings in &config.notifications {
            let params = settings.params_json();
            let id = database.upsert_notification(&settings.name, &settings.kind, &params.to_string()).await?;
            let channel = channels.create(&settings.name, &settings.kind, &params)?;
            info!(notification_id = id, name = %settings.name, kind = %settings.kind, "Registered notification");

            notifications.push(ScheduledNotification {
                id,
                name: settings.name.clone(),
                interval_seconds: settings.interval_seconds,
                config: settings.to_runtime(),
                channel,
            });
        }

        let states = Arc::new(CellStates::new());
        let evaluator = Arc::new(CellStateEvaluator::new(states.clone(), config.grids.iter().map(|g| g.name.clone())));
        let catalog = Arc::new(StoreCatalog::new(Arc::new(config.dashboards.clone()), database.clone()));
        let engine = Arc::new(NotificationEngine::new(
            database.clone(),
            catalog,
            evaluator,
            Duration::from_secs(config.run_deadline_seconds),
        ));

        Ok(Self {
            config,
            database,
            executor: Arc::new(MonitoringExecutor::new(checks)),
            states,
            engine,
            notifications,
            task_handles: Vec::new(),
        })
    }

    /// One scheduled check per grid cell and configured check
    pub fn cell_checks(&self) -> Vec<CellCheck> {
        let mut cells = Vec::new();
        for grid in &self.config.grids {
            for check in &grid.checks {
                for row in &grid.rows {
                    for col in &grid.columns {
                        if grid.exclude_self && row.name == col.name {
                            continue;
                        }
                        cells.push(CellCheck {
                            id: cells.len() as i64 + 1,
                            grid_name: grid.name.clone(),
                            row_name: row.name.clone(),
                            col_name: col.name.clone(),
                            check_name: check.name.clone(),
                            check_type: check.check_type.clone(),
                            params: check.params.clone(),
                            row_vars: row.vars.clone(),
                            col_vars: col.vars.clone(),
                            interval_seconds: check.interval_seconds,
                            timeout_seconds: check.timeout_seconds.unwrap_or(self.config.check_timeout_seconds),
                        });
                    }
                }
            }
        }
        cells
    }

    /// Run the notification called `name` once, now
    pub async fn run_notification(&self, name: &str) -> Result<RunSummary> {
        let notification = self.notification(name)?;
        Ok(self.engine.run(notification.id, &notification.config, notification.channel.as_ref()).await?)
    }

    /// Ledger rows of the notification called `name`
    pub async fn open_problems(&self, name: &str) -> Result<Vec<ProblemStateRecord>> {
        let notification = self.notification(name)?;
        self.database.problem_records(notification.id).await
    }

    fn notification(&self, name: &str) -> Result<&ScheduledNotification> {
        self.notifications
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| anyhow!("No notification named {name} is configured"))
    }

    /// Run the orchestrator until interrupted
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting gridwatch orchestrator...");

        let (result_tx, mut result_rx) = mpsc::channel::<CellResult>(100);
        let scheduler = MonitoringScheduler::new(self.executor.clone(), result_tx);

        let cells = self.cell_checks();
        info!("Scheduling {} cell checks across {} grids", cells.len(), self.config.grids.len());
        self.task_handles = scheduler.schedule_cells(cells);

        for notification in self.notifications.clone() {
            self.task_handles.push(self.schedule_notification(notification));
        }

        info!("Orchestrator started successfully - processing check results");
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(result) = result_rx.recv() => {
                    debug!(
                        check_id = result.check_id,
                        grid = %result.grid_name,
                        row = %result.row_name,
                        col = %result.col_name,
                        status = %result.result.status,
                        "Recording cell result"
                    );
                    self.states.record(result);
                }
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Shutting down orchestrator...");
                    break;
                }
            }
        }

        for handle in self.task_handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }

    fn schedule_notification(&self, notification: ScheduledNotification) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(notification.interval_seconds.max(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                // failures are logged by the engine; the next tick tries again
                let _ = engine.run(notification.id, &notification.config, notification.channel.as_ref()).await;
            }
        })
    }
}
