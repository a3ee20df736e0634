use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};

use super::NotificationConfig;
use super::channel::{ChannelError, NotificationChannel};
use super::evaluator::{AlertRuleEvaluator, EvaluatorError};
use super::extractor::{self, GridCatalog};
use super::problem::delivery_order;
use crate::database::ProblemStore;
use crate::database::models::now_epoch;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Unable to find notification with ID {0} in database")]
    NotFound(i64),

    #[error("Problem store failure: {0}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Notification run exceeded its {0} second deadline")]
    Deadline(u64),
}

impl From<anyhow::Error> for NotifyError {
    fn from(error: anyhow::Error) -> Self {
        NotifyError::Store(error)
    }
}

/// What one run delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Problems that passed the filters
    pub observed: usize,
    /// Problems handed to the channel
    pub notified: usize,
    pub resolved: usize,
}

/// Decides per run what a notification target has to be told
pub struct NotificationEngine {
    store: Arc<dyn ProblemStore>,
    catalog: Arc<dyn GridCatalog>,
    evaluator: Arc<dyn AlertRuleEvaluator>,
    run_deadline: Duration,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn ProblemStore>,
        catalog: Arc<dyn GridCatalog>,
        evaluator: Arc<dyn AlertRuleEvaluator>,
        run_deadline: Duration,
    ) -> Self {
        Self { store, catalog, evaluator, run_deadline }
    }

    pub async fn run(
        &self,
        notification_id: i64,
        config: &NotificationConfig,
        channel: &dyn NotificationChannel,
    ) -> Result<RunSummary, NotifyError> {
        self.run_at(notification_id, config, channel, now_epoch()).await
    }

    /// One notification cycle as of `now` (Unix seconds).
    ///
    /// Nothing is sent unless every step before delivery succeeded, and the
    /// channel is called exactly once when they did.
    pub async fn run_at(
        &self,
        notification_id: i64,
        config: &NotificationConfig,
        channel: &dyn NotificationChannel,
        now: i64,
    ) -> Result<RunSummary, NotifyError> {
        let start = Instant::now();
        info!(notification_id, channel = channel.name(), "Notification run started");

        let outcome = tokio::time::timeout(self.run_deadline, self.run_inner(notification_id, config, channel, now))
            .await
            .unwrap_or(Err(NotifyError::Deadline(self.run_deadline.as_secs())));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(summary) => info!(
                notification_id,
                observed = summary.observed,
                notified = summary.notified,
                resolved = summary.resolved,
                elapsed_ms,
                "Notification run finished"
            ),
            Err(e) => error!(notification_id, error = %e, elapsed_ms, "Notification run failed"),
        }
        outcome
    }

    async fn run_inner(
        &self,
        notification_id: i64,
        config: &NotificationConfig,
        channel: &dyn NotificationChannel,
        now: i64,
    ) -> Result<RunSummary, NotifyError> {
        if !self.store.notification_exists(notification_id).await? {
            return Err(NotifyError::NotFound(notification_id));
        }

        let problems = extractor::extract(self.catalog.as_ref(), self.evaluator.as_ref(), config).await?;

        let mut new_problems = self.store.reconcile(notification_id, &problems, config.frequency, now).await?;
        let resolved = self.store.resolve(notification_id, config.resolve_after, now).await?;

        new_problems.sort_by(delivery_order);
        channel.send(notification_id, &new_problems, &resolved).await?;

        Ok(RunSummary { observed: problems.len(), notified: new_problems.len(), resolved: resolved.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardConfig;
    use crate::database::DatabaseImpl;
    use crate::database::models::ProblemStateRecord;
    use crate::notifications::evaluator::{Mesh, Report, Rule};
    use crate::notifications::extractor::StoreCatalog;
    use crate::notifications::problem::{NotifyProblem, Problem};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Delivery = (i64, Vec<NotifyProblem>, Vec<String>);

    #[derive(Default)]
    struct RecordingChannel {
        deliveries: Mutex<Vec<Delivery>>,
    }

    impl RecordingChannel {
        fn take(&self) -> Vec<Delivery> {
            std::mem::take(&mut *self.deliveries.lock().unwrap())
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, id: i64, problems: &[NotifyProblem], resolved: &[String]) -> Result<(), ChannelError> {
            self.deliveries.lock().unwrap().push((id, problems.to_vec(), resolved.to_vec()));
            Ok(())
        }
    }

    /// Problems per grid are swapped in between runs
    #[derive(Default)]
    struct ScriptedEvaluator {
        reports: Mutex<BTreeMap<String, Report>>,
    }

    impl ScriptedEvaluator {
        fn set_sites(&self, grid: &str, sites: &[(&str, Problem)]) {
            let mut report = Report::default();
            for (site, problem) in sites {
                report.global_max_severity = report.global_max_severity.max(problem.severity);
                report.sites.entry(site.to_string()).or_default().push(problem.clone());
            }
            self.reports.lock().unwrap().insert(grid.to_string(), report);
        }
    }

    struct ScriptedRule(Report);

    impl Rule for ScriptedRule {
        fn create_report(&self, _mesh: &dyn Mesh) -> Result<Report, EvaluatorError> {
            Ok(self.0.clone())
        }
    }

    impl AlertRuleEvaluator for ScriptedEvaluator {
        fn lookup_rule(&self, grid_name: &str) -> Result<Arc<dyn Rule>, EvaluatorError> {
            let reports = self.reports.lock().unwrap();
            let report = reports.get(grid_name).cloned().ok_or_else(|| EvaluatorError::NoRule(grid_name.to_string()))?;
            Ok(Arc::new(ScriptedRule(report)))
        }
    }

    /// Store whose writes fail; a slow one also takes its time to answer lookups
    struct BrokenStore {
        slow: bool,
    }

    #[async_trait]
    impl ProblemStore for BrokenStore {
        async fn notification_exists(&self, _: i64) -> Result<bool> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(true)
        }
        async fn upsert_notification(&self, _: &str, _: &str, _: &str) -> Result<i64> {
            anyhow::bail!("disk full")
        }
        async fn record_grid(&self, _: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }
        async fn known_grids(&self) -> Result<Vec<String>> {
            Ok(vec!["grid".into()])
        }
        async fn reconcile(&self, _: i64, _: &[NotifyProblem], _: i64, _: i64) -> Result<Vec<NotifyProblem>> {
            anyhow::bail!("disk full")
        }
        async fn resolve(&self, _: i64, _: i64, _: i64) -> Result<Vec<String>> {
            anyhow::bail!("disk full")
        }
        async fn problem_records(&self, _: i64) -> Result<Vec<ProblemStateRecord>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        engine: NotificationEngine,
        store: Arc<DatabaseImpl>,
        evaluator: Arc<ScriptedEvaluator>,
        channel: RecordingChannel,
        id: i64,
        _dir: TempDir,
    }

    async fn harness() -> Result<Harness> {
        let dir = tempfile::tempdir()?;
        let pool = crate::pool::open_pool(&dir.path().join("test.db"), 4).await?;
        crate::database::initialize_database(&*pool.get().await?).await?;
        let store = Arc::new(DatabaseImpl::new_from_pool(pool));

        let id = store.upsert_notification("ops", "log", "{}").await?;
        store.record_grid("grid").await?;

        let evaluator = Arc::new(ScriptedEvaluator::default());
        evaluator.set_sites("grid", &[]);
        let dashboards: Arc<Vec<DashboardConfig>> = Arc::new(Vec::new());
        let catalog = Arc::new(StoreCatalog::new(dashboards, store.clone()));
        let engine = NotificationEngine::new(store.clone(), catalog, evaluator.clone(), Duration::from_secs(30));

        Ok(Harness { engine, store, evaluator, channel: RecordingChannel::default(), id, _dir: dir })
    }

    fn loss(description: &str) -> Problem {
        Problem::new("LOSS", 2, description)
    }

    #[tokio::test]
    async fn test_rate_window_suppresses_and_realerts() -> Result<()> {
        let h = harness().await?;
        let config = NotificationConfig { frequency: 300, ..Default::default() };
        h.evaluator.set_sites("grid", &[("site_a", loss("loss at a"))]);

        for (now, expected) in [(0, 1), (60, 0), (310, 1)] {
            let summary = h.engine.run_at(h.id, &config, &h.channel, now).await?;
            assert_eq!(summary.observed, 1);
            assert_eq!(summary.notified, expected, "at t={now}");
        }

        let deliveries = h.channel.take();
        assert_eq!(deliveries.len(), 3, "send is called every run");
        assert_eq!(deliveries[0].1[0].problem.description, "loss at a");
        assert!(deliveries[1].1.is_empty());
        assert_eq!(deliveries[2].0, h.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_reported_once() -> Result<()> {
        let h = harness().await?;
        let config = NotificationConfig { frequency: 3600, resolve_after: 120, ..Default::default() };
        let problem = loss("loss at a");
        h.evaluator.set_sites("grid", &[("site_a", problem.clone())]);

        h.engine.run_at(h.id, &config, &h.channel, 0).await?;
        h.engine.run_at(h.id, &config, &h.channel, 60).await?;

        h.evaluator.set_sites("grid", &[]);
        let resolved: Vec<usize> = {
            let mut counts = Vec::new();
            for now in [120, 179, 180, 240] {
                counts.push(h.engine.run_at(h.id, &config, &h.channel, now).await?.resolved);
            }
            counts
        };
        assert_eq!(resolved, vec![0, 0, 1, 0]);

        let expected = NotifyProblem::for_site("grid", "site_a", problem).app_data();
        let deliveries = h.channel.take();
        assert_eq!(deliveries[4].2, vec![expected]);
        assert!(h.store.problem_records(h.id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_frequency_notifies_every_run() -> Result<()> {
        let h = harness().await?;
        let config = NotificationConfig { frequency: 0, ..Default::default() };
        h.evaluator.set_sites("grid", &[("site_a", loss("a")), ("site_b", loss("b"))]);

        for now in [0, 1, 2] {
            assert_eq!(h.engine.run_at(h.id, &config, &h.channel, now).await?.notified, 2);
        }
        assert!(h.store.problem_records(h.id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delivery_is_ordered() -> Result<()> {
        let h = harness().await?;
        h.evaluator.set_sites(
            "grid",
            &[
                ("site_b", Problem::new("LOSS", 1, "minor b")),
                ("site_a", Problem::new("LOSS", 1, "minor a")),
                ("site_c", Problem::new("LOSS", 3, "major c")),
            ],
        );

        h.engine.run_at(h.id, &NotificationConfig::default(), &h.channel, 0).await?;
        let delivered: Vec<String> =
            h.channel.take()[0].1.iter().map(|p| p.problem.description.clone()).collect();
        assert_eq!(delivered, vec!["major c", "minor a", "minor b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_notification_aborts_without_send() -> Result<()> {
        let h = harness().await?;

        let result = h.engine.run_at(h.id + 1, &NotificationConfig::default(), &h.channel, 0).await;
        assert!(matches!(result, Err(NotifyError::NotFound(id)) if id == h.id + 1));
        assert!(h.channel.take().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_evaluator_failure_aborts_without_send() -> Result<()> {
        let h = harness().await?;
        h.store.record_grid("unrated").await?;

        let result = h.engine.run_at(h.id, &NotificationConfig::default(), &h.channel, 0).await;
        assert!(matches!(result, Err(NotifyError::Evaluator(_))));
        assert!(h.channel.take().is_empty());
        Ok(())
    }

    fn broken_engine(slow: bool, deadline: Duration) -> NotificationEngine {
        let store: Arc<dyn ProblemStore> = Arc::new(BrokenStore { slow });
        let evaluator = Arc::new(ScriptedEvaluator::default());
        evaluator.set_sites("grid", &[("site_a", loss("a"))]);
        let catalog = Arc::new(StoreCatalog::new(Arc::new(Vec::new()), store.clone()));
        NotificationEngine::new(store, catalog, evaluator, deadline)
    }

    #[tokio::test]
    async fn test_store_failure_aborts_without_send() -> Result<()> {
        let engine = broken_engine(false, Duration::from_secs(30));
        let channel = RecordingChannel::default();

        let result = engine.run_at(1, &NotificationConfig::default(), &channel, 0).await;
        assert!(matches!(result, Err(NotifyError::Store(_))));
        assert!(channel.take().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_aborts_without_send() -> Result<()> {
        let engine = broken_engine(true, Duration::from_secs(1));
        let channel = RecordingChannel::default();

        let start = Instant::now();
        let result = engine.run_at(1, &NotificationConfig::default(), &channel, 0).await;
        assert!(matches!(result, Err(NotifyError::Deadline(1))));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(channel.take().is_empty());
        Ok(())
    }
}
