use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::NotificationConfig;
use super::engine::NotifyError;
use super::evaluator::{AlertRuleEvaluator, GridMesh};
use super::problem::NotifyProblem;
use crate::config::DashboardConfig;
use crate::database::ProblemStore;

/// Where the extractor learns which grids exist
#[async_trait]
pub trait GridCatalog: Send + Sync {
    /// Configured dashboards, sorted by name
    fn dashboards(&self) -> &[DashboardConfig];

    /// Every grid name recorded in the store
    async fn known_grids(&self) -> Result<Vec<String>>;
}

/// Catalog backed by the static dashboard list and the `grids` table
pub struct StoreCatalog {
    dashboards: Arc<Vec<DashboardConfig>>,
    store: Arc<dyn ProblemStore>,
}

impl StoreCatalog {
    pub fn new(dashboards: Arc<Vec<DashboardConfig>>, store: Arc<dyn ProblemStore>) -> Self {
        Self { dashboards, store }
    }
}

#[async_trait]
impl GridCatalog for StoreCatalog {
    fn dashboards(&self) -> &[DashboardConfig] {
        &self.dashboards
    }

    async fn known_grids(&self) -> Result<Vec<String>> {
        self.store.known_grids().await
    }
}

/// `true` when `filter` is empty or explicitly enables `name`
pub fn allows(filter: &BTreeMap<String, bool>, name: &str) -> bool {
    filter.is_empty() || enabled(filter, name)
}

/// `true` only when `name` is present in `filter` and set to `true`
pub fn enabled(filter: &BTreeMap<String, bool>, name: &str) -> bool {
    filter.get(name).copied().unwrap_or(false)
}

/// Grids a notification looks at.
///
/// With dashboard filters, the grids of every enabled dashboard; otherwise
/// every known grid. The grid filter applies in both cases.
pub async fn select_grids(catalog: &dyn GridCatalog, config: &NotificationConfig) -> Result<BTreeSet<String>> {
    if !config.dashboard_filters.is_empty() {
        return Ok(catalog
            .dashboards()
            .iter()
            .filter(|dashboard| enabled(&config.dashboard_filters, &dashboard.name))
            .flat_map(|dashboard| dashboard.grids.iter().map(|grid| grid.trim()))
            .filter(|grid| allows(&config.grid_filters, grid))
            .map(str::to_string)
            .collect());
    }

    Ok(catalog
        .known_grids()
        .await?
        .into_iter()
        .filter(|grid| allows(&config.grid_filters, grid))
        .collect())
}

/// Problems of the selected grids that pass the site, category and severity filters
pub async fn extract(
    catalog: &dyn GridCatalog,
    evaluator: &dyn AlertRuleEvaluator,
    config: &NotificationConfig,
) -> Result<Vec<NotifyProblem>, NotifyError> {
    let grids = select_grids(catalog, config).await.map_err(NotifyError::Store)?;
    debug!(grids = grids.len(), "Selected grids for notification");

    let passes = |category: &str, severity: i32| {
        allows(&config.category_filters, category) && severity >= config.min_severity
    };

    let mut problems = Vec::new();
    for grid in &grids {
        let mesh = GridMesh::new(grid.as_str());
        let report = evaluator.lookup_rule(grid)?.create_report(&mesh)?;

        // site filters narrow the notification to sites, so grid-wide problems are dropped
        if config.site_filters.is_empty() && report.global_max_severity >= config.min_severity {
            problems.extend(
                report
                    .global_problems
                    .iter()
                    .filter(|problem| passes(&problem.category, problem.severity))
                    .map(|problem| NotifyProblem::global(grid.as_str(), problem.clone())),
            );
        }

        for site in report.sites() {
            if !allows(&config.site_filters, site) {
                continue;
            }
            problems.extend(
                report
                    .site_problems(site)
                    .iter()
                    .filter(|problem| passes(&problem.category, problem.severity))
                    .map(|problem| NotifyProblem::for_site(grid.as_str(), site, problem.clone())),
            );
        }
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::evaluator::{EvaluatorError, Mesh, Report, Rule};
    use crate::notifications::problem::Problem;

    struct StaticCatalog {
        dashboards: Vec<DashboardConfig>,
        known: Vec<String>,
    }

    #[async_trait]
    impl GridCatalog for StaticCatalog {
        fn dashboards(&self) -> &[DashboardConfig] {
            &self.dashboards
        }

        async fn known_grids(&self) -> Result<Vec<String>> {
            Ok(self.known.clone())
        }
    }

    fn dashboard(name: &str, grids: &[&str]) -> DashboardConfig {
        DashboardConfig { name: name.to_string(), grids: grids.iter().map(|g| g.to_string()).collect() }
    }

    fn filter(entries: &[(&str, bool)]) -> BTreeMap<String, bool> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog {
            dashboards: vec![dashboard("D1", &["G1", " G2 "]), dashboard("D2", &["G3"])],
            known: vec!["G1".into(), "G2".into(), "G3".into(), "G4".into()],
        }
    }

    /// Every grid reports the same global and per-site problems
    struct FixedEvaluator;

    struct FixedRule;

    impl Rule for FixedRule {
        fn create_report(&self, _mesh: &dyn Mesh) -> Result<Report, EvaluatorError> {
            let mut report = Report {
                global_max_severity: 2,
                global_problems: vec![Problem::new("GRID", 2, "grid down")],
                sites: BTreeMap::new(),
            };
            report.sites.insert(
                "site_a".into(),
                vec![Problem::new("LOSS", 1, "loss at a"), Problem::new("DELAY", 3, "delay at a")],
            );
            report.sites.insert("site_b".into(), vec![Problem::new("LOSS", 2, "loss at b")]);
            Ok(report)
        }
    }

    impl AlertRuleEvaluator for FixedEvaluator {
        fn lookup_rule(&self, grid_name: &str) -> Result<Arc<dyn Rule>, EvaluatorError> {
            if grid_name == "broken" {
                return Err(EvaluatorError::NoRule(grid_name.to_string()));
            }
            Ok(Arc::new(FixedRule))
        }
    }

    #[tokio::test]
    async fn test_dashboard_filter_takes_precedence() {
        let config = NotificationConfig {
            dashboard_filters: filter(&[("D1", true)]),
            grid_filters: filter(&[("G2", true), ("G3", true)]),
            ..Default::default()
        };

        let grids = select_grids(&catalog(), &config).await.unwrap();
        assert_eq!(grids.into_iter().collect::<Vec<_>>(), vec!["G2"]);
    }

    #[tokio::test]
    async fn test_enabled_dashboard_selects_its_grids() {
        let config = NotificationConfig { dashboard_filters: filter(&[("D1", true)]), ..Default::default() };

        let grids = select_grids(&catalog(), &config).await.unwrap();
        assert_eq!(grids.into_iter().collect::<Vec<_>>(), vec!["G1", "G2"]);

        let problems = extract(&catalog(), &FixedEvaluator, &config).await.unwrap();
        assert!(problems.iter().all(|p| p.grid_name == "G1" || p.grid_name == "G2"));
        assert!(problems.iter().any(|p| p.grid_name == "G2"));
    }

    #[tokio::test]
    async fn test_grid_filter_without_dashboards() {
        let config = NotificationConfig { grid_filters: filter(&[("G4", true), ("G1", false)]), ..Default::default() };
        let grids = select_grids(&catalog(), &config).await.unwrap();
        assert_eq!(grids.into_iter().collect::<Vec<_>>(), vec!["G4"]);

        let grids = select_grids(&catalog(), &NotificationConfig::default()).await.unwrap();
        assert_eq!(grids.len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_dashboard_selects_nothing() {
        let config = NotificationConfig { dashboard_filters: filter(&[("D1", false)]), ..Default::default() };
        assert!(select_grids(&catalog(), &config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_severity_and_global_problems() {
        let catalog = StaticCatalog { dashboards: vec![], known: vec!["G1".into()] };
        let config = NotificationConfig { min_severity: 2, ..Default::default() };

        let problems = extract(&catalog, &FixedEvaluator, &config).await.unwrap();
        let descriptions: Vec<&str> = problems.iter().map(|p| p.problem.description.as_str()).collect();
        assert_eq!(descriptions, vec!["grid down", "delay at a", "loss at b"]);
        assert_eq!(problems[0].site, None);
        assert_eq!(problems[1].site.as_deref(), Some("site_a"));
    }

    #[tokio::test]
    async fn test_site_filter_drops_global_problems() {
        let catalog = StaticCatalog { dashboards: vec![], known: vec!["G1".into()] };
        let config = NotificationConfig {
            site_filters: filter(&[("site_b", true), ("site_a", false)]),
            ..Default::default()
        };

        let problems = extract(&catalog, &FixedEvaluator, &config).await.unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].problem.description, "loss at b");
    }

    #[tokio::test]
    async fn test_category_filter_requires_enabled_entry() {
        let catalog = StaticCatalog { dashboards: vec![], known: vec!["G1".into()] };
        let config = NotificationConfig {
            category_filters: filter(&[("LOSS", true), ("DELAY", false)]),
            ..Default::default()
        };

        let problems = extract(&catalog, &FixedEvaluator, &config).await.unwrap();
        assert!(problems.iter().all(|p| p.problem.category == "LOSS"));
        assert_eq!(problems.len(), 2);
    }

    #[tokio::test]
    async fn test_evaluator_error_aborts() {
        let catalog = StaticCatalog { dashboards: vec![], known: vec!["G1".into(), "broken".into()] };
        let result = extract(&catalog, &FixedEvaluator, &NotificationConfig::default()).await;
        assert!(matches!(result, Err(NotifyError::Evaluator(EvaluatorError::NoRule(_)))));
    }
}
