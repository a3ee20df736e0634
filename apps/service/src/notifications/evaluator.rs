//! Alert rule boundary and the built-in rule over live cell states.
//!
//! A rule turns the current state of one grid into a [`Report`]: problems
//! that affect the grid as a whole plus problems grouped per site.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use super::problem::Problem;
use crate::monitoring::{CellResult, CheckStatus};

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("No alert rule for grid {0}")]
    NoRule(String),
}

/// Topology handed to a rule
pub trait Mesh: Send + Sync {
    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct GridMesh {
    name: String,
}

impl GridMesh {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Mesh for GridMesh {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Evaluated alert state of one grid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub global_max_severity: i32,
    pub global_problems: Vec<Problem>,
    pub sites: BTreeMap<String, Vec<Problem>>,
}

impl Report {
    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn site_problems(&self, site: &str) -> &[Problem] {
        self.sites.get(site).map(Vec::as_slice).unwrap_or_default()
    }
}

pub trait Rule: Send + Sync {
    fn create_report(&self, mesh: &dyn Mesh) -> Result<Report, EvaluatorError>;
}

pub trait AlertRuleEvaluator: Send + Sync {
    fn lookup_rule(&self, grid_name: &str) -> Result<Arc<dyn Rule>, EvaluatorError>;
}

/// Latest result of every cell, fed by the check schedulers
#[derive(Debug, Default)]
pub struct CellStates {
    grids: RwLock<HashMap<String, BTreeMap<(String, String, String), CellResult>>>,
}

impl CellStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: CellResult) {
        let key = (result.row_name.clone(), result.col_name.clone(), result.check_name.clone());
        let mut grids = self.grids.write().unwrap_or_else(PoisonError::into_inner);
        grids.entry(result.grid_name.clone()).or_default().insert(key, result);
    }

    fn snapshot(&self, grid_name: &str) -> Vec<CellResult> {
        let grids = self.grids.read().unwrap_or_else(PoisonError::into_inner);
        grids.get(grid_name).map(|cells| cells.values().cloned().collect()).unwrap_or_default()
    }
}

/// Severity a failing cell contributes, `None` for healthy cells
fn severity_of(status: CheckStatus) -> Option<i32> {
    match status {
        CheckStatus::Warning | CheckStatus::Unknown => Some(1),
        CheckStatus::Critical => Some(2),
        CheckStatus::Ok | CheckStatus::NotRun | CheckStatus::Maintenance => None,
    }
}

/// Built-in evaluator: every failing cell is a problem of its row's site,
/// and a grid whose cells all fail gets a grid-wide problem
pub struct CellStateEvaluator {
    states: Arc<CellStates>,
    grids: BTreeSet<String>,
}

impl CellStateEvaluator {
    pub fn new(states: Arc<CellStates>, grids: impl IntoIterator<Item = String>) -> Self {
        Self { states, grids: grids.into_iter().collect() }
    }
}

impl AlertRuleEvaluator for CellStateEvaluator {
    fn lookup_rule(&self, grid_name: &str) -> Result<Arc<dyn Rule>, EvaluatorError> {
        if !self.grids.contains(grid_name) {
            return Err(EvaluatorError::NoRule(grid_name.to_string()));
        }
        Ok(Arc::new(CellStateRule { states: self.states.clone() }))
    }
}

struct CellStateRule {
    states: Arc<CellStates>,
}

impl Rule for CellStateRule {
    fn create_report(&self, mesh: &dyn Mesh) -> Result<Report, EvaluatorError> {
        let cells = self.states.snapshot(mesh.name());
        let mut report = Report::default();
        let mut failing = 0;

        for cell in &cells {
            let Some(severity) = severity_of(cell.result.status) else {
                continue;
            };
            failing += 1;

            let app_data = serde_json::json!({
                "grid": cell.grid_name,
                "row": cell.row_name,
                "col": cell.col_name,
                "check": cell.check_name,
                "status": cell.result.status,
                "message": cell.result.message,
                "checked_at": cell.checked_at.to_rfc3339(),
            });
            let problem = Problem::new(
                cell.check_name.clone(),
                severity,
                format!("{} from {} to {} is {}", cell.check_name, cell.row_name, cell.col_name, cell.result.status),
            )
            .with_app_data(app_data.to_string());

            report.global_max_severity = report.global_max_severity.max(severity);
            report.sites.entry(cell.row_name.clone()).or_default().push(problem);
        }

        if failing > 0 && failing == cells.len() {
            report.global_problems.push(Problem::new(
                "GRID",
                report.global_max_severity,
                format!("All checks in grid {} are failing", mesh.name()),
            ));
        }
        Ok(report)
    }
}
