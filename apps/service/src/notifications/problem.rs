use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// A condition reported by an alert rule, read-only to the notification engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub category: String,
    pub severity: i32,
    pub description: String,
    /// Opaque payload the channel receives back when the problem resolves
    pub app_data: Option<String>,
}

impl Problem {
    pub fn new(category: impl Into<String>, severity: i32, description: impl Into<String>) -> Self {
        Self { category: category.into(), severity, description: description.into(), app_data: None }
    }

    pub fn with_app_data(mut self, app_data: impl Into<String>) -> Self {
        self.app_data = Some(app_data.into());
        self
    }
}

/// A [`Problem`] together with the grid and site it was found on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyProblem {
    pub grid_name: String,
    /// `None` for grid-wide problems
    pub site: Option<String>,
    pub problem: Problem,
}

impl NotifyProblem {
    pub fn global(grid_name: impl Into<String>, problem: Problem) -> Self {
        Self { grid_name: grid_name.into(), site: None, problem }
    }

    pub fn for_site(grid_name: impl Into<String>, site: impl Into<String>, problem: Problem) -> Self {
        Self { grid_name: grid_name.into(), site: Some(site.into()), problem }
    }

    /// Stable identity of the underlying condition.
    ///
    /// Hex SHA-256 over the length-prefixed grid, site, category and
    /// description. Severity and app data are excluded so a problem that
    /// changes severity keeps its rate window.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, Some(&self.grid_name));
        update_field(&mut hasher, self.site.as_deref());
        update_field(&mut hasher, Some(&self.problem.category));
        update_field(&mut hasher, Some(&self.problem.description));
        hex::encode(hasher.finalize())
    }

    /// Payload persisted with the problem and handed back on resolution.
    ///
    /// Falls back to a JSON summary of the problem so a resolution can
    /// always be reported.
    pub fn app_data(&self) -> String {
        if let Some(app_data) = &self.problem.app_data {
            return app_data.clone();
        }
        serde_json::json!({
            "grid": self.grid_name,
            "site": self.site,
            "category": self.problem.category,
            "severity": self.problem.severity,
            "description": self.problem.description,
        })
        .to_string()
    }
}

fn update_field(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update(u64::MAX.to_be_bytes()),
    }
}

/// Order in which new problems are delivered: most severe first, then by
/// grid, site (grid-wide problems first), category and description
pub fn delivery_order(a: &NotifyProblem, b: &NotifyProblem) -> Ordering {
    b.problem
        .severity
        .cmp(&a.problem.severity)
        .then_with(|| a.grid_name.cmp(&b.grid_name))
        .then_with(|| a.site.cmp(&b.site))
        .then_with(|| a.problem.category.cmp(&b.problem.category))
        .then_with(|| a.problem.description.cmp(&b.problem.description))
}
