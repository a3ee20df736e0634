use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::checker::{ArchiveCheck, Check, CheckContext, CommandCheck};
use super::types::{CheckResult, CheckStatus};

/// Check implementations by type name, built once at start-up
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn Check>>,
}

impl CheckRegistry {
    /// Registry with the built-in command and archive checks
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let command: Arc<dyn Check> = Arc::new(CommandCheck);
        let archive: Arc<dyn Check> = Arc::new(ArchiveCheck::new(client));

        let mut registry = Self::default();
        registry.register("nagios", command.clone());
        registry.register("command", command);
        registry.register("psnagios", archive.clone());
        registry.register("archive", archive);
        registry
    }

    pub fn register(&mut self, check_type: impl Into<String>, check: Arc<dyn Check>) {
        self.checks.insert(check_type.into(), check);
    }

    pub fn get(&self, check_type: &str) -> Option<Arc<dyn Check>> {
        self.checks.get(check_type).cloned()
    }

    pub fn contains(&self, check_type: &str) -> bool {
        self.checks.contains_key(check_type)
    }
}

/// Monitoring executor - runs one check for one grid cell
pub struct MonitoringExecutor {
    registry: CheckRegistry,
}

impl MonitoringExecutor {
    pub fn new(registry: CheckRegistry) -> Self {
        Self { registry }
    }

    /// Execute a check of the given type
    pub async fn execute(&self, check_type: &str, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(check) = self.registry.get(check_type) else {
            warn!(check_type, grid = ctx.grid_name, "Unknown check type");
            return CheckResult::unknown(format!("Unknown check type {check_type}"));
        };

        let start = Instant::now();
        info!(check_type, grid = ctx.grid_name, row = ctx.row_name, col = ctx.col_name, "Check started");

        let result = check.check(ctx).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if result.status == CheckStatus::Unknown {
            warn!(check_type, grid = ctx.grid_name, row = ctx.row_name, col = ctx.col_name, elapsed_ms, message = %result.message, "Check ended without a verdict");
        } else {
            info!(check_type, grid = ctx.grid_name, row = ctx.row_name, col = ctx.col_name, elapsed_ms, status = %result.status, "Check ended");
        }
        result
    }
}
