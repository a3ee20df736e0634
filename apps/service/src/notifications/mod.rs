/// Notification engine
///
/// Turns evaluated grid state into deduplicated, rate-limited deliveries:
/// problems are extracted per notification, reconciled against the problem
/// ledger and handed to a channel together with what has resolved.
pub mod channel;
pub mod engine;
pub mod evaluator;
pub mod extractor;
pub mod problem;

pub use channel::{ChannelFactory, NotificationChannel};
pub use engine::{NotificationEngine, RunSummary};
pub use evaluator::{CellStateEvaluator, CellStates};

use std::collections::BTreeMap;

/// Runtime settings of one notification target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationConfig {
    pub min_severity: i32,
    /// Seconds before a still-present problem is announced again; `<= 0` announces every run
    pub frequency: i64,
    /// Seconds a problem must be absent before it is reported resolved; `<= 0` disables resolution
    pub resolve_after: i64,
    pub dashboard_filters: BTreeMap<String, bool>,
    pub grid_filters: BTreeMap<String, bool>,
    pub site_filters: BTreeMap<String, bool>,
    pub category_filters: BTreeMap<String, bool>,
}
