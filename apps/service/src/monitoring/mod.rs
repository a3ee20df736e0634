/// Check execution engine
///
/// This module is responsible for:
/// - Resolving per-cell check parameters and expanding `%` macros
/// - Running plug-in commands under a deadline
/// - Dispatching checks by type and scheduling them per grid cell
pub mod checker;
pub mod executor;
pub mod params;
pub mod process;
pub mod scheduler;
pub mod types;

pub use checker::CheckContext;
pub use executor::{CheckRegistry, MonitoringExecutor};
pub use scheduler::{CellCheck, CellResult, MonitoringScheduler};
pub use types::CheckStatus;
