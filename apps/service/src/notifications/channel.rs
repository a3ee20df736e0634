use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

use super::problem::NotifyProblem;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unable to create notification of type {0}")]
    UnknownType(String),

    #[error("Invalid notification configuration: {0}")]
    InvalidConfig(String),
}

/// Delivery target of a notification
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the problems that need announcing and the app data of
    /// problems that resolved. Called once per run, possibly with both empty.
    async fn send(&self, notification_id: i64, problems: &[NotifyProblem], resolved: &[String]) -> Result<(), ChannelError>;
}

/// Channel that writes every delivery to the log
#[derive(Debug)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, problems, resolved), fields(channel = %self.name))]
    async fn send(&self, notification_id: i64, problems: &[NotifyProblem], resolved: &[String]) -> Result<(), ChannelError> {
        for problem in problems {
            info!(
                notification_id,
                grid = %problem.grid_name,
                site = problem.site.as_deref().unwrap_or("-"),
                category = %problem.problem.category,
                severity = problem.problem.severity,
                description = %problem.problem.description,
                "Problem detected"
            );
        }
        for app_data in resolved {
            info!(notification_id, app_data = %app_data, "Problem resolved");
        }
        Ok(())
    }
}

type Constructor = Arc<dyn Fn(&str, &Value) -> Result<Arc<dyn NotificationChannel>, ChannelError> + Send + Sync>;

/// Channel constructors by notification type
#[derive(Clone, Default)]
pub struct ChannelFactory {
    constructors: HashMap<String, Constructor>,
}

impl ChannelFactory {
    /// Factory knowing the built-in `log` type
    pub fn with_defaults() -> Self {
        let mut factory = Self::default();
        factory.register("log", |name, _params| Ok(Arc::new(LogChannel::new(name)) as Arc<dyn NotificationChannel>));
        factory
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&str, &Value) -> Result<Arc<dyn NotificationChannel>, ChannelError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    pub fn is_valid_type(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Build and initialise a channel named `name` from its parameters
    pub fn create(&self, name: &str, kind: &str, params: &Value) -> Result<Arc<dyn NotificationChannel>, ChannelError> {
        let constructor = self.constructors.get(kind).ok_or_else(|| ChannelError::UnknownType(kind.to_string()))?;
        if !params.is_object() {
            return Err(ChannelError::InvalidConfig(format!("params of {name} must be a table")));
        }
        constructor(name, params)
    }
}
