use std::collections::{BTreeMap, BTreeSet};
use std::{env, fmt, fs, io, path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::monitoring::params::TemplateVariableMap;
use crate::notifications::NotificationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: path::PathBuf, source: io::Error },

    #[error("failed to write config {path}: {source}")]
    Write { path: path::PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no config path available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the local libsql database
    pub database: path::PathBuf,
    pub pool_size: usize,
    /// Used by checks that do not set their own timeout
    pub check_timeout_seconds: u64,
    /// Upper bound on a single notification run
    pub run_deadline_seconds: u64,
    pub dashboards: Vec<DashboardConfig>,
    pub grids: Vec<GridConfig>,
    pub notifications: Vec<NotificationSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub name: String,
    #[serde(default)]
    pub grids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<GridMember>,
    #[serde(default)]
    pub columns: Vec<GridMember>,
    /// Skip cells whose row and column are the same site
    #[serde(default = "default_true")]
    pub exclude_self: bool,
    #[serde(default)]
    pub checks: Vec<CheckSettings>,
}

/// A row or column of a grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMember {
    pub name: String,
    /// Values for `%row.<name>` / `%col.<name>` macros
    #[serde(default)]
    pub vars: TemplateVariableMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSettings {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default = "default_check_interval")]
    pub interval_seconds: u64,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub min_severity: i32,
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    #[serde(default)]
    pub resolve_after: i64,
    #[serde(default = "default_notification_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub filters: FilterSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub dashboards: BTreeMap<String, bool>,
    pub grids: BTreeMap<String, bool>,
    pub sites: BTreeMap<String, bool>,
    pub categories: BTreeMap<String, bool>,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    300
}

fn default_frequency() -> i64 {
    3600
}

fn default_notification_interval() -> u64 {
    300
}

impl NotificationSettings {
    pub fn to_runtime(&self) -> NotificationConfig {
        NotificationConfig {
            min_severity: self.min_severity,
            frequency: self.frequency,
            resolve_after: self.resolve_after,
            dashboard_filters: self.filters.dashboards.clone(),
            grid_filters: self.filters.grids.clone(),
            site_filters: self.filters.sites.clone(),
            category_filters: self.filters.categories.clone(),
        }
    }

    pub fn params_json(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/gridwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("gridwatch/config.toml"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: path::PathBuf::from("data/gridwatch.db"),
            pool_size: 20,
            check_timeout_seconds: 60,
            run_deadline_seconds: 300,
            dashboards: Vec::new(),
            grids: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
        };

        let write_title_1 = write_title_indented(1);
        let write_title_2 = write_title_indented(2);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Storage")?;
        write_1(f, "Database", &self.database.display())?;
        write_1(f, "Pool Size", &self.pool_size)?;
        write_title_1(f, "Limits")?;
        write_1(f, "Check Timeout (s)", &self.check_timeout_seconds)?;
        write_1(f, "Notification Run Deadline (s)", &self.run_deadline_seconds)?;

        write_title_1(f, "Dashboards")?;
        for dashboard in &self.dashboards {
            write_1(f, &dashboard.name, &dashboard.grids.join(", "))?;
        }

        write_title_1(f, "Grids")?;
        for grid in &self.grids {
            write_title_2(f, &grid.name)?;
            write_2(f, "Rows", &grid.rows.len())?;
            write_2(f, "Columns", &grid.columns.len())?;
            let checks: Vec<String> = grid.checks.iter().map(|c| format!("{} ({})", c.name, c.check_type)).collect();
            write_2(f, "Checks", &checks.join(", "))?;
        }

        write_title_1(f, "Notifications")?;
        for notification in &self.notifications {
            write_title_2(f, &format!("{} ({})", notification.name, notification.kind))?;
            write_2(f, "Minimum Severity", &notification.min_severity)?;
            write_2(f, "Frequency (s)", &notification.frequency)?;
            write_2(f, "Resolve After (s)", &notification.resolve_after)?;
            write_2(f, "Interval (s)", &notification.interval_seconds)?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/gridwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::Read { path: config_path.clone(), source })?;
            Self::from_toml(&raw_string)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Parse a config and sort its dashboards by name
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        config.dashboards.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// Reject configs the service could not run with.
    ///
    /// `is_valid_type` decides which notification types exist.
    pub fn validate(&self, is_valid_type: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        let mut grid_names = BTreeSet::new();
        for grid in &self.grids {
            if grid.name.trim().is_empty() {
                return Err(ConfigError::Invalid("grid with an empty name".into()));
            }
            if !grid_names.insert(grid.name.as_str()) {
                return Err(ConfigError::Invalid(format!("grid {} is defined twice", grid.name)));
            }
        }

        let mut notification_names = BTreeSet::new();
        for notification in &self.notifications {
            if !is_valid_type(&notification.kind) {
                return Err(ConfigError::Invalid(format!(
                    "notification {} has invalid type {}",
                    notification.name, notification.kind
                )));
            }
            if !notification_names.insert((notification.name.as_str(), notification.kind.as_str())) {
                return Err(ConfigError::Invalid(format!("notification {} is defined twice", notification.name)));
            }
        }
        Ok(())
    }
}
