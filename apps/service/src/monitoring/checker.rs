use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::params::{self, DEFAULT_KEY, MacroContext, TemplateVariableMap};
use super::process::{self, ProcessError};
use super::types::{CheckResult, CheckStatus};

pub const PARAM_COMMAND: &str = "command";
pub const PARAM_MA_URL: &str = "maUrl";
pub const PARAM_MD_KEY_LOOKUP: &str = "metaDataKeyLookup";
pub const PARAM_GRAPH_URL: &str = "graphUrl";

/// Everything a check needs to know about the cell it runs for
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub grid_name: &'a str,
    pub row_name: &'a str,
    pub col_name: &'a str,
    pub params: &'a Map<String, Value>,
    pub row_vars: &'a TemplateVariableMap,
    pub col_vars: &'a TemplateVariableMap,
    pub timeout_seconds: u64,
}

impl<'a> CheckContext<'a> {
    pub fn macros<'b>(&'b self, extra: &'b TemplateVariableMap) -> MacroContext<'b> {
        MacroContext {
            row_name: self.row_name,
            col_name: self.col_name,
            row_vars: self.row_vars,
            col_vars: self.col_vars,
            extra,
        }
    }

    /// Parameter value, treating an explicit `null` like a missing key
    pub fn param(&self, name: &str) -> Option<&'a Value> {
        self.params.get(name).filter(|value| !value.is_null())
    }
}

/// A kind of check a grid cell can run.
///
/// Implementations never fail: configuration and execution problems are
/// reported as an `UNKNOWN` result with a message saying what went wrong.
#[async_trait]
pub trait Check: Send + Sync {
    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult;
}

/// Runs a Nagios-style plug-in and reports its exit code and first output line
#[derive(Debug, Clone, Default)]
pub struct CommandCheck;

impl CommandCheck {
    /// Run an already substituted command line
    pub async fn run_command(&self, command: &str, timeout_seconds: u64) -> CheckResult {
        let start = Instant::now();
        debug!(command, "Executing command");

        let output = match process::run(command, timeout_seconds).await {
            Ok(output) => output,
            Err(e @ ProcessError::Timeout(_)) => {
                warn!(command, timeout_seconds, "Check command timed out");
                return CheckResult::unknown(e.to_string());
            }
            Err(e) => {
                error!(command, error = %e, "Error running check command");
                return CheckResult::unknown(format!("Exception executing command: {e}"));
            }
        };

        let Some(status) = output.exit_code.and_then(CheckStatus::from_code) else {
            let code = output.exit_code.map_or_else(|| "none".to_string(), |code| code.to_string());
            return CheckResult::unknown(format!(
                "Unknown return status {code} from command. Verify that it is a valid Nagios plug-in"
            ));
        };

        let line = output.first_line();
        debug!(command, %status, elapsed_ms = start.elapsed().as_millis() as u64, "Check command finished");
        CheckResult::new(status, format_output_line(line)).with_stats(parse_return_params(line))
    }
}

#[async_trait]
impl Check for CommandCheck {
    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(param) = ctx.param(PARAM_COMMAND) else {
            return CheckResult::unknown("Command not defined. Please check config file");
        };
        let Some(command) = params::resolve(param, ctx.row_name, ctx.col_name, DEFAULT_KEY) else {
            return CheckResult::unknown("Default command not defined. Please check config file");
        };

        let no_extra = TemplateVariableMap::new();
        let command = params::substitute(&command, &ctx.macros(&no_extra));
        self.run_command(&command, ctx.timeout_seconds).await
    }
}

/// Message shown on the dashboard: the plug-in's status prefix
/// (`PING OK -`) and its performance data removed
pub fn format_output_line(line: Option<&str>) -> String {
    let Some(mut line) = line else {
        return String::new();
    };

    if let Some(rest) = strip_status_prefix(line) {
        line = rest;
    }
    if let Some(pipe) = line.find('|') {
        if pipe + 1 < line.len() {
            line = &line[..pipe];
        }
    }
    line.trim().to_string()
}

/// `<word> <word> -` at the very start of the line
fn strip_status_prefix(line: &str) -> Option<&str> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';

    let first_end = line.find(|c: char| !is_word(c))?;
    let rest = line[first_end..].strip_prefix(' ').filter(|_| first_end > 0)?;
    let second_end = rest.find(|c: char| !is_word(c))?;
    if second_end == 0 {
        return None;
    }
    rest[second_end..].strip_prefix(" -")
}

/// Performance data after the last `|`, as `key=value` pairs separated by `;`
pub fn parse_return_params(line: Option<&str>) -> Option<HashMap<String, String>> {
    let line = line?;
    let parts: Vec<&str> = line.split('|').collect();
    let non_empty = parts.iter().rposition(|part| !part.is_empty()).map_or(0, |last| last + 1);
    if non_empty <= 1 {
        return None;
    }

    let stats = parts[non_empty - 1]
        .split(';')
        .map(str::trim)
        .filter_map(|pair| {
            let mut kv = pair.split('=');
            match (kv.next(), kv.next(), kv.next()) {
                (Some(key), Some(value), None) if !value.is_empty() => Some((key.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect();
    Some(stats)
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid lookup URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("lookup returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("lookup response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lookup response is not a JSON object")]
    NotAnObject,
}

/// Keys returned by the metadata lookup service and the macros they fill
const LOOKUP_FIELDS: [(&str, &str); 7] = [
    ("maKey", "maKeyF"),
    ("maKeyR", "maKeyR"),
    ("src", "srcName"),
    ("srcIP", "srcIP"),
    ("dst", "dstName"),
    ("dstIP", "dstIP"),
    ("eventType", "eventType"),
];

/// Command check against a measurement archive.
///
/// Besides running the plug-in it resolves the archive URL in both
/// directions, asks the archive for the keys of the measured data and
/// attaches a graph link built from them to the result stats.
#[derive(Debug, Clone)]
pub struct ArchiveCheck {
    client: reqwest::Client,
    command: CommandCheck,
}

impl ArchiveCheck {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, command: CommandCheck }
    }

    pub async fn lookup_keys(&self, lookup_url: &str) -> Result<TemplateVariableMap, LookupError> {
        let url = url::Url::parse(lookup_url)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status));
        }

        let body = response.text().await?;
        let Value::Object(fields) = serde_json::from_str::<Value>(&body)? else {
            return Err(LookupError::NotAnObject);
        };

        Ok(LOOKUP_FIELDS
            .iter()
            .map(|(field, var)| {
                let rendered = match fields.get(*field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "null".to_string(),
                };
                ((*var).to_string(), rendered)
            })
            .collect())
    }
}

#[async_trait]
impl Check for ArchiveCheck {
    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(ma_param) = ctx.param(PARAM_MA_URL) else {
            return CheckResult::unknown("maUrl not defined. Please check config file");
        };
        let Some(ma_url) = params::resolve(ma_param, ctx.row_name, ctx.col_name, DEFAULT_KEY) else {
            return CheckResult::unknown("Default MA URL not defined. Please check config file");
        };
        let no_extra = TemplateVariableMap::new();
        let ma_url = params::substitute(&ma_url, &ctx.macros(&no_extra));

        // the reverse direction reads the same table with row and column swapped
        let ma_url_reverse = match params::resolve(ma_param, ctx.col_name, ctx.row_name, DEFAULT_KEY) {
            Some(reverse) => params::substitute(&reverse, &ctx.macros(&no_extra).swapped(&no_extra)),
            None => ma_url.clone(),
        };

        let mut vars = TemplateVariableMap::new();
        vars.insert(PARAM_MA_URL.to_string(), ma_url.clone());
        vars.insert("maUrlReverse".to_string(), ma_url_reverse);

        let lookup_url = ctx
            .param(PARAM_MD_KEY_LOOKUP)
            .and_then(|param| params::resolve(param, ctx.row_name, ctx.col_name, DEFAULT_KEY))
            .map(|template| params::substitute(&template, &ctx.macros(&vars)));

        let Some(graph_param) = ctx.param(PARAM_GRAPH_URL) else {
            return CheckResult::unknown("graphUrl not defined. Please check config file");
        };
        let Some(graph_url) = params::resolve(graph_param, ctx.row_name, ctx.col_name, DEFAULT_KEY) else {
            return CheckResult::unknown("Default graph URL not defined. Please check config file");
        };

        let Some(command) = ctx
            .param(PARAM_COMMAND)
            .and_then(|param| params::resolve(param, ctx.row_name, ctx.col_name, DEFAULT_KEY))
        else {
            return CheckResult::unknown("Command not defined. Please check config file");
        };
        let command = params::substitute(&command, &ctx.macros(&vars));

        let mut result = self.command.run_command(&command, ctx.timeout_seconds).await;
        result.insert_stat(PARAM_MA_URL, ma_url);

        if let Some(lookup_url) = lookup_url {
            let start = Instant::now();
            match self.lookup_keys(&lookup_url).await {
                Ok(keys) => {
                    debug!(url = %lookup_url, elapsed_ms = start.elapsed().as_millis() as u64, "Metadata key lookup finished");
                    vars.extend(keys);
                }
                Err(e) => {
                    warn!(url = %lookup_url, grid = ctx.grid_name, error = %e, "Error getting metadata key");
                    return result;
                }
            }
        }

        let graph_url = params::substitute(&graph_url, &ctx.macros(&vars));
        result.insert_stat(PARAM_GRAPH_URL, graph_url);
        result
    }
}
