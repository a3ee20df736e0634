//! Check parameter resolution and `%` macro substitution.
//!
//! A parameter is either a plain string or a table keyed by row name, then by
//! column name, with a `default` entry at each level:
//!
//! ```toml
//! [params.maUrl]
//! default = "http://%row/esmond"
//! [params.maUrl.site_a]
//! site_b = "http://archive.site-a.net/esmond"
//! default = "http://site-a.net/esmond"
//! ```
//!
//! Macro substitution runs as a fixed sequence of passes over a tokenized
//! template. A token is replaced by the first pass that knows it and is never
//! scanned again, so a row value that happens to look like a macro stays literal.

use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved key used as the fallback at both table levels
pub const DEFAULT_KEY: &str = "default";

/// Variables attached to a row or column, keyed without the `%row.`/`%col.` prefix
pub type TemplateVariableMap = BTreeMap<String, String>;

/// Event type macros understood by measurement archives
pub const EVENT_TYPES: [(&str, &str); 5] = [
    ("delayBuckets", "http://ggf.org/ns/nmwg/characteristic/delay/summary/20110317"),
    ("delay", "http://ggf.org/ns/nmwg/characteristic/delay/summary/20070921"),
    ("bandwidth", "http://ggf.org/ns/nmwg/characteristics/bandwidth/achievable/2.0"),
    ("iperf", "http://ggf.org/ns/nmwg/tools/iperf/2.0"),
    ("utilization", "http://ggf.org/ns/nmwg/characteristic/utilization/2.0"),
];

/// Resolve a parameter for a cell.
///
/// Most specific entry wins: `table[row][col]`, `table[row][default]`,
/// `table[default]`. Returns `None` when none of them hold a string.
pub fn resolve(param: &Value, row_name: &str, col_name: &str, default_key: &str) -> Option<String> {
    match param {
        Value::String(literal) => Some(literal.clone()),
        Value::Object(table) => {
            if let Some(Value::Object(row_table)) = table.get(row_name) {
                let cell = row_table
                    .get(col_name)
                    .and_then(Value::as_str)
                    .or_else(|| row_table.get(default_key).and_then(Value::as_str));
                if let Some(value) = cell {
                    return Some(value.to_owned());
                }
            }
            table.get(default_key).and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}

/// Everything a template may refer to
#[derive(Debug, Clone, Copy)]
pub struct MacroContext<'a> {
    pub row_name: &'a str,
    pub col_name: &'a str,
    pub row_vars: &'a TemplateVariableMap,
    pub col_vars: &'a TemplateVariableMap,
    /// Named values such as `maUrl`, referenced as `%maUrl`
    pub extra: &'a TemplateVariableMap,
}

impl<'a> MacroContext<'a> {
    /// Same cell seen from the column side; used for reverse-direction URLs
    pub fn swapped(&self, extra: &'a TemplateVariableMap) -> MacroContext<'a> {
        MacroContext {
            row_name: self.col_name,
            col_name: self.row_name,
            row_vars: self.col_vars,
            col_vars: self.row_vars,
            extra,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'t> {
    Text(&'t str),
    Resolved(String),
    /// Macro name without the leading `%`, e.g. `row.site` or `maUrl`
    Token(&'t str),
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split a template into literal text and `%name` / `%scope.name` tokens.
///
/// After `%row.` and `%col.` the longest variable key of that side is taken
/// as the name, so keys may hold any character; otherwise the name is a run
/// of word characters.
fn tokenize<'t>(template: &'t str, ctx: &MacroContext<'_>) -> Vec<Segment<'t>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = template[cursor..].find('%') {
        let percent = cursor + offset;
        let name_start = percent + 1;
        let mut name_end = ident_end(template, name_start);

        if name_end == name_start {
            cursor = name_start;
            continue;
        }
        if template[name_end..].starts_with('.') {
            let key_start = name_end + 1;
            let vars = match &template[name_start..name_end] {
                "row" => Some(ctx.row_vars),
                "col" => Some(ctx.col_vars),
                _ => None,
            };
            let key_end = vars
                .and_then(|vars| longest_key(vars, &template[key_start..]))
                .map_or_else(|| ident_end(template, key_start), |len| key_start + len);
            if key_end > key_start {
                name_end = key_end;
            }
        }

        if percent > text_start {
            segments.push(Segment::Text(&template[text_start..percent]));
        }
        segments.push(Segment::Token(&template[name_start..name_end]));
        text_start = name_end;
        cursor = name_end;
    }

    if text_start < template.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    segments
}

fn longest_key(vars: &TemplateVariableMap, rest: &str) -> Option<usize> {
    vars.keys().filter(|key| !key.is_empty() && rest.starts_with(key.as_str())).map(String::len).max()
}

fn ident_end(template: &str, start: usize) -> usize {
    template[start..].find(|c: char| !is_ident(c)).map_or(template.len(), |end| start + end)
}

type Pass<'c> = Box<dyn Fn(&str) -> Option<String> + 'c>;

/// Substitute every macro in `template`.
///
/// Passes, in order: `%row.<name>` (unknown names become empty),
/// `%col.<name>` (same), bare `%row`/`%col`, named extras, `%event.<name>`.
/// Tokens no pass recognises are left as written.
pub fn substitute(template: &str, ctx: &MacroContext<'_>) -> String {
    let passes: [Pass<'_>; 5] = [
        Box::new(|name: &str| scoped(name, "row").map(|var| ctx.row_vars.get(var).cloned().unwrap_or_default())),
        Box::new(|name: &str| scoped(name, "col").map(|var| ctx.col_vars.get(var).cloned().unwrap_or_default())),
        Box::new(|name: &str| match name {
            "row" => Some(ctx.row_name.to_owned()),
            "col" => Some(ctx.col_name.to_owned()),
            _ => None,
        }),
        Box::new(|name: &str| ctx.extra.get(name).cloned()),
        Box::new(|name: &str| {
            scoped(name, "event").and_then(|event| {
                EVENT_TYPES.iter().find(|(key, _)| *key == event).map(|(_, urn)| (*urn).to_owned())
            })
        }),
    ];

    let mut segments = tokenize(template, ctx);
    for pass in &passes {
        for segment in segments.iter_mut() {
            if let Segment::Token(name) = segment {
                if let Some(value) = pass(*name) {
                    *segment = Segment::Resolved(value);
                }
            }
        }
    }

    let mut output = String::with_capacity(template.len());
    for segment in &segments {
        match segment {
            Segment::Text(text) => output.push_str(text),
            Segment::Resolved(value) => output.push_str(value),
            Segment::Token(name) => {
                output.push('%');
                output.push_str(name);
            }
        }
    }
    output
}

fn scoped<'n>(name: &'n str, scope: &str) -> Option<&'n str> {
    name.strip_prefix(scope).and_then(|rest| rest.strip_prefix('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVariableMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_resolve_precedence() {
        let table = json!({
            "site_a": { "site_b": "X", "default": "Y" },
            "default": "Z"
        });

        assert_eq!(resolve(&table, "site_a", "site_b", DEFAULT_KEY).as_deref(), Some("X"));
        assert_eq!(resolve(&table, "site_a", "other", DEFAULT_KEY).as_deref(), Some("Y"));
        assert_eq!(resolve(&table, "other", "anything", DEFAULT_KEY).as_deref(), Some("Z"));
    }

    #[test]
    fn test_resolve_literal_and_missing() {
        assert_eq!(
            resolve(&json!("check_ping -H %col"), "a", "b", DEFAULT_KEY).as_deref(),
            Some("check_ping -H %col")
        );

        let no_default = json!({ "site_a": { "site_b": "X" } });
        assert_eq!(resolve(&no_default, "site_a", "site_c", DEFAULT_KEY), None);
        assert_eq!(resolve(&no_default, "site_c", "site_b", DEFAULT_KEY), None);
        assert_eq!(resolve(&json!(42), "a", "b", DEFAULT_KEY), None);
    }

    #[test]
    fn test_row_without_col_falls_back_to_table_default() {
        let table = json!({ "site_a": { "site_b": "X" }, "default": "Z" });
        assert_eq!(resolve(&table, "site_a", "site_c", DEFAULT_KEY).as_deref(), Some("Z"));
    }

    #[test]
    fn test_unknown_scoped_vars_are_stripped() {
        let row_vars = vars(&[("host", "ps.site-a.net")]);
        let col_vars = vars(&[("host", "ps.site-b.net")]);
        let extra = TemplateVariableMap::new();
        let ctx = MacroContext {
            row_name: "site_a",
            col_name: "site_b",
            row_vars: &row_vars,
            col_vars: &col_vars,
            extra: &extra,
        };

        let out = substitute("check -s %row.host -d %col.host -x %row.port%col.port -t %col.missing", &ctx);
        assert_eq!(out, "check -s ps.site-a.net -d ps.site-b.net -x  -t ");
        assert!(!out.contains("%row."));
        assert!(!out.contains("%col."));
    }

    #[test]
    fn test_scoped_keys_with_punctuation() {
        let row_vars = vars(&[("ps-host", "ps.site-a.net"), ("host.v6", "::1"), ("host", "site-a")]);
        let col_vars = vars(&[("ps-host", "ps.site-b.net")]);
        let extra = TemplateVariableMap::new();
        let ctx = MacroContext {
            row_name: "site_a",
            col_name: "site_b",
            row_vars: &row_vars,
            col_vars: &col_vars,
            extra: &extra,
        };

        assert_eq!(
            substitute("ping %row.ps-host and %row.host.v6 or %row.host to %col.ps-host", &ctx),
            "ping ps.site-a.net and ::1 or site-a to ps.site-b.net"
        );
        // keys only resolve on their own side; unknown names are still stripped
        assert_eq!(substitute("[%col.host.v6]", &ctx), "[.v6]");
        assert_eq!(substitute("[%col.host-x]", &ctx), "[-x]");
    }

    #[test]
    fn test_bare_row_and_col() {
        let empty = TemplateVariableMap::new();
        let ctx = MacroContext {
            row_name: "site_a",
            col_name: "site_b",
            row_vars: &empty,
            col_vars: &empty,
            extra: &empty,
        };

        assert_eq!(substitute("%row->%col.", &ctx), "site_a->site_b.");
        assert_eq!(substitute("100% done", &ctx), "100% done");
        assert_eq!(substitute("%unknown stays", &ctx), "%unknown stays");
    }

    #[test]
    fn test_event_macros_applied_last_and_not_shadowed() {
        let row_vars = vars(&[("type", "%event.delay")]);
        let empty = TemplateVariableMap::new();
        let ctx = MacroContext {
            row_name: "%event.iperf",
            col_name: "site_b",
            row_vars: &row_vars,
            col_vars: &empty,
            extra: &empty,
        };

        assert_eq!(
            substitute("%event.bandwidth", &ctx),
            "http://ggf.org/ns/nmwg/characteristics/bandwidth/achievable/2.0"
        );
        assert_eq!(
            substitute("%event.delayBuckets", &ctx),
            "http://ggf.org/ns/nmwg/characteristic/delay/summary/20110317"
        );
        // substituted values are never re-scanned
        assert_eq!(substitute("%row.type", &ctx), "%event.delay");
        assert_eq!(substitute("%row", &ctx), "%event.iperf");
        assert_eq!(substitute("%event.unknown", &ctx), "%event.unknown");
    }

    #[test]
    fn test_extra_vars_match_whole_names() {
        let empty = TemplateVariableMap::new();
        let extra = vars(&[("dstName", "host-b"), ("dstIP", "10.0.0.2"), ("maUrl", "http://ma")]);
        let ctx = MacroContext {
            row_name: "a",
            col_name: "b",
            row_vars: &empty,
            col_vars: &empty,
            extra: &extra,
        };

        assert_eq!(
            substitute("%maUrl/graph?dst=%dstName&ip=%dstIP", &ctx),
            "http://ma/graph?dst=host-b&ip=10.0.0.2"
        );
    }

    #[test]
    fn test_swapped_context() {
        let row_vars = vars(&[("host", "row-host")]);
        let col_vars = vars(&[("host", "col-host")]);
        let extra = vars(&[("maUrl", "forward")]);
        let none = TemplateVariableMap::new();
        let ctx = MacroContext {
            row_name: "site_a",
            col_name: "site_b",
            row_vars: &row_vars,
            col_vars: &col_vars,
            extra: &extra,
        };

        let reverse = ctx.swapped(&none);
        assert_eq!(substitute("%row %row.host %col %col.host %maUrl", &reverse), "site_b col-host site_a row-host %maUrl");
    }
}
