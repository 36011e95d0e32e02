//! `${name}` substitution over a flat variable map

use std::collections::HashMap;

use regex::{Captures, Regex};

lazy_static::lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"\$\{([^}]*)\}").unwrap();
}

/// Prefixes resolved by someone else (secret store, environment, step outputs).
const PASSTHROUGH_PREFIXES: &[&str] = &["secret:", "env.", "step."];

fn is_passthrough(expr: &str) -> bool {
    PASSTHROUGH_PREFIXES.iter().any(|p| expr.starts_with(p))
}

/// Substitute `${name}` references from `variables` in a single pass.
///
/// Passthrough tokens and unknown names are left untouched, so a template
/// with nothing resolvable comes back unchanged.
pub fn interpolate(template: &str, variables: &HashMap<String, String>) -> String {
    if !template.contains("${") {
        return template.to_string();
    }
    TOKEN_RE
        .replace_all(template, |caps: &Captures| {
            let expr = caps[1].trim();
            if is_passthrough(expr) {
                return caps[0].to_string();
            }
            match variables.get(expr) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub fn interpolate_opt(
    template: Option<&str>,
    variables: &HashMap<String, String>,
) -> Option<String> {
    template.map(|t| interpolate(t, variables))
}

pub fn interpolate_map(
    map: &HashMap<String, String>,
    variables: &HashMap<String, String>,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), interpolate(v, variables)))
        .collect()
}

/// Plain variable references in `template` (passthrough tokens excluded).
pub fn unresolved_references(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TOKEN_RE.captures_iter(template) {
        let expr = caps[1].trim();
        if expr.is_empty() || is_passthrough(expr) {
            continue;
        }
        if !names.iter().any(|n| n == expr) {
            names.push(expr.to_string());
        }
    }
    names
}

/// Render a template for logs: variables resolved, secrets masked.
pub fn redact_for_log(template: &str, variables: &HashMap<String, String>) -> String {
    let rendered = interpolate(template, variables);
    TOKEN_RE
        .replace_all(&rendered, |caps: &Captures| {
            if caps[1].trim().starts_with("secret:") {
                "[REDACTED]".to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
