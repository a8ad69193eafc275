//! `{{placeholder}}` rendering for shell command templates.
//!
//! Shell text is full of single braces (`${VAR}`, `awk '{print $2}'`), so command
//! templates use doubled braces and leave everything else untouched.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"));

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown placeholder {{{{{0}}}}}")]
pub struct TemplateError(pub String);

/// Placeholder names used by `template`, in order of appearance.
pub fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

/// Checks that every placeholder in `template` is one of `allowed`.
pub fn validate(template: &str, allowed: &[&str]) -> Result<(), TemplateError> {
    match placeholders(template).find(|name| !allowed.contains(name)) {
        Some(name) => Err(TemplateError(name.to_string())),
        None => Ok(()),
    }
}

pub fn render(template: &str, values: &HashMap<&str, String>) -> Result<String, TemplateError> {
    validate(template, &values.keys().copied().collect::<Vec<_>>())?;
    Ok(PLACEHOLDER
        .replace_all(template, |caps: &Captures| values[&caps[1]].clone())
        .into_owned())
}
