//! Environment variable expansion for config files.
//!
//! Recognised forms:
//! - `$VAR` or `${VAR}`: required, error if unset
//! - `${VAR:-fallback}`: fallback when VAR is unset or empty
//! - `${VAR-fallback}`: fallback only when VAR is unset
//! - `$$`: a literal `$`
//!
//! Secrets such as the storage access key are normally injected this way.

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static VAR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<fallback>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("variable reference pattern is valid")
});

/// Expand every variable reference in `input`.
///
/// All problems are collected so a single run reports every missing
/// variable instead of the first one.
pub fn expand(input: &str) -> Result<String, Vec<String>> {
    let mut problems = Vec::new();

    let expanded = VAR_REFERENCE.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let name = caps
            .name("braced")
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let op = caps.name("op").map(|m| m.as_str());
        let fallback = caps.name("fallback").map(|m| m.as_str());

        match env::var(name) {
            Ok(value) if value.contains(['\n', '\r']) => {
                problems.push(format!("variable '{name}' contains a line break"));
                whole.to_string()
            }
            Ok(value) if value.is_empty() && op == Some(":-") => {
                fallback.unwrap_or_default().to_string()
            }
            Ok(value) => value,
            Err(_) => match fallback {
                Some(fallback) => fallback.to_string(),
                None => {
                    problems.push(format!("variable '{name}' is not set"));
                    whole.to_string()
                }
            },
        }
    });

    if problems.is_empty() {
        Ok(expanded.into_owned())
    } else {
        Err(problems)
    }
}
