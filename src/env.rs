//! Environment variable expansion for configuration values and descriptor keys
//!
//! References use the `${VAR_NAME}` syntax. Both the daemon configuration
//! (descriptor directory) and the `Exec` key of mountable descriptors may
//! contain them, e.g. `Exec=${LIBEXECDIR}/vfsd-sftp`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

/// Matches `${VAR_NAME}` references
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Expand `${VAR}` references using `lookup` to resolve each name.
///
/// Every unresolved name is collected so the caller sees them all at once.
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded.into_owned())
}

/// Expand `${VAR}` references from the process environment
pub fn expand_env(input: &str) -> Result<String, ConfigError> {
    expand_with(input, |name| env::var(name).ok())
}
