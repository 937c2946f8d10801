use std::env::var;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;

/// Get the value of ENV var, or a default
///
/// Only when:
/// - It is set
/// - It is not empty
pub fn env_var_or_else(var_name: &'static str, or_else: fn() -> String) -> String {
    env_var(var_name).unwrap_or_else(or_else)
}

/// Get the value of ENV var when it is set and not empty
pub fn env_var(var_name: &'static str) -> Option<String> {
    var(var_name).ok().filter(|value| !value.is_empty())
}

/// Parse an ENV var, or use a default when it is not set
///
/// # Errors
///
/// Will return `Err` when the var is set but can not be parsed
pub fn env_parse_or<T>(var_name: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(var_name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("Invalid `{var_name}`: {value}")),
        None => Ok(default),
    }
}

/// Parse an ENV var holding milliseconds, or use a default
///
/// # Errors
///
/// Will return `Err` when the var is set but is not a number
pub fn env_millis_or(var_name: &'static str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);

    env_parse_or(var_name, default_ms).map(Duration::from_millis)
}
