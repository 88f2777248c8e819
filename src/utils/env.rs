/// Get environment variable with TIDEHOOK_ prefix, falling back to unprefixed version
///
/// Checks `TIDEHOOK_{key}` first, then `{key}`, so deployments can keep
/// provider-conventional names like `WEBHOOK_SECRET`.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TIDEHOOK_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse an environment variable, ignoring values that don't parse
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}
