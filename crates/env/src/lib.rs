/// Parse a boolean-like env var.
///
/// Truthy values (case-insensitive): `1`, `true`, `yes`, `y`, `on`.
#[must_use]
pub fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// Compose documents routinely parameterize host ports this way
/// (`"${SCRAPER_PORT}:8080"`), so a missing variable is an error rather than
/// an empty substitution.
///
/// # Errors
///
/// Returns `Err(...)` when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = std::env::var(var_name).map_err(|_| {
                format!("Environment variable '{var_name}' not found (referenced in compose file)")
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}
