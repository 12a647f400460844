use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid placeholder regex"))
}

/// Returns the variable name when `value` is exactly a `${NAME}` placeholder.
///
/// Used by the stdio transports, which substitute whole environment entries
/// rather than fragments inside a larger string.
pub fn exact_placeholder(value: &str) -> Option<&str> {
    let name = value.strip_prefix("${")?.strip_suffix('}')?;
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some(name)
    } else {
        None
    }
}

/// Replaces every embedded `${NAME}` occurrence in `value`.
///
/// Resolution order: the provider-local `scope` map first (whose own values
/// may themselves be exact `${NAME}` placeholders resolved against the host
/// environment), then the host environment. Placeholders that resolve to
/// nothing are left in place.
pub fn substitute(value: &str, scope: &HashMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(value, |caps: &regex::Captures| {
            let name = &caps[1];
            if let Some(scoped) = scope.get(name) {
                match exact_placeholder(scoped) {
                    Some(var) => {
                        if let Ok(host) = std::env::var(var) {
                            return host;
                        }
                    }
                    None => return scoped.clone(),
                }
            }
            match std::env::var(name) {
                Ok(host) => host,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}
