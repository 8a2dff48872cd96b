//! Child environment composition
//!
//! The final environment of a child is a pure function of the host
//! environment, the caller's overrides, extra `PATH` directories and the
//! allocated port. Later layers win: base, then overrides, then `PATH`
//! prefixing, then the injected port variables.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Separator between `PATH` entries on this platform
#[cfg(unix)]
pub const PATH_SEPARATOR: char = ':';
/// Separator between `PATH` entries on this platform
#[cfg(not(unix))]
pub const PATH_SEPARATOR: char = ';';

/// Snapshot of the current process environment
pub fn host_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// `<NAME>_PORT` for a service or terminal name: upper-cased, with every
/// non-alphanumeric character mapped to `_`
pub fn port_variable_name(name: &str) -> String {
    let mut var: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    var.push_str("_PORT");
    var
}

/// Prepend `prefix` directories to `path`, dropping later duplicates
pub fn augmented_path(prefix: &[PathBuf], path: Option<&str>) -> String {
    let mut seen = Vec::<String>::new();
    let existing = path
        .unwrap_or_default()
        .split(PATH_SEPARATOR)
        .map(str::to_string);
    for entry in prefix
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .chain(existing)
    {
        if !entry.is_empty() && !seen.contains(&entry) {
            seen.push(entry);
        }
    }
    seen.join(&PATH_SEPARATOR.to_string())
}

/// Build the complete environment for one child
///
/// `PORT` and `<NAME>_PORT` are set when `port` is given; they override any
/// caller-supplied value so the child always sees the allocated port.
pub fn compose_environment(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
    path_prefix: &[PathBuf],
    name: &str,
    port: Option<u16>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    if !path_prefix.is_empty() {
        let path = augmented_path(path_prefix, env.get("PATH").map(String::as_str));
        env.insert("PATH".to_string(), path);
    }

    if let Some(port) = port {
        env.insert("PORT".to_string(), port.to_string());
        env.insert(port_variable_name(name), port.to_string());
    }
    env
}
