//! Host-pattern handling and the per-site protection decision
//!
//! Allow/deny lists hold host patterns (`example.com`, `*.example.com`).
//! A deny entry always wins; an allow entry only disables protection when
//! the login-preservation switch is on, so authenticated sessions on
//! trusted providers keep working untouched.

/// Login providers trusted by default when `preserve_auth` is enabled
pub const BUILTIN_TRUSTED: &[&str] = &[
    "accounts.google.com",
    "login.microsoftonline.com",
    "auth0.com",
    "okta.com",
    "login.yahoo.com",
    "secure.bankofamerica.com",
    "chase.com",
    "wellsfargo.com",
    "paypal.com",
    "amazon.com",
];

/// Normalize one raw pattern to `host` or `*.host` form.
///
/// Accepts bare hosts, full URLs and `.example.com` shorthand; rejects
/// empty, oversized, and wildcard-in-the-middle input.
pub fn normalize_host_pattern(raw: &str) -> Option<String> {
    let mut s: String = raw.trim().to_lowercase().split_whitespace().collect();

    if let Some((_, rest)) = s.split_once("://") {
        s = rest.to_string();
    }
    if let Some((host, _)) = s.split_once('/') {
        s = host.to_string();
    }

    if s.is_empty() || s.len() > 255 {
        return None;
    }

    if let Some(rest) = s.strip_prefix('.') {
        s = format!("*.{rest}");
    }

    // Only a leading *. wildcard is allowed
    let tail = if s.starts_with("*.") { &s[2..] } else { s.as_str() };
    if tail.is_empty() || tail.contains('*') {
        return None;
    }

    Some(s)
}

/// Match a hostname against a normalized pattern. `*.base` matches the
/// base itself and any subdomain.
pub fn pattern_match(hostname: &str, pattern: &str) -> bool {
    if hostname.is_empty() || pattern.is_empty() {
        return false;
    }
    if let Some(base) = pattern.strip_prefix("*.") {
        return hostname == base || hostname.ends_with(&format!(".{base}"));
    }
    hostname == pattern
}

/// Normalize, merge with the built-in trusted entries, and dedupe the
/// user's allow list
pub fn effective_allow_list(user_patterns: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = user_patterns
        .iter()
        .map(String::as_str)
        .chain(BUILTIN_TRUSTED.iter().copied())
        .filter_map(normalize_host_pattern)
        .collect();
    merged.sort();
    merged.dedup();
    merged
}

/// Normalize and dedupe the user's deny list
pub fn effective_deny_list(user_patterns: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = user_patterns
        .iter()
        .map(String::as_str)
        .filter_map(normalize_host_pattern)
        .collect();
    merged.sort();
    merged.dedup();
    merged
}

/// Hostname of a URL-ish string: scheme, path and port stripped,
/// lowercased. Unlike persona-domain normalization, `www.` is kept.
pub fn hostname_of(url: &str) -> String {
    let mut host = url.trim().to_lowercase();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest.to_string();
    }
    if let Some((before_path, _)) = host.split_once('/') {
        host = before_path.to_string();
    }
    if let Some((before_port, _)) = host.split_once(':') {
        host = before_port.to_string();
    }
    host
}

/// Origin of a URL: scheme + host + optional port, the identity the
/// deterministic seed derives from
pub fn origin_of(url: &str) -> String {
    let trimmed = url.trim();
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return hostname_of(trimmed);
    };
    let host_port = rest.split('/').next().unwrap_or(rest);
    format!("{}://{}", scheme.to_lowercase(), host_port.to_lowercase())
}

/// Whether protection applies to `hostname`. Deny always wins; an allow
/// hit only opts the site out when login preservation is on.
pub fn should_protect(
    hostname: &str,
    allow_list: &[String],
    deny_list: &[String],
    preserve_auth: bool,
) -> bool {
    let hostname = hostname.to_lowercase();

    if deny_list.iter().any(|p| pattern_match(&hostname, p)) {
        return true;
    }
    if preserve_auth && allow_list.iter().any(|p| pattern_match(&hostname, p)) {
        return false;
    }
    true
}
