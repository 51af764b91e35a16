//! Host name validation

use std::net::IpAddr;

use thiserror::Error;

/// Maximum length of a DNS name
const MAX_HOST_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host is empty")]
    Empty,

    #[error("host exceeds {MAX_HOST_LEN} characters")]
    TooLong,

    #[error("invalid IPv4 address {0:?}")]
    InvalidIpv4(String),

    #[error("invalid host {host:?}: {reason}")]
    InvalidLabel { host: String, reason: String },
}

/// Check that `value` is an IPv4/IPv6 literal or a DNS host name.
///
/// IPv6 literals may be wrapped in brackets. A single trailing dot is
/// accepted for fully qualified names.
pub fn validate_host(value: &str) -> Result<(), HostError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HostError::Empty);
    }

    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if unbracketed.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if trimmed.len() > MAX_HOST_LEN {
        return Err(HostError::TooLong);
    }
    if looks_like_ipv4(trimmed) {
        return Err(HostError::InvalidIpv4(value.to_string()));
    }

    let host = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if host.is_empty() {
        return Err(invalid(value, "empty label"));
    }
    for label in host.split('.') {
        validate_label(label).map_err(|reason| invalid(value, &reason))?;
    }
    Ok(())
}

/// Render IP literals in their standard form: brackets dropped, IPv6
/// compressed and lowercased. DNS names are only trimmed.
pub fn canonical_host(value: &str) -> String {
    let trimmed = value.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    match unbracketed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

fn invalid(host: &str, reason: &str) -> HostError {
    HostError::InvalidLabel {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("empty label".to_string());
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!("label {label:?} exceeds {MAX_LABEL_LEN} characters"));
    }
    if !label.is_ascii() {
        return Err(format!("label {label:?} contains non-ASCII characters"));
    }
    if let Some(c) = label.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(format!("label {label:?} contains invalid character {c:?}"));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("label {label:?} must not start or end with '-'"));
    }
    Ok(())
}

fn looks_like_ipv4(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
