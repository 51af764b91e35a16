//! Trojan connection links as returned by the deploy listener

use std::fmt;

use url::Url;

use crate::deploy::link::{LinkError, SCHEME};

/// Query keys that may carry the user when the fragment is empty
const USER_KEYS: [&str; 7] = ["email", "user", "username", "name", "remark", "remarks", "peer"];

/// Parsed connection link
#[derive(Clone, PartialEq, Eq)]
pub struct TrojanLink {
    pub password: String,
    pub host: String,
    pub port: u16,
    pub user: String,

    /// `None` when `security=none`
    pub sni: Option<String>,

    pub allow_insecure: bool,
}

impl fmt::Debug for TrojanLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrojanLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("sni", &self.sni)
            .field("allow_insecure", &self.allow_insecure)
            .finish_non_exhaustive()
    }
}

impl TrojanLink {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let url = Url::parse(raw.trim())?;
        if !url.scheme().eq_ignore_ascii_case(SCHEME) {
            return Err(LinkError::Scheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or(LinkError::MissingField("host"))?;
        let port = url.port().ok_or(LinkError::MissingField("port"))?;

        let password = percent_encoding::percent_decode_str(url.username())
            .decode_utf8()
            .map_err(|_| LinkError::InvalidValue {
                field: "password",
                value: url.username().to_string(),
            })?
            .trim()
            .to_string();
        if password.is_empty() {
            return Err(LinkError::MissingField("password"));
        }

        let mut user = url
            .fragment()
            .and_then(|f| percent_encoding::percent_decode_str(f).decode_utf8().ok())
            .map(|f| f.trim().to_string())
            .unwrap_or_default();

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let lookup = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if user.is_empty() {
            user = USER_KEYS.iter().find_map(|key| lookup(key)).unwrap_or_default();
        }

        let security = lookup("security").unwrap_or_else(|| "tls".to_string());
        let sni = if security.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(lookup("sni").unwrap_or_else(|| host.clone()))
        };

        let allow_insecure = match lookup("allowInsecure") {
            Some(value) => parse_bool(&value).ok_or(LinkError::InvalidValue {
                field: "allowInsecure",
                value,
            })?,
            None => false,
        };

        Ok(Self {
            password,
            host,
            port,
            user,
            sni,
            allow_insecure,
        })
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
