//! Encrypted deploy link codec
//!
//! The canonical link is a trojan connection string rendered
//! deterministically from a [`Manifest`]:
//!
//! ```text
//! trojan://<password>@<host>:<port>?security=tls&sni=<host>[&install_dir=..][&deploy_version=..][&exp=..]#<user>
//! ```
//!
//! The same text is the key material for the manifest ciphertext:
//! `SHA-512(link)` yields the AES-256 key (bytes 0..32) and the GCM nonce
//! (bytes 32..44). Anyone holding the link can open the ciphertext, and a
//! ciphertext opens under exactly one link.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::{Digest, Sha512};
use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::deploy::manifest::{Manifest, ManifestError};

/// Bearer link scheme
pub const SCHEME: &str = "trojan";

/// Additional authenticated data bound into every seal
const AAD: &[u8] = b"XP2PDEPLOY|v=2";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Characters escaped in the password (userinfo) part
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Characters escaped in the user (fragment) part
const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`');

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid scheme {0:?} (expected {SCHEME})")]
    Scheme(String),

    #[error("link is missing {0}")]
    MissingField(&'static str),

    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("parse link: {0}")]
    Url(#[from] url::ParseError),

    #[error("manifest authentication failed")]
    Decrypt,

    #[error("manifest encryption failed")]
    Encrypt,

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// A manifest sealed under its own canonical link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedLink {
    /// Canonical bearer link, also the key material
    pub link: String,

    /// Tunnel host
    pub host: String,

    /// Trojan port
    pub port: String,

    /// AES-256-GCM sealed manifest JSON, empty for parsed links
    pub ciphertext: Vec<u8>,

    /// Expiry as unix seconds
    pub expires_at: i64,

    /// The manifest the link was rendered from
    pub manifest: Manifest,
}

impl EncryptedLink {
    /// Open a ciphertext with this link as key material
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Manifest, LinkError> {
        decrypt(&self.link, ciphertext)
    }

    /// Link with the password masked, safe for logs
    pub fn redacted(&self) -> String {
        redact(&self.link)
    }
}

/// Build the canonical link for `manifest` and seal the manifest with it.
///
/// An empty manifest host defaults to `remote_host`, and a zero expiry
/// becomes `now + ttl`.
pub fn build(
    remote_host: &str,
    manifest: Manifest,
    ttl: Duration,
) -> Result<(String, EncryptedLink), LinkError> {
    let mut manifest = manifest;
    if manifest.host.trim().is_empty() {
        manifest.host = remote_host.trim().to_string();
    }
    let mut manifest = manifest.normalize();
    if manifest.expires_at == 0 {
        manifest.expires_at = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| Utc::now().timestamp().checked_add(secs))
            .ok_or_else(|| LinkError::InvalidValue {
                field: "ttl",
                value: ttl.as_secs().to_string(),
            })?;
    }
    manifest.validate()?;

    let link = canonical_link(&manifest)?;
    let ciphertext = encrypt(&link, &manifest)?;

    let enc = EncryptedLink {
        link: link.clone(),
        host: manifest.host.clone(),
        port: manifest.trojan_port.clone(),
        ciphertext,
        expires_at: manifest.expires_at,
        manifest,
    };
    Ok((link, enc))
}

/// Parse a bearer link and re-render it in canonical form
pub fn parse(raw: &str) -> Result<EncryptedLink, LinkError> {
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
    let password = decode_component(url.username(), "password")?;
    if password.trim().is_empty() {
        return Err(LinkError::MissingField("password"));
    }
    let user = match url.fragment() {
        Some(fragment) => decode_component(fragment, "user")?,
        None => String::new(),
    };

    let mut manifest = Manifest {
        host,
        trojan_port: port.to_string(),
        trojan_user: user,
        trojan_password: password,
        ..Default::default()
    };
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "install_dir" => manifest.install_dir = value.into_owned(),
            "deploy_version" => {
                manifest.version = value.trim().parse().map_err(|_| LinkError::InvalidValue {
                    field: "deploy_version",
                    value: value.to_string(),
                })?
            }
            "exp" => {
                manifest.expires_at = value.trim().parse().map_err(|_| LinkError::InvalidValue {
                    field: "exp",
                    value: value.to_string(),
                })?
            }
            _ => {}
        }
    }

    let manifest = manifest.normalize();
    manifest.validate()?;
    let link = canonical_link(&manifest)?;

    Ok(EncryptedLink {
        link,
        host: manifest.host.clone(),
        port: manifest.trojan_port.clone(),
        ciphertext: Vec::new(),
        expires_at: manifest.expires_at,
        manifest,
    })
}

/// Seal `manifest` with key material derived from `link`
pub fn encrypt(link: &str, manifest: &Manifest) -> Result<Vec<u8>, LinkError> {
    let payload = manifest.marshal()?;
    seal(link, &payload)
}

/// Open `ciphertext` with key material derived from `link`
pub fn decrypt(link: &str, ciphertext: &[u8]) -> Result<Manifest, LinkError> {
    let (cipher, nonce) = derive_cipher(link)?;
    let plain = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: AAD,
            },
        )
        .map_err(|_| LinkError::Decrypt)?;
    Ok(Manifest::unmarshal(&plain)?)
}

/// Render the canonical link. Requires host, port, password and user.
pub fn canonical_link(manifest: &Manifest) -> Result<String, LinkError> {
    let m = manifest.clone().normalize();
    if m.host.is_empty() {
        return Err(LinkError::MissingField("host"));
    }
    if m.trojan_port.is_empty() {
        return Err(LinkError::MissingField("port"));
    }
    if m.trojan_port.parse::<u16>().is_err() {
        return Err(LinkError::InvalidValue {
            field: "port",
            value: m.trojan_port.clone(),
        });
    }
    if m.trojan_password.is_empty() {
        return Err(LinkError::MissingField("password"));
    }
    if m.trojan_user.is_empty() {
        return Err(LinkError::MissingField("user"));
    }

    let mut extra = Vec::new();
    if !m.install_dir.is_empty() {
        extra.push(("install_dir", m.install_dir.clone()));
    }
    if m.version > 0 {
        extra.push(("deploy_version", m.version.to_string()));
    }
    if m.expires_at > 0 {
        extra.push(("exp", m.expires_at.to_string()));
    }

    Ok(render_trojan_link(
        &m.trojan_password,
        &m.host,
        &m.trojan_port,
        &m.trojan_user,
        &extra,
    ))
}

/// Render a trojan connection link with the fixed `security`/`sni` prefix
/// followed by `extra` query pairs in the given order.
pub fn render_trojan_link(
    password: &str,
    host: &str,
    port: &str,
    user: &str,
    extra: &[(&str, String)],
) -> String {
    let authority_host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("security", "tls");
    query.append_pair("sni", host);
    for (key, value) in extra {
        query.append_pair(key, value);
    }

    format!(
        "{SCHEME}://{}@{}:{}?{}#{}",
        utf8_percent_encode(password, USERINFO),
        authority_host,
        port,
        query.finish(),
        utf8_percent_encode(user, FRAGMENT),
    )
}

/// Mask the password of a trojan link
pub fn redact(link: &str) -> String {
    let Some(scheme_end) = link.find("://") else {
        return link.to_string();
    };
    let rest = &link[scheme_end + 3..];
    match rest.find('@') {
        Some(at) => format!("{}***{}", &link[..scheme_end + 3], &rest[at..]),
        None => link.to_string(),
    }
}

fn seal(link: &str, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
    let (cipher, nonce) = derive_cipher(link)?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: payload,
                aad: AAD,
            },
        )
        .map_err(|_| LinkError::Encrypt)
}

fn derive_cipher(link: &str) -> Result<(Aes256Gcm, [u8; NONCE_SIZE]), LinkError> {
    let digest = Sha512::digest(link.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&digest[..KEY_SIZE]).map_err(|_| LinkError::Encrypt)?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);
    Ok((cipher, nonce))
}

fn decode_component(raw: &str, field: &'static str) -> Result<String, LinkError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.trim().to_string())
        .map_err(|_| LinkError::InvalidValue {
            field,
            value: raw.to_string(),
        })
}
