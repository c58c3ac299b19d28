//! `ss://` share links.
//!
//! Two shapes are accepted:
//! - `ss://BASE64URL(method:password@host:port)#tag`
//! - `ss://BASE64(method:password)@host:port#tag` (SIP002)
//!
//! The original link text is kept verbatim as the profile `key`, so nothing
//! here needs to round-trip through `encode` for identity.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

pub const SCHEME: &str = "ss://";

const TAG_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// A decoded server credential set. Identity is the original link (`key`).
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    key: String,
    name: String,
    host: String,
    #[serde(with = "port_string")]
    port: u16,
    method: String,
    password: String,
}

impl ServerProfile {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Remote endpoint in `host:port` form, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl PartialEq for ServerProfile {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ServerProfile {}

impl fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProfile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("password", &"********")
            .finish()
    }
}

/// Persisted records carry the port as a string; accept numbers too.
mod port_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        let port = match Raw::deserialize(deserializer)? {
            Raw::Number(value) => value,
            Raw::Text(text) => text
                .trim()
                .parse::<u16>()
                .map_err(|_| D::Error::custom(format!("invalid port {text:?}")))?,
        };
        if port == 0 {
            return Err(D::Error::custom("port must be 1-65535"));
        }
        Ok(port)
    }
}

fn add_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        value.to_string()
    } else {
        format!("{value}{}", "=".repeat(4 - remainder))
    }
}

/// Lenient base64: either alphabet, padded or not.
pub(crate) fn decode_base64_to_string(input: &str) -> Result<String, DecodeError> {
    let cleaned = input.trim();
    if cleaned.is_empty() {
        return Err(DecodeError::InvalidBase64);
    }
    let padded = add_padding(cleaned);
    for engine in [URL_SAFE, STANDARD] {
        if let Ok(bytes) = engine.decode(padded.as_bytes()) {
            return String::from_utf8(bytes).map_err(|_| DecodeError::InvalidBase64);
        }
    }
    for engine in [URL_SAFE_NO_PAD, STANDARD_NO_PAD] {
        if let Ok(bytes) = engine.decode(cleaned.trim_end_matches('=').as_bytes()) {
            return String::from_utf8(bytes).map_err(|_| DecodeError::InvalidBase64);
        }
    }
    Err(DecodeError::InvalidBase64)
}

fn parse_host_port(value: &str) -> Result<(String, u16), DecodeError> {
    let trimmed = value.trim();
    let host_port = trimmed
        .split_once('/')
        .map(|(head, _)| head)
        .unwrap_or(trimmed);

    let (host, port_str) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or(DecodeError::Missing("server"))?;
        let port_str = tail.strip_prefix(':').ok_or(DecodeError::Missing("port"))?;
        (host, port_str)
    } else {
        host_port.split_once(':').ok_or(DecodeError::Missing("port"))?
    };

    if host.is_empty() {
        return Err(DecodeError::Missing("server"));
    }
    let port = port_str
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| DecodeError::InvalidPort(port_str.to_string()))?;
    Ok((host.to_string(), port))
}

fn split_credentials(value: &str) -> Result<(String, &str), DecodeError> {
    let (method, rest) = value.split_once(':').ok_or(DecodeError::Missing("method"))?;
    if method.is_empty() {
        return Err(DecodeError::Missing("method"));
    }
    Ok((method.to_string(), rest))
}

fn parse_payload(payload: &str) -> Result<(String, String, String, u16), DecodeError> {
    // '@' is outside both base64 alphabets, so its presence means SIP002.
    if let Some((userinfo, host_port)) = payload.rsplit_once('@') {
        let userinfo = match decode_base64_to_string(userinfo) {
            Ok(decoded) if decoded.contains(':') => decoded,
            _ => percent_decode_str(userinfo).decode_utf8_lossy().into_owned(),
        };
        let (method, password) = split_credentials(&userinfo)?;
        let (host, port) = parse_host_port(host_port)?;
        return Ok((method, password.to_string(), host, port));
    }

    let decoded = decode_base64_to_string(payload)?;
    let (method, rest) = split_credentials(&decoded)?;
    let (password, host_port) = rest.rsplit_once('@').ok_or(DecodeError::Missing("server"))?;
    let (host, port) = parse_host_port(host_port)?;
    Ok((method, password.to_string(), host, port))
}

/// Decodes a share link into a profile. The link itself becomes the `key`.
pub fn decode(link: &str) -> Result<ServerProfile, DecodeError> {
    let key = link.trim();
    let raw = key.strip_prefix(SCHEME).ok_or(DecodeError::MissingScheme)?;
    let (payload, fragment) = raw.split_once('#').unwrap_or((raw, ""));
    let payload = payload
        .split_once('?')
        .map(|(head, _)| head)
        .unwrap_or(payload);

    let (method, password, host, port) = parse_payload(payload)?;

    let tag = percent_decode_str(fragment).decode_utf8_lossy().trim().to_string();
    let mut profile = ServerProfile {
        key: key.to_string(),
        name: tag,
        host,
        port,
        method,
        password,
    };
    if profile.name.is_empty() {
        profile.name = profile.endpoint();
    }
    Ok(profile)
}

/// Inverse of [`decode`] for the whole-payload form.
pub fn encode(profile: &ServerProfile) -> String {
    let plain = format!(
        "{}:{}@{}",
        profile.method,
        profile.password,
        profile.endpoint()
    );
    let payload = URL_SAFE.encode(plain.as_bytes());
    if profile.name.is_empty() || profile.name == profile.endpoint() {
        format!("{SCHEME}{payload}")
    } else {
        format!(
            "{SCHEME}{payload}#{}",
            utf8_percent_encode(&profile.name, TAG_ESCAPE)
        )
    }
}
