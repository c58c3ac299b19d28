//! Public IP and country lookups against ip-api.com.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const GEO_HOST: &str = "ip-api.com";
const TUNNEL_URL: &str = "http://ip-api.com/json/?fields=status,countryCode,query";
const DIRECT_TIMEOUT: Duration = Duration::from_secs(3);
const UNKNOWN_FLAG: &str = "🌐";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoInfo {
    pub ip: String,
    pub country_code: String,
    pub city: Option<String>,
    pub flag: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    status: String,
    country_code: Option<String>,
    query: Option<String>,
    city: Option<String>,
}

/// Maps an ISO 3166 alpha-2 code onto regional indicator symbols.
pub fn flag_emoji(country_code: &str) -> String {
    let code = country_code.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return UNKNOWN_FLAG.to_string();
    }
    code.chars()
        .filter_map(|c| char::from_u32(c.to_ascii_uppercase() as u32 + 127397))
        .collect()
}

fn parse_body(body: &str, ip_fallback: Option<&str>) -> Option<GeoInfo> {
    let response: GeoResponse = serde_json::from_str(body.trim()).ok()?;
    if response.status != "success" {
        return None;
    }
    let country_code = response.country_code.unwrap_or_default();
    let ip = response.query.or_else(|| ip_fallback.map(str::to_string))?;
    Some(GeoInfo {
        flag: flag_emoji(&country_code),
        ip,
        country_code,
        city: response.city,
    })
}

async fn fetch_via_tunnel(local_port: u16, timeout: Duration) -> reqwest::Result<Option<GeoInfo>> {
    // socks5h lets the proxy resolve the geo host.
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{local_port}"))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()?;
    let response = client.get(TUNNEL_URL).send().await?;
    if !response.status().is_success() {
        log::debug!("{GEO_HOST} answered {} through the tunnel", response.status());
        return Ok(None);
    }
    let body = response.text().await?;
    Ok(parse_body(&body, None))
}

/// Public IP and flag as seen through the proxy on `local_port`.
pub async fn geo_probe_via_socks5(local_port: u16, timeout: Duration) -> Option<GeoInfo> {
    match fetch_via_tunnel(local_port, timeout).await {
        Ok(info) => info,
        Err(e) => {
            log::debug!("geo probe via :{local_port} failed: {e}");
            None
        }
    }
}

async fn resolve(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .ok()?
        .map(|addr| addr.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Country and city of a server host, queried directly (no tunnel).
pub async fn lookup_host(host: &str) -> Option<GeoInfo> {
    let ip = resolve(host).await?;
    let url = format!("http://{GEO_HOST}/json/{ip}?fields=status,countryCode,city");
    let client = reqwest::Client::builder()
        .timeout(DIRECT_TIMEOUT)
        .build()
        .ok()?;
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            log::debug!("geo lookup for {host} failed: {e}");
            return None;
        }
    };
    if !response.status().is_success() {
        log::warn!("{GEO_HOST} returned status {}", response.status());
        return None;
    }
    let body = response.text().await.ok()?;
    parse_body(&body, Some(&ip.to_string()))
}
