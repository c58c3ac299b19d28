//! Remote subscription lists: a body of `ss://` links plus an optional
//! `Subscription-Userinfo` quota header.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::link::{decode_base64_to_string, SCHEME};

pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const USERINFO_HEADER: &str = "subscription-userinfo";

/// Usage quota reported by the provider. Replaced wholesale on every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuota {
    #[serde(rename = "used")]
    pub used_bytes: u64,
    #[serde(rename = "total")]
    pub total_bytes: u64,
    #[serde(rename = "expire")]
    pub expire_epoch_seconds: u64,
}

impl SubscriptionQuota {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub links: Vec<String>,
    pub quota: Option<SubscriptionQuota>,
}

impl FetchResult {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Parses `upload=..; download=..; total=..; expire=..`. Fullwidth `；` separators
/// are accepted; unknown keys are ignored.
pub fn parse_userinfo(header: &str) -> Option<SubscriptionQuota> {
    let mut seen = false;
    let mut upload = 0u64;
    let mut download = 0u64;
    let mut total = 0u64;
    let mut expire = 0u64;

    for item in header.split([';', '；']) {
        let item: String = item.chars().filter(|c| !c.is_whitespace()).collect();
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            log::debug!("ignoring quota field {key}={value}");
            continue;
        };
        seen = true;
        match key.to_ascii_lowercase().as_str() {
            "upload" => upload = value,
            "download" => download = value,
            "total" => total = value,
            "expire" => expire = value,
            _ => {}
        }
    }

    seen.then(|| SubscriptionQuota {
        used_bytes: upload.saturating_add(download),
        total_bytes: total,
        expire_epoch_seconds: expire,
    })
}

/// Base64 body first, plain text otherwise; keeps only `ss://` lines.
pub fn extract_links(body: &str) -> Vec<String> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let text = match decode_base64_to_string(&compact) {
        Ok(decoded) => decoded,
        Err(_) => body.to_string(),
    };
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with(SCHEME))
        .map(str::to_string)
        .collect()
}

async fn try_fetch(url: &Url, timeout: Duration) -> reqwest::Result<FetchResult> {
    // Subscriptions are fetched directly, never through a system proxy.
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .no_proxy()
        .build()?;

    let response = client.get(url.clone()).send().await?.error_for_status()?;
    let quota = response
        .headers()
        .get(USERINFO_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_userinfo);
    let body = response.text().await?;

    Ok(FetchResult {
        links: extract_links(&body),
        quota,
    })
}

/// One bounded GET. Every failure collapses to an empty result.
pub async fn fetch(url: &str) -> FetchResult {
    fetch_with_timeout(url, FETCH_TIMEOUT).await
}

pub async fn fetch_with_timeout(url: &str, timeout: Duration) -> FetchResult {
    let parsed = match Url::parse(url.trim()) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
        Ok(parsed) => {
            log::warn!("subscription scheme {} not supported", parsed.scheme());
            return FetchResult::default();
        }
        Err(e) => {
            log::warn!("invalid subscription url: {e}");
            return FetchResult::default();
        }
    };

    match try_fetch(&parsed, timeout).await {
        Ok(result) => {
            log::info!(
                "subscription {} returned {} links",
                parsed.host_str().unwrap_or_default(),
                result.links.len()
            );
            result
        }
        Err(e) => {
            log::warn!("subscription fetch failed: {e}");
            FetchResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(headers: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/sub")
    }

    #[test]
    fn test_userinfo_header() {
        let quota = parse_userinfo("upload=1000;download=2000;total=100000;expire=1700000000").unwrap();
        assert_eq!(
            quota,
            SubscriptionQuota {
                used_bytes: 3000,
                total_bytes: 100000,
                expire_epoch_seconds: 1700000000,
            }
        );

        let spaced = parse_userinfo("upload=1; download=2； total=10").unwrap();
        assert_eq!(spaced.used_bytes, 3);
        assert_eq!(spaced.total_bytes, 10);
        assert_eq!(spaced.expire_epoch_seconds, 0);

        assert_eq!(parse_userinfo("garbage"), None);
    }

    #[test]
    fn test_extract_links_base64_and_plain() {
        let plain = "ss://AAAA#one\nvmess://xyz\n  ss://BBBB#two  \n";
        assert_eq!(extract_links(plain), vec!["ss://AAAA#one", "ss://BBBB#two"]);

        let encoded = STANDARD.encode(plain);
        assert_eq!(extract_links(&encoded), vec!["ss://AAAA#one", "ss://BBBB#two"]);

        assert!(extract_links("").is_empty());
    }

    #[test]
    fn test_used_percent() {
        let quota = SubscriptionQuota {
            used_bytes: 25,
            total_bytes: 100,
            expire_epoch_seconds: 0,
        };
        assert_eq!(quota.used_percent(), 25.0);
        assert_eq!(SubscriptionQuota { total_bytes: 0, ..quota }.used_percent(), 0.0);
    }

    #[tokio::test]
    async fn test_fetch_reads_quota_header() {
        let body = STANDARD.encode("ss://YWVzLTI1Ni1nY206cGFzc3dvcmRAMS4yLjMuNDo4ODg4#A\n");
        let url = serve_once(
            "Subscription-Userinfo: upload=1000;download=2000;total=100000;expire=1700000000\r\n",
            body,
        )
        .await;

        let result = fetch(&url).await;
        assert_eq!(result.links.len(), 1);
        assert_eq!(
            result.quota,
            Some(SubscriptionQuota {
                used_bytes: 3000,
                total_bytes: 100000,
                expire_epoch_seconds: 1700000000,
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_failures_are_empty() {
        assert_eq!(fetch("not a url").await, FetchResult::default());
        assert_eq!(fetch("ftp://example.com/sub").await, FetchResult::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = fetch_with_timeout(&format!("http://{addr}/"), Duration::from_secs(1)).await;
        assert!(result.is_empty());
        assert_eq!(result.quota, None);
    }
}
