//! Short, independent, timeout-bounded network measurements.
//!
//! Probes never touch session state. Callers receive plain values and decide
//! whether the result is still relevant.

pub mod geo;
pub mod socks5;

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::link::ServerProfile;

pub use geo::{flag_emoji, geo_probe_via_socks5, lookup_host, GeoInfo};
pub use socks5::http_probe_via_socks5;

pub const TCP_TIMEOUT: Duration = Duration::from_secs(2);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(3);
pub const GEO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp,
    HttpViaProxy,
    Geo,
}

/// One probe outcome. `latency_ms == None` means timeout or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub kind: ProbeKind,
    pub target_index: Option<usize>,
    pub latency_ms: Option<u32>,
    pub geo: Option<GeoInfo>,
}

pub(crate) fn millis(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX)
}

/// Time to establish a TCP connection to `host:port`.
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> Option<u32> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let elapsed = start.elapsed();
            drop(stream);
            Some(millis(elapsed))
        }
        Ok(Err(e)) => {
            log::debug!("tcp probe {host}:{port} failed: {e}");
            None
        }
        Err(_) => None,
    }
}

/// Probes every profile concurrently. Results arrive in completion order;
/// the receiver closes once all probes have finished.
pub fn ping_all(
    profiles: &[ServerProfile],
    timeout: Duration,
) -> mpsc::UnboundedReceiver<ProbeResult> {
    let (tx, rx) = mpsc::unbounded_channel();
    for (index, profile) in profiles.iter().enumerate() {
        let tx = tx.clone();
        let host = profile.host().to_string();
        let port = profile.port();
        tokio::spawn(async move {
            let latency_ms = tcp_probe(&host, port, timeout).await;
            let _ = tx.send(ProbeResult {
                kind: ProbeKind::Tcp,
                target_index: Some(index),
                latency_ms,
                geo: None,
            });
        });
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use tokio::net::TcpListener;

    fn profile_for(host: &str, port: u16) -> ServerProfile {
        let payload = URL_SAFE.encode(format!("aes-256-gcm:pw@{host}:{port}"));
        link::decode(&format!("ss://{payload}#probe-{port}")).unwrap()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_tcp_probe_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        assert!(tcp_probe("127.0.0.1", open, TCP_TIMEOUT).await.is_some());

        let closed = closed_port().await;
        assert_eq!(tcp_probe("127.0.0.1", closed, TCP_TIMEOUT).await, None);
    }

    #[tokio::test]
    async fn test_ping_all_reports_every_index() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;
        let profiles = vec![profile_for("127.0.0.1", open), profile_for("127.0.0.1", closed)];

        let mut rx = ping_all(&profiles, TCP_TIMEOUT);
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.target_index);

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.kind == ProbeKind::Tcp));
        assert!(results[0].latency_ms.is_some());
        assert_eq!(results[1].latency_ms, None);
    }
}
