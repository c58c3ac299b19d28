//! Minimal SOCKS5 client (no auth, CONNECT only) used to probe through the
//! local proxy tunnel.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn protocol_error(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("socks5: {detail}"))
}

fn connect_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| protocol_error("hostname too long"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Connects to the proxy on `127.0.0.1:local_port` and asks it to CONNECT
/// to `host:port`. Returns the stream ready for application data.
pub(crate) async fn connect(local_port: u16, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await?;
    stream.set_nodelay(true)?;

    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [VERSION, NO_AUTH] {
        return Err(protocol_error("no acceptable auth method"));
    }

    stream.write_all(&connect_request(host, port)?).await?;
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol_error("bad reply version"));
    }
    if head[1] != 0x00 {
        return Err(protocol_error(&format!("connect rejected ({})", head[1])));
    }

    // Bound address is unused; drain it.
    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(protocol_error("bad address type")),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(stream)
}

async fn time_first_byte(target_host: &str, local_port: u16) -> io::Result<Duration> {
    let start = Instant::now();
    let mut stream = connect(local_port, target_host, 80).await?;
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {target_host}\r\nUser-Agent: curl/8\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty response"));
    }
    Ok(start.elapsed())
}

/// Latency of an HTTP request to `target_host:80` tunnelled through the local
/// proxy, measured from connect until the first response byte.
pub async fn http_probe_via_socks5(
    target_host: &str,
    local_port: u16,
    timeout: Duration,
) -> Option<u32> {
    match tokio::time::timeout(timeout, time_first_byte(target_host, local_port)).await {
        Ok(Ok(elapsed)) => Some(super::millis(elapsed)),
        Ok(Err(e)) => {
            log::debug!("http probe via :{local_port} failed: {e}");
            None
        }
        Err(_) => {
            log::debug!("http probe via :{local_port} timed out");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one SOCKS5 client, grants CONNECT, then answers the first
    /// request with `response`.
    pub(crate) async fn fake_proxy(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[VERSION, NO_AUTH]).await.unwrap();

            let mut head = [0u8; 4];
            socket.read_exact(&mut head).await.unwrap();
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            socket
                .write_all(&[VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut request = vec![0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket.write_all(response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        port
    }

    #[test]
    fn test_connect_request_encoding() {
        assert_eq!(
            connect_request("google.com", 80).unwrap(),
            [&[5, 1, 0, 3, 10][..], b"google.com", &[0, 80]].concat()
        );
        assert_eq!(
            connect_request("1.2.3.4", 443).unwrap(),
            vec![5, 1, 0, 1, 1, 2, 3, 4, 1, 187]
        );
        assert_eq!(connect_request("::1", 80).unwrap()[3], ATYP_IPV6);
        assert!(connect_request(&"a".repeat(300), 80).is_err());
    }

    #[tokio::test]
    async fn test_http_probe_through_proxy() {
        let port = fake_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let latency = http_probe_via_socks5("google.com", port, Duration::from_secs(3)).await;
        assert!(latency.is_some());
    }

    #[tokio::test]
    async fn test_latency_request_is_get() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sent, received) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[VERSION, NO_AUTH]).await.unwrap();
            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            socket
                .write_all(&[VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let mut request = vec![0u8; 1024];
            let n = socket.read(&mut request).await.unwrap();
            socket.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            let _ = sent.send(String::from_utf8_lossy(&request[..n]).to_string());
        });

        assert!(http_probe_via_socks5("google.com", port, Duration::from_secs(3)).await.is_some());
        let request = received.await.unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: google.com\r\n"));
    }

    #[tokio::test]
    async fn test_http_probe_without_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert_eq!(
            http_probe_via_socks5("google.com", port, Duration::from_secs(1)).await,
            None
        );
    }

    #[tokio::test]
    async fn test_http_probe_rejected_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[VERSION, 0xff]).await.unwrap();
        });
        assert_eq!(
            http_probe_via_socks5("google.com", port, Duration::from_secs(1)).await,
            None
        );
    }
}
