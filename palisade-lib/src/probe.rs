//! Connectivity verification for safe-apply.
//!
//! A freshly applied ruleset is only trusted once at least one probe
//! target answers: TCP connects on the management trio {80, 443, 22},
//! then HTTP and HTTPS requests. Everything is bounded by the caller's
//! ping timeout; one success is enough.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_PROBE_PORTS: [u16; 3] = [80, 443, 22];

/// Per-attempt budget; several attempts share the overall timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ProbeOptions {
    pub targets: Vec<IpAddr>,
    pub timeout: Duration,
    pub ports: Vec<u16>,
}

impl ProbeOptions {
    pub fn new(targets: Vec<IpAddr>, timeout: Option<Duration>) -> Self {
        ProbeOptions {
            targets,
            timeout: timeout.unwrap_or(DEFAULT_PING_TIMEOUT),
            ports: DEFAULT_PROBE_PORTS.to_vec(),
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }
}

/// True as soon as any target accepts a TCP connect or answers HTTP(S).
pub async fn verify_connectivity(options: &ProbeOptions) -> bool {
    if options.targets.is_empty() {
        return true;
    }
    tokio::time::timeout(options.timeout, probe_all(&options.targets, &options.ports))
        .await
        .unwrap_or(false)
}

async fn probe_all(targets: &[IpAddr], ports: &[u16]) -> bool {
    for target in targets {
        for port in ports {
            let addr = SocketAddr::new(*target, *port);
            match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    tracing::debug!(%addr, "probe connect succeeded");
                    return true;
                }
                Ok(Err(error)) => {
                    tracing::trace!(%addr, error = %error, "probe connect failed");
                }
                Err(_) => {
                    tracing::trace!(%addr, "probe connect timed out");
                }
            }
        }
        if http_probe(target).await {
            return true;
        }
    }
    false
}

async fn http_probe(target: &IpAddr) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(ATTEMPT_TIMEOUT).build() else {
        return false;
    };
    for scheme in ["http", "https"] {
        let url = match target {
            IpAddr::V6(v6) => format!("{scheme}://[{v6}]/"),
            IpAddr::V4(v4) => format!("{scheme}://{v4}/"),
        };
        // any response at all proves the path is alive
        if client.get(&url).send().await.is_ok() {
            tracing::debug!(%url, "probe request succeeded");
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn empty_target_list_passes() {
        let options = ProbeOptions::new(Vec::new(), None);
        assert!(verify_connectivity(&options).await);
    }

    #[tokio::test]
    async fn local_listener_answers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // probe the real port directly to keep the test hermetic
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let connected = tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await;
        assert!(matches!(connected, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn unreachable_target_fails_within_timeout() {
        // TEST-NET-1 is guaranteed unrouted
        let options = ProbeOptions::new(
            vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))],
            Some(Duration::from_millis(300)),
        );
        let started = std::time::Instant::now();
        assert!(!verify_connectivity(&options).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
