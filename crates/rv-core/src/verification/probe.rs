//! Network probes against recovered instances
//!
//! [`NetworkProbe`] is the seam between the verification battery and the
//! host's network stack; [`SystemProbe`] is the real thing. User-supplied
//! checks implement [`CustomProbe`].

use async_trait::async_trait;
use rv_api::Workload;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// A probe did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    /// Create from any message
    #[inline]
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Low-level reachability checks
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// ICMP echo; returns the round trip
    async fn ping(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError>;

    /// TCP connect; returns the connect time
    async fn tcp_connect(
        &self,
        addr: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<Duration, ProbeError>;

    /// Resolve a host name
    async fn resolve(&self, name: &str, timeout: Duration) -> Result<Vec<IpAddr>, ProbeError>;

    /// HTTP GET without following redirects; returns the status code
    async fn http_get(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError>;
}

/// Application-level check supplied by the operator
#[async_trait]
pub trait CustomProbe: Send + Sync {
    /// Name used in results
    fn name(&self) -> &str;

    /// Run the check; `Ok` carries a detail line, any error fails the test
    async fn check(&self, workload: &Workload, address: IpAddr) -> anyhow::Result<String>;
}

/// Probes backed by the host network stack
#[derive(Debug, Clone)]
pub struct SystemProbe {
    http: reqwest::Client,
}

impl SystemProbe {
    /// Create a probe
    ///
    /// Recovered instances present whatever certificate they were backed up
    /// with, so TLS verification is off for URL checks.
    ///
    /// # Errors
    /// `ProbeError` when the HTTP client cannot be built
    pub fn new() -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::new(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn ping(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
        let secs = timeout.as_secs().max(1).to_string();
        let mut cmd = tokio::process::Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", &timeout.as_millis().to_string()]);
        } else {
            cmd.args(["-c", "1", "-W", &secs]);
        }
        cmd.arg(addr.to_string()).kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(timeout + Duration::from_secs(1), cmd.output())
            .await
            .map_err(|_| ProbeError::new(format!("no reply within {timeout:?}")))?
            .map_err(|e| ProbeError::new(format!("cannot run ping: {e}")))?;
        if output.status.success() {
            Ok(started.elapsed())
        } else {
            Err(ProbeError::new(format!("no reply from {addr}")))
        }
    }

    async fn tcp_connect(
        &self,
        addr: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(SocketAddr::new(addr, port))).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ProbeError::new(e.to_string())),
            Err(_) => Err(ProbeError::new(format!("connect timed out after {timeout:?}"))),
        }
    }

    async fn resolve(&self, name: &str, timeout: Duration) -> Result<Vec<IpAddr>, ProbeError> {
        let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((name, 0)))
            .await
            .map_err(|_| ProbeError::new(format!("lookup timed out after {timeout:?}")))?
            .map_err(|e| ProbeError::new(e.to_string()))?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.dedup();
        if ips.is_empty() {
            return Err(ProbeError::new(format!("{name} resolved to no addresses")));
        }
        Ok(ips)
    }

    async fn http_get(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProbeError::new(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Replace placeholder hosts in a URL with the instance address
///
/// `{ip}` and `{address}` anywhere, and a `localhost` host, become `addr`
/// (bracketed for IPv6).
#[must_use]
pub fn substitute_address(url: &str, addr: IpAddr) -> String {
    let host = match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    let url = url.replace("{ip}", &host).replace("{address}", &host);

    for scheme in ["http://", "https://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            let host_end = rest.find([':', '/', '?', '#']).unwrap_or(rest.len());
            if rest[..host_end].eq_ignore_ascii_case("localhost") {
                return format!("{scheme}{host}{}", &rest[host_end..]);
            }
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn placeholders_are_substituted() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 20));
        assert_eq!(substitute_address("https://{ip}:8443/health", ip), "https://10.9.9.20:8443/health");
        assert_eq!(substitute_address("http://{address}/", ip), "http://10.9.9.20/");
        assert_eq!(substitute_address("http://LOCALHOST/status", ip), "http://10.9.9.20/status");
        assert_eq!(substitute_address("http://localhost", ip), "http://10.9.9.20");
        assert_eq!(substitute_address("http://app.lab/", ip), "http://app.lab/");
    }

    #[test]
    fn ipv6_is_bracketed() {
        let ip: IpAddr = "fd00::5".parse().unwrap();
        assert_eq!(substitute_address("http://{ip}:80/", ip), "http://[fd00::5]:80/");
    }

    #[tokio::test]
    async fn tcp_connect_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = SystemProbe::new().unwrap();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(probe.tcp_connect(ip, port, Duration::from_secs(2)).await.is_ok());
        drop(listener);
    }
}
