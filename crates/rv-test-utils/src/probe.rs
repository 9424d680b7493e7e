//! Scripted network probe

use async_trait::async_trait;
use parking_lot::Mutex;
use rv_core::{NetworkProbe, ProbeError};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

/// Probe call as recorded by [`FakeProbe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCall {
    Ping(IpAddr),
    Tcp(IpAddr, u16),
    Resolve(String),
    Http(String),
}

/// Network probe where everything answers unless told otherwise
#[derive(Debug, Default)]
pub struct FakeProbe {
    ping_failing: bool,
    closed_ports: HashSet<u16>,
    http_status: HashMap<String, u16>,
    dns: HashMap<String, Vec<IpAddr>>,
    calls: Mutex<Vec<ProbeCall>>,
}

impl FakeProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ping_failing(mut self) -> Self {
        self.ping_failing = true;
        self
    }

    #[must_use]
    pub fn with_closed_port(mut self, port: u16) -> Self {
        self.closed_ports.insert(port);
        self
    }

    /// Status returned for `url` after address substitution
    #[must_use]
    pub fn with_http_status(mut self, url: &str, status: u16) -> Self {
        self.http_status.insert(url.to_string(), status);
        self
    }

    /// Addresses returned for `name`; unknown names fail to resolve
    #[must_use]
    pub fn with_dns(mut self, name: &str, addrs: Vec<IpAddr>) -> Self {
        self.dns.insert(name.to_string(), addrs);
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ProbeCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NetworkProbe for FakeProbe {
    async fn ping(&self, addr: IpAddr, _timeout: Duration) -> Result<Duration, ProbeError> {
        self.calls.lock().push(ProbeCall::Ping(addr));
        if self.ping_failing {
            return Err(ProbeError::new(format!("no reply from {addr}")));
        }
        Ok(Duration::from_millis(1))
    }

    async fn tcp_connect(
        &self,
        addr: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        self.calls.lock().push(ProbeCall::Tcp(addr, port));
        if self.closed_ports.contains(&port) {
            tokio::time::sleep(timeout).await;
            return Err(ProbeError::new(format!("{addr}:{port} timed out after {timeout:?}")));
        }
        Ok(Duration::from_millis(2))
    }

    async fn resolve(&self, name: &str, _timeout: Duration) -> Result<Vec<IpAddr>, ProbeError> {
        self.calls.lock().push(ProbeCall::Resolve(name.to_string()));
        self.dns
            .get(name)
            .cloned()
            .ok_or_else(|| ProbeError::new(format!("{name}: no such host")))
    }

    async fn http_get(&self, url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
        self.calls.lock().push(ProbeCall::Http(url.to_string()));
        Ok(self.http_status.get(url).copied().unwrap_or(200))
    }
}
