//! Verification battery
//!
//! Runs against a `Running` instance in a fixed order:
//! 1. heartbeat (always)
//! 2. address assignment; on timeout the battery stops here
//! 3. ping, 4. TCP ports, 5. DNS, 6. HTTP URLs, 7. custom probe
//!
//! Failures never raise; every outcome becomes a [`VerificationResult`].

pub mod probe;

use crate::config::TestConfig;
use crate::context::RunContext;
use crate::error::PollError;
use crate::poll::poll_until;
use crate::session::RecoverySession;
use crate::types::{TestCategory, VerificationResult};
use futures::FutureExt;
use probe::{substitute_address, CustomProbe, NetworkProbe};
use rv_api::{ApiError, HeartbeatState, HypervisorApi, Instance, PowerState, Workload};
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;

/// Name of the address-assignment result
pub const ADDRESS_TEST: &str = "IP Address Assignment";

/// Runs the battery for one session
pub struct VerificationRunner<'a> {
    hypervisor: &'a dyn HypervisorApi,
    probe: &'a dyn NetworkProbe,
    custom: Option<&'a dyn CustomProbe>,
    tests: &'a TestConfig,
    poll_interval: Duration,
    ctx: &'a RunContext,
}

impl<'a> VerificationRunner<'a> {
    /// Create a runner
    #[must_use]
    pub fn new(
        hypervisor: &'a dyn HypervisorApi,
        probe: &'a dyn NetworkProbe,
        custom: Option<&'a dyn CustomProbe>,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            hypervisor,
            probe,
            custom,
            tests: &ctx.config.tests,
            poll_interval: ctx.config.timeouts.poll_interval(),
            ctx,
        }
    }

    /// Run the battery, appending to `results` as each test completes
    ///
    /// Results gathered so far stay in `results` if the caller abandons the
    /// future part way through.
    pub async fn verify(
        &self,
        session: &RecoverySession,
        instance: &Instance,
        results: &mut Vec<VerificationResult>,
    ) {
        let workload = &session.restore_point.workload;
        let first = results.len();

        results.push(self.heartbeat(workload, instance).await);

        let addr = match self.wait_for_address(workload, instance).await {
            Ok((addr, result)) => {
                results.push(result);
                addr
            }
            Err(result) => {
                results.push(result);
                self.journal(session, &results[first..]);
                return;
            }
        };

        let timeout = self.tests.probe_timeout();
        if self.tests.ping {
            let started = Instant::now();
            let outcome = self.probe.ping(addr, timeout).await;
            results.push(match outcome {
                Ok(rtt) => pass(
                    workload,
                    TestCategory::Ping,
                    "Ping",
                    format!("reply from {addr} in {rtt:?}"),
                    started,
                ),
                Err(e) => fail(workload, TestCategory::Ping, "Ping", e.to_string(), started),
            });
        }

        for &port in &self.tests.ports {
            let started = Instant::now();
            let name = format!("TCP Port {port}");
            results.push(match self.probe.tcp_connect(addr, port, timeout).await {
                Ok(_) => pass(
                    workload,
                    TestCategory::Port,
                    name,
                    format!("{addr}:{port} accepted"),
                    started,
                ),
                Err(e) => fail(workload, TestCategory::Port, name, e.to_string(), started),
            });
        }

        if self.tests.dns {
            results.push(self.dns(workload, addr, timeout).await);
        }

        for url in &self.tests.urls {
            let target = substitute_address(url, addr);
            let started = Instant::now();
            let name = format!("HTTP {url}");
            results.push(match self.probe.http_get(&target, timeout).await {
                Ok(status) => {
                    let detail = format!("{target} answered {status}");
                    if (200..400).contains(&status) {
                        pass(workload, TestCategory::Http, name, detail, started)
                    } else {
                        fail(workload, TestCategory::Http, name, detail, started)
                    }
                }
                Err(e) => fail(workload, TestCategory::Http, name, format!("{target}: {e}"), started),
            });
        }

        if let Some(custom) = self.custom {
            results.push(self.custom_check(custom, workload, addr).await);
        }

        self.journal(session, &results[first..]);
    }

    async fn heartbeat(&self, workload: &Workload, instance: &Instance) -> VerificationResult {
        const NAME: &str = "Power and Heartbeat";
        let started = Instant::now();
        if is_alive(instance) {
            return pass(workload, TestCategory::Heartbeat, NAME, "powered on, heartbeat present", started);
        }

        let id = instance.id.as_str();
        let hypervisor = self.hypervisor;
        let outcome = poll_until(
            &format!("heartbeat of {}", instance.name),
            self.tests.boot_timeout(),
            self.poll_interval,
            || async move {
                let current = hypervisor.get_instance(id).await?;
                Ok::<_, ApiError>(current.filter(is_alive))
            },
        )
        .await;
        match outcome {
            Ok(_) => pass(workload, TestCategory::Heartbeat, NAME, "powered on, heartbeat present", started),
            Err(e) => fail(workload, TestCategory::Heartbeat, NAME, e.to_string(), started),
        }
    }

    async fn wait_for_address(
        &self,
        workload: &Workload,
        instance: &Instance,
    ) -> Result<(IpAddr, VerificationResult), VerificationResult> {
        let started = Instant::now();
        let addr = if let Some(addr) = instance.primary_address() {
            Ok(addr)
        } else {
            let id = instance.id.as_str();
            let hypervisor = self.hypervisor;
            poll_until(
                &format!("address of {}", instance.name),
                self.tests.address_timeout(),
                self.poll_interval,
                || async move {
                    let current = hypervisor.get_instance(id).await?;
                    Ok::<_, ApiError>(current.and_then(|i| i.primary_address()))
                },
            )
            .await
        };

        match addr {
            Ok(addr) => Ok((
                addr,
                pass(workload, TestCategory::Network, ADDRESS_TEST, format!("address {addr}"), started),
            )),
            Err(e) => {
                let detail = match e {
                    PollError::TimedOut { waited, .. } => {
                        format!("no address within {waited:?}; remaining tests skipped")
                    }
                    PollError::Api(api) => format!("{api}; remaining tests skipped"),
                };
                tracing::warn!("{}: {}", workload.name, detail);
                Err(fail(workload, TestCategory::Network, ADDRESS_TEST, detail, started))
            }
        }
    }

    async fn dns(&self, workload: &Workload, addr: IpAddr, timeout: Duration) -> VerificationResult {
        const NAME: &str = "DNS Resolution";
        let started = Instant::now();
        match self.probe.resolve(&workload.name, timeout).await {
            Ok(ips) => {
                let listed = ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                let detail = if ips.contains(&addr) {
                    format!("{} resolves to {listed}", workload.name)
                } else {
                    format!("{} resolves to {listed} (instance has {addr})", workload.name)
                };
                pass(workload, TestCategory::Dns, NAME, detail, started)
            }
            Err(e) => fail(workload, TestCategory::Dns, NAME, e.to_string(), started),
        }
    }

    async fn custom_check(
        &self,
        custom: &dyn CustomProbe,
        workload: &Workload,
        addr: IpAddr,
    ) -> VerificationResult {
        let started = Instant::now();
        let name = custom.name().to_string();
        let guarded = AssertUnwindSafe(custom.check(workload, addr)).catch_unwind();
        match tokio::time::timeout(self.tests.probe_timeout(), guarded).await {
            Ok(Ok(Ok(detail))) => pass(workload, TestCategory::Custom, name, detail, started),
            Ok(Ok(Err(e))) => fail(workload, TestCategory::Custom, name, format!("{e:#}"), started),
            Ok(Err(panic)) => fail(
                workload,
                TestCategory::Custom,
                name,
                format!("probe panicked: {}", panic_message(panic.as_ref())),
                started,
            ),
            Err(_) => fail(
                workload,
                TestCategory::Custom,
                name,
                format!("probe timed out after {:?}", self.tests.probe_timeout()),
                started,
            ),
        }
    }

    fn journal(&self, session: &RecoverySession, results: &[VerificationResult]) {
        for r in results {
            self.ctx.record_for(
                session.workload_name(),
                if r.passed { "verify.passed" } else { "verify.failed" },
                format!("{}: {}", r.name, r.detail),
            );
        }
    }
}

fn is_alive(instance: &Instance) -> bool {
    instance.power == PowerState::On && instance.heartbeat != HeartbeatState::Absent
}

fn pass(
    workload: &Workload,
    category: TestCategory,
    name: impl Into<String>,
    detail: impl Into<String>,
    started: Instant,
) -> VerificationResult {
    VerificationResult::new(workload, category, name, true, detail, started.elapsed())
}

fn fail(
    workload: &Workload,
    category: TestCategory,
    name: impl Into<String>,
    detail: impl Into<String>,
    started: Instant,
) -> VerificationResult {
    let result = VerificationResult::new(workload, category, name, false, detail, started.elapsed());
    tracing::warn!("{}: {} failed: {}", workload.name, result.name, result.detail);
    result
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A workload passes only when it ran tests and every one passed
#[must_use]
pub fn all_passed(results: &[VerificationResult]) -> bool {
    !results.is_empty() && results.iter().all(|r| r.passed)
}
