//! Reachability probe (C6): host IP-capability detection and the SSH
//! port-open poll loop.
//!
//! Structurally the same "poll with `tokio::time::sleep` in a bounded loop,
//! log every Nth attempt" idiom as `HetznerProvider::wait_for_server_running`
//! in `morpheus-hetzner`, applied here to a TCP handshake instead of a JSON
//! status field.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SSH_DEADLINE: Duration = Duration::from_secs(300);

const IPV6_PROBE_URL: &str = "https://api6.ipify.org";
const IPV4_PROBE_URL: &str = "https://api4.ipify.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityError {
    Timeout,
    PortClosed,
    NoRoute,
    NetworkUnreachable,
}

impl std::fmt::Display for ReachabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::PortClosed => "port closed",
            Self::NoRoute => "no route",
            Self::NetworkUnreachable => "network unreachable",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for ReachabilityError {}

/// Checks whether this host can reach the public internet over IPv6 and/or
/// IPv4. Used at startup to decide whether to request an IPv4 address from
/// the cloud provider.
pub async fn check_host_capability() -> (bool, bool) {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("failed to build HTTP client");

    let ipv6_ok = client.get(IPV6_PROBE_URL).send().await.is_ok();
    let ipv4_ok = client.get(IPV4_PROBE_URL).send().await.is_ok();
    debug!(ipv6_ok, ipv4_ok, "host IP capability check");
    (ipv6_ok, ipv4_ok)
}

/// Builds the `host:port` string a TCP connect expects, bracketing IPv6
/// literals.
fn dial_target(addr: &str, port: u16) -> String {
    if addr.contains(':') {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}

fn classify_connect_error(e: &std::io::Error) -> ReachabilityError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => ReachabilityError::PortClosed,
        ErrorKind::TimedOut => ReachabilityError::Timeout,
        _ => match e.raw_os_error() {
            // ENETUNREACH
            Some(101) => ReachabilityError::NetworkUnreachable,
            // EHOSTUNREACH
            Some(113) => ReachabilityError::NoRoute,
            _ => ReachabilityError::Timeout,
        },
    }
}

/// Polls `addr:port` with a TCP connect until it succeeds or `deadline`
/// elapses. Success is a completed handshake; no SSH protocol negotiation
/// is attempted.
pub async fn wait_for_ssh(addr: &str, port: u16, deadline: Duration) -> Result<(), ReachabilityError> {
    let target = dial_target(addr, port);
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut last_error = ReachabilityError::Timeout;

    loop {
        if started.elapsed() >= deadline {
            return Err(last_error);
        }

        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => {
                info!(target = %target, attempt, "SSH port reachable");
                return Ok(());
            }
            Ok(Err(e)) => {
                last_error = classify_connect_error(&e);
                if last_error == ReachabilityError::PortClosed {
                    // A closed port answers immediately and deterministically;
                    // no point waiting out the rest of the interval budget.
                    return Err(last_error);
                }
            }
            Err(_elapsed) => {
                last_error = ReachabilityError::Timeout;
            }
        }

        if attempt % 6 == 0 {
            debug!(target = %target, attempt, "still waiting for SSH port");
        }
        attempt += 1;
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Capability-trait wrapper around [`wait_for_ssh`], so the Provisioner can
/// depend on a trait object and tests can substitute a fake prober instead
/// of dialing real sockets.
#[async_trait]
pub trait SshProbe: Send + Sync {
    async fn wait_for_ssh(&self, addr: &str, port: u16, deadline: Duration) -> Result<(), ReachabilityError>;
}

pub struct TcpSshProbe;

#[async_trait]
impl SshProbe for TcpSshProbe {
    async fn wait_for_ssh(&self, addr: &str, port: u16, deadline: Duration) -> Result<(), ReachabilityError> {
        wait_for_ssh(addr, port, deadline).await
    }
}
