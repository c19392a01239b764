//! Latency probing used to pick the nearest relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use crate::transport::QuicEndpoint;

/// Probes sent to each address by default.
pub const DEFAULT_PROBE_COUNT: usize = 3;

/// Measures one round trip to an address.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> Result<Duration>;
}

/// Measures the QUIC handshake round trip. Works against any xnet server
/// without an extra ping protocol; the probe session is closed right away.
#[derive(Debug, Clone)]
pub struct QuicHandshakeProbe {
    endpoint: QuicEndpoint,
}

impl QuicHandshakeProbe {
    pub fn new(endpoint: QuicEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl LatencyProbe for QuicHandshakeProbe {
    async fn probe(&self, addr: SocketAddr) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        let conn = self.endpoint.dial(addr).await?;
        let rtt = conn.rtt().min(started.elapsed());
        conn.close(quinn::VarInt::from_u32(0), b"probe");
        Ok(rtt)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    /// Address as given by the caller.
    pub label: String,
    /// Resolved address, if resolution succeeded.
    pub addr: Option<SocketAddr>,
    pub avg: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingResults {
    /// Responding addresses, fastest first.
    pub success: Vec<PingResult>,
    pub failed: Vec<PingResult>,
}

impl PingResults {
    pub fn fastest(&self) -> Option<&PingResult> {
        self.success.first()
    }
}

/// Resolves and probes every address concurrently, `count` times each.
/// An address counts as responding if at least one probe succeeded.
pub async fn ping_addrs(probe: Arc<dyn LatencyProbe>, addrs: &[String], count: usize) -> PingResults {
    let mut results = PingResults::default();
    let mut join_set = JoinSet::new();

    for label in addrs {
        let resolved = tokio::net::lookup_host(label.as_str())
            .await
            .with_context(|| format!("unable to resolve {}", label))
            .and_then(|mut it| it.next().ok_or_else(|| anyhow!("unable to resolve {}", label)));
        let addr = match resolved {
            Ok(addr) => addr,
            Err(e) => {
                results.failed.push(PingResult {
                    label: label.clone(),
                    addr: None,
                    avg: Duration::ZERO,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let probe = Arc::clone(&probe);
        let label = label.clone();
        join_set.spawn(async move {
            let mut samples = Vec::with_capacity(count);
            let mut last_err = None;
            for _ in 0..count.max(1) {
                match probe.probe(addr).await {
                    Ok(rtt) => samples.push(rtt),
                    Err(e) => last_err = Some(e.to_string()),
                }
            }
            if samples.is_empty() {
                return PingResult { label, addr: Some(addr), avg: Duration::ZERO, error: last_err };
            }
            let avg = samples.iter().sum::<Duration>() / samples.len() as u32;
            PingResult { label, addr: Some(addr), avg, error: None }
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) if result.error.is_none() => results.success.push(result),
            Ok(result) => results.failed.push(result),
            Err(e) => debug!(error = %e, "probe task failed"),
        }
    }
    results.success.sort_by_key(|r| r.avg);
    results
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FixedProbe {
        latencies: HashMap<SocketAddr, Option<Duration>>,
    }

    #[async_trait]
    impl LatencyProbe for FixedProbe {
        async fn probe(&self, addr: SocketAddr) -> Result<Duration> {
            self.latencies
                .get(&addr)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("unreachable"))
        }
    }

    #[tokio::test]
    async fn results_are_sorted_and_failures_split() {
        let slow: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let fast: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        let dead: SocketAddr = "127.0.0.1:7003".parse().unwrap();
        let probe = Arc::new(FixedProbe {
            latencies: HashMap::from([
                (slow, Some(Duration::from_millis(40))),
                (fast, Some(Duration::from_millis(5))),
                (dead, None),
            ]),
        });

        let addrs: Vec<String> = [slow, fast, dead].iter().map(|a| a.to_string()).collect();
        let results = ping_addrs(probe, &addrs, DEFAULT_PROBE_COUNT).await;

        assert_eq!(results.success.len(), 2);
        assert_eq!(results.fastest().and_then(|r| r.addr), Some(fast));
        assert_eq!(results.success[1].avg, Duration::from_millis(40));
        assert_eq!(results.failed.len(), 1);
        assert_eq!(results.failed[0].addr, Some(dead));
    }

    #[tokio::test]
    async fn unresolvable_address_fails_without_probing() {
        let probe = Arc::new(FixedProbe { latencies: HashMap::new() });
        let results = ping_addrs(probe, &["not an address".to_string()], 1).await;
        assert!(results.success.is_empty());
        assert_eq!(results.failed.len(), 1);
        assert!(results.failed[0].addr.is_none());
    }

    #[tokio::test]
    async fn handshake_probe_measures_live_server() {
        let server = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), true).await.expect("bind failed");
        let target = server.local_addr();
        tokio::spawn(async move {
            while let Some(incoming) = server.accept().await {
                let _ = incoming.await;
            }
        });

        let client = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.expect("bind failed");
        let rtt = QuicHandshakeProbe::new(client).probe(target).await.expect("probe failed");
        assert!(rtt < Duration::from_secs(1));
    }
}
