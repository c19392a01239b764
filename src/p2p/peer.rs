use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tracing::debug;

use crate::model::P2pPeerData;
use crate::transport::resolve;

/// Resolved identity and candidate addresses of the remote end of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    /// Address the broker observed for the peer.
    pub addr: SocketAddr,
    /// Every candidate worth punching and dialing.
    pub addrs: Vec<SocketAddr>,
}

impl Peer {
    /// Resolves the primary address, which must succeed, and every candidate.
    /// Candidates that fail to resolve or name an unspecified IP are skipped.
    pub async fn resolve(data: &P2pPeerData) -> Result<Self> {
        let addr = resolve(&data.address)
            .await
            .with_context(|| format!("invalid address for peer {}", data.id))?;

        let mut addrs = Vec::with_capacity(data.addresses.len());
        for candidate in &data.addresses {
            match resolve(candidate).await {
                Ok(resolved) if resolved.ip().is_unspecified() => {}
                Ok(resolved) => {
                    if !addrs.contains(&resolved) {
                        addrs.push(resolved);
                    }
                }
                Err(e) => debug!(peer = %data.id, candidate = %candidate, error = %e, "skipping candidate"),
            }
        }
        if addrs.is_empty() && !addr.ip().is_unspecified() {
            addrs.push(addr);
        }

        Ok(Self { id: data.id.clone(), addr, addrs })
    }

    /// True if `ip` is the primary or one of the candidate addresses' IP.
    pub fn has_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.addr.ip().to_canonical() == ip || self.addrs.iter().any(|a| a.ip().to_canonical() == ip)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id({}) with address({})", self.id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_skips_unusable_candidates() {
        let data = P2pPeerData {
            id: "b".into(),
            address: "127.0.0.1:4000".into(),
            addresses: vec![
                "0.0.0.0:4000".into(),
                "10.0.0.7:4000".into(),
                "127.0.0.1:4000".into(),
                "10.0.0.7:4000".into(),
            ],
        };
        let peer = Peer::resolve(&data).await.expect("resolve failed");
        assert_eq!(peer.addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(peer.addrs, vec!["10.0.0.7:4000".parse().unwrap(), "127.0.0.1:4000".parse().unwrap()]);
        assert!(peer.has_ip("10.0.0.7".parse().unwrap()));
        assert!(!peer.has_ip("10.0.0.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn primary_is_used_when_no_candidates_resolve() {
        let data = P2pPeerData { id: "b".into(), address: "127.0.0.1:4000".into(), addresses: vec![] };
        let peer = Peer::resolve(&data).await.expect("resolve failed");
        assert_eq!(peer.addrs, vec![peer.addr]);
    }

    #[tokio::test]
    async fn invalid_primary_fails() {
        let data = P2pPeerData { id: "b".into(), address: "nowhere".into(), addresses: vec![] };
        assert!(Peer::resolve(&data).await.is_err());
    }
}
