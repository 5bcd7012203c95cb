//! Bootstrap candidate resolution.
//!
//! Seed entries are either literal `ip:port` pairs or hostnames resolved
//! through the system resolver. Only IPv4 results are kept; the engine
//! dials IPv4 candidates exclusively.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// How long a single seed lookup may take.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve all configured seeds into dialable IPv4 addresses.
pub async fn resolve_seed_peers(seeds: &[String], default_port: u16) -> Vec<(Ipv4Addr, u16)> {
    let mut peers = Vec::new();

    for seed in seeds {
        match resolve_seed(seed, default_port).await {
            Ok(addrs) => {
                info!(seed = %seed, count = addrs.len(), "resolved seed");
                peers.extend(addrs);
            }
            Err(e) => {
                warn!(seed = %seed, error = %e, "failed to resolve seed");
            }
        }
    }

    peers.sort();
    peers.dedup();
    info!(count = peers.len(), "bootstrap candidates ready");
    peers
}

/// Resolve one seed entry.
async fn resolve_seed(seed: &str, default_port: u16) -> Result<Vec<(Ipv4Addr, u16)>, std::io::Error> {
    // Literal addresses skip the resolver entirely.
    if let Ok(addr) = seed.parse::<SocketAddr>() {
        return Ok(match addr {
            SocketAddr::V4(v4) => vec![(*v4.ip(), v4.port())],
            SocketAddr::V6(_) => Vec::new(),
        });
    }

    let lookup = if seed.contains(':') {
        seed.to_string()
    } else {
        format!("{seed}:{default_port}")
    };

    let resolved = timeout(
        RESOLVE_TIMEOUT,
        tokio::task::spawn_blocking(move || {
            lookup.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
        }),
    )
    .await;

    match resolved {
        Ok(Ok(Ok(addrs))) => Ok(addrs
            .into_iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some((*v4.ip(), v4.port())),
                SocketAddr::V6(_) => None,
            })
            .collect()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(e)) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("join error: {e}"),
        )),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "seed resolution timed out",
        )),
    }
}
