//! Listener setup: resolve the configured host/port and bind every compatible
//! address independently.
//!
//! This module is split into:
//! - `session`: listener and connection session state machines
//! - address resolution + binding helpers below

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};

use anyhow::{Context, Result, anyhow};

pub(crate) mod session;

/// Resolve `host:port` into candidate bind addresses. An empty host means the
/// unspecified address of both families.
pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if host.is_empty() {
        return Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]);
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}:{port}"))?
        .collect();
    if addrs.is_empty() {
        return Err(anyhow!("no addresses resolved for {host}:{port}"));
    }
    Ok(addrs)
}

/// Bind and listen on every candidate address, nonblocking.
///
/// A failing address is logged and skipped; only all of them failing is
/// fatal.
pub(crate) fn bind_all(addrs: &[SocketAddr]) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::new();

    for addr in addrs {
        let listener = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(%addr, "bind failed, skipping: {e}");
                continue;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            tracing::warn!(%addr, "set_nonblocking failed, skipping: {e}");
            continue;
        }
        tracing::info!(%addr, "listening");
        listeners.push(listener);
    }

    if listeners.is_empty() {
        return Err(anyhow!("could not bind any resolved address"));
    }
    Ok(listeners)
}
