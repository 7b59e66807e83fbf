//! Host resolution shared by the field-bus and sensor clients.

use std::{io, net::SocketAddr};

/// Resolve `host:port`, preferring an IPv4 address when the name has both.
pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host)))
}
