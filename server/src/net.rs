//! Address policy and local address discovery

use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("No IPv4 address found{}", on_interface(.0))]
    NoAddress(Option<String>),

    #[error("Several IPv4 addresses found{}: {}; pick one explicitly", on_interface(.0), join(.1))]
    AmbiguousAddress(Option<String>, Vec<Ipv4Addr>),

    #[error("Interface enumeration failed: {0}")]
    Enumeration(String),
}

fn join(ips: &[Ipv4Addr]) -> String {
    ips.iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn on_interface(interface: &Option<String>) -> String {
    interface
        .as_ref()
        .map(|name| format!(" on interface {}", name))
        .unwrap_or_default()
}

/// Whether `ip` lies in an RFC 1918 range (10/8, 172.16/12, 192.168/16).
///
/// Registration only accepts such addresses. IPv6 counts only as an
/// IPv4-mapped form (`::ffff:10.0.0.5`).
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| v4.is_private()),
    }
}

/// Pick the single non-loopback IPv4 address from `candidates`
fn single_address(
    interface: Option<&str>,
    candidates: impl IntoIterator<Item = Ipv4Addr>,
) -> Result<Ipv4Addr, NetError> {
    let mut found: Vec<Ipv4Addr> = candidates
        .into_iter()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect();
    found.sort();
    found.dedup();

    match found.len() {
        0 => Err(NetError::NoAddress(interface.map(str::to_string))),
        1 => Ok(found[0]),
        _ => Err(NetError::AmbiguousAddress(interface.map(str::to_string), found)),
    }
}

/// The local non-loopback IPv4 address, optionally restricted to one
/// interface. Zero or several candidates is an error.
#[cfg(target_os = "linux")]
pub fn local_ipv4(interface: Option<&str>) -> Result<Ipv4Addr, NetError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| NetError::Enumeration(e.to_string()))?;

    let candidates = addrs
        .filter(|ifaddr| interface.map_or(true, |name| ifaddr.interface_name == name))
        .filter_map(|ifaddr| {
            ifaddr
                .address
                .and_then(|addr| addr.as_sockaddr_in().map(|sin| sin.ip()))
        });

    single_address(interface, candidates)
}

#[cfg(not(target_os = "linux"))]
pub fn local_ipv4(_interface: Option<&str>) -> Result<Ipv4Addr, NetError> {
    Err(NetError::Enumeration(
        "interface discovery is only supported on Linux; set the address explicitly".to_string(),
    ))
}
