use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use sysinfo::Networks;

/// IP a node binds to. Accepts anything convertible to [`IpAddr`] so the
/// config builder can take `Ipv4Addr::LOCALHOST` or a parsed string alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAddress(pub(crate) IpAddr);

impl IpAddress {
    pub fn into_inner(self) -> IpAddr {
        self.0
    }

    /// First non-loopback address of the host, IPv4 preferred over IPv6.
    pub fn find_system_ip() -> Result<IpAddr> {
        let networks = Networks::new_with_refreshed_list();
        let candidates: Vec<IpAddr> = networks
            .iter()
            .flat_map(|(_, data)| data.ip_networks().iter().map(|network| network.addr))
            .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
            .collect();

        candidates
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| anyhow!("no non-loopback address found on this host"))
    }

    /// Address peers should dial to reach a socket bound on `bind`. A
    /// wildcard bind (`0.0.0.0`, `::`) advertises the host's system IP on
    /// the same port.
    pub fn advertise_addr(bind: SocketAddr) -> Result<SocketAddr> {
        if bind.ip().is_unspecified() {
            Ok(SocketAddr::new(Self::find_system_ip()?, bind.port()))
        } else {
            Ok(bind)
        }
    }
}

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip.into())
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.into())
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
