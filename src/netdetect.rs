use anyhow::{Context, Result};
use if_addrs::get_if_addrs;
use ipnet::Ipv6Net;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address families this host can plausibly reach the internet over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

/// Inspect local interfaces to decide which families are worth scanning.
///
/// IPv6 only counts when some interface carries a globally routable address;
/// link-local and unique-local addresses are present on most hosts without
/// any IPv6 uplink.
pub fn detect_local_families() -> Result<LocalFamilies> {
    let addrs = get_if_addrs().context("listing network interfaces")?;
    Ok(families_from(addrs.into_iter().map(|iface| iface.ip())))
}

pub fn families_from(addrs: impl IntoIterator<Item = IpAddr>) -> LocalFamilies {
    addrs.into_iter().fold(LocalFamilies::default(), |mut f, ip| {
        match ip {
            IpAddr::V4(v4) => f.ipv4 |= is_usable_ipv4(v4),
            IpAddr::V6(v6) => f.ipv6 |= is_global_ipv6(v6),
        }
        f
    })
}

pub fn is_usable_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback() || ip.is_link_local() || ip.is_unspecified())
}

/// Conservative stand-in for the unstable `Ipv6Addr::is_global`.
pub fn is_global_ipv6(ip: Ipv6Addr) -> bool {
    const NON_GLOBAL: [(Ipv6Addr, u8); 4] = [
        (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10), // link-local
        (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),  // unique-local
        (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),  // multicast
        (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32), // documentation
    ];
    if ip.is_loopback() || ip.is_unspecified() || ip.to_ipv4_mapped().is_some() {
        return false;
    }
    !NON_GLOBAL.iter().any(|&(net, len)| {
        Ipv6Net::new(net, len).is_ok_and(|n| n.contains(&ip))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_ipv6_classification() {
        assert!(is_global_ipv6("2606:4700::1111".parse().unwrap()));
        assert!(!is_global_ipv6("fe80::1".parse().unwrap()));
        assert!(!is_global_ipv6("fd12:3456::1".parse().unwrap()));
        assert!(!is_global_ipv6("::1".parse().unwrap()));
        assert!(!is_global_ipv6("2001:db8::5".parse().unwrap()));
        assert!(!is_global_ipv6("::ffff:1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn loopback_only_host_has_no_families() {
        let f = families_from(["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()]);
        assert_eq!(f, LocalFamilies::default());
    }
}
