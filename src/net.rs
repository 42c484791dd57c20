use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

/// Pick the local address to bind the wire socket to and advertise as the
/// host candidate: first non-loopback, non-VPN interface, preferring IPv4.
/// Falls back to loopback when the machine has nothing better, which still
/// lets same-host peers connect.
pub fn detect_host_addr() -> IpAddr {
    match usable_addresses() {
        Ok(addrs) if !addrs.is_empty() => addrs[0],
        Ok(_) => {
            debug!("no usable non-loopback interface, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            debug!("interface enumeration failed ({e}), using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// All non-loopback, non-VPN addresses, IPv4 first.
pub fn usable_addresses() -> Result<Vec<IpAddr>, crate::BoxError> {
    let interfaces = if_addrs::get_if_addrs()?;

    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    for iface in &interfaces {
        if iface.is_loopback() || is_vpn_interface(iface) {
            debug!(name = %iface.name, ip = %iface.ip(), "skipping interface");
            continue;
        }
        match iface.ip() {
            addr @ IpAddr::V4(_) => ipv4.push(addr),
            addr @ IpAddr::V6(_) => ipv6.push(addr),
        }
    }

    ipv4.extend(ipv6);
    Ok(ipv4)
}

/// Heuristic to detect VPN/tunnel interfaces.
fn is_vpn_interface(iface: &if_addrs::Interface) -> bool {
    let name = iface.name.to_lowercase();

    if name.contains("vpn")
        || name.contains("tun")
        || name.contains("tap")
        || name.contains("ppp")
        || name.contains("wg")
        || name.contains("tailscale")
        || name.contains("utun")
    {
        return true;
    }

    // CGNAT range 100.64.0.0/10 is commonly handed out by VPNs.
    if let IpAddr::V4(v4) = iface.ip()
        && is_cgnat(v4)
    {
        return true;
    }

    false
}

const fn is_cgnat(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0xC0) == 64
}
