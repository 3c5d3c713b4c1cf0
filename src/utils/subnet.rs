use std::net::IpAddr;

/// Whether `ip` falls in any entry of a comma separated list of CIDR blocks or
/// bare addresses. Unparseable entries match nothing.
pub fn is_ip_in_subnets(ip: IpAddr, subnets: &str) -> bool {
    subnets
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|entry| matches_entry(ip, entry))
}

fn matches_entry(ip: IpAddr, entry: &str) -> bool {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => match prefix.trim().parse::<u8>() {
            Ok(prefix) => (addr.trim(), Some(prefix)),
            Err(_) => return false,
        },
        None => (entry, None),
    };
    let Ok(network) = addr.parse::<IpAddr>() else {
        return false;
    };

    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}
