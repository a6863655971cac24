//! Range Resolver: IPv4 literals, `A-B` ranges and `A/n` blocks to inclusive bounds.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::utils::error::{FirewallError, FirewallResult};

/// Inclusive IPv4 range.
///
/// `end` is `None` when the source was a single literal (compiled as an equality),
/// and `Some` when a range or CIDR block was supplied (compiled as a range match),
/// even if both bounds coincide as for a `/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeValue {
    pub start: Ipv4Addr,
    pub end: Option<Ipv4Addr>,
}

impl RangeValue {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: None,
        }
    }

    pub fn is_range(&self) -> bool {
        self.end.is_some()
    }

    /// Last address covered
    pub fn last(&self) -> Ipv4Addr {
        self.end.unwrap_or(self.start)
    }

    /// Start address in wire order
    pub fn start_bytes(&self) -> [u8; 4] {
        self.start.octets()
    }

    /// End address in wire order, absent for literals
    pub fn end_bytes(&self) -> Option<[u8; 4]> {
        self.end.map(|e| e.octets())
    }
}

impl fmt::Display for RangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}", self.start),
        }
    }
}

/// Resolve an address literal, hyphenated range or CIDR block
pub fn resolve(input: &str) -> FirewallResult<RangeValue> {
    let input = input.trim();

    if let Some((first, second)) = input.split_once('-') {
        let start = parse_ipv4(first)?;
        let end = parse_ipv4(second)?;
        if start > end {
            return Err(FirewallError::parse(format!(
                "address range '{}' ends before it starts",
                input
            )));
        }
        return Ok(RangeValue {
            start,
            end: Some(end),
        });
    }

    if let Some((addr, prefix)) = input.split_once('/') {
        return resolve_cidr(input, addr, prefix);
    }

    parse_ipv4(input).map(RangeValue::single)
}

fn resolve_cidr(input: &str, addr: &str, prefix: &str) -> FirewallResult<RangeValue> {
    let base = parse_ipv4(addr)?;
    let prefix = prefix.trim();

    if prefix.contains('.') {
        return Err(FirewallError::UnsupportedFormat(format!(
            "'{}': subnet masks must be written as a prefix length, not dotted quads",
            input
        )));
    }

    let len: u32 = prefix
        .parse()
        .map_err(|_| FirewallError::parse(format!("invalid CIDR prefix in '{}'", input)))?;
    if len > 32 {
        return Err(FirewallError::parse(format!(
            "CIDR prefix /{} out of range in '{}'",
            len, input
        )));
    }

    // 2^(32-n) - 1; a shift by the full width (/32) has no host bits
    let host_bits = u32::MAX.checked_shr(len).unwrap_or(0);
    let start = u32::from(base) & !host_bits;
    let end = start | host_bits;

    Ok(RangeValue {
        start: Ipv4Addr::from(start),
        end: Some(Ipv4Addr::from(end)),
    })
}

fn parse_ipv4(text: &str) -> FirewallResult<Ipv4Addr> {
    let text = text.trim();
    match text.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(_)) => Err(FirewallError::UnsupportedFormat(format!(
            "'{}': only IPv4 addresses are supported",
            text
        ))),
        Err(_) => Err(FirewallError::parse(format!("invalid IPv4 address '{}'", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_has_no_end() {
        let r = resolve("192.168.0.1").unwrap();
        assert_eq!(r.start, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(r.end_bytes(), None);
        assert_eq!(r.start_bytes(), [192, 168, 0, 1]);
    }

    #[test]
    fn hyphenated_range() {
        let r = resolve("192.168.1.1-192.168.1.100").unwrap();
        assert_eq!(r.end, Some(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(r.to_string(), "192.168.1.1-192.168.1.100");
    }

    #[test]
    fn bad_range_side_is_parse_error() {
        assert!(matches!(
            resolve("10.0.0.1-10.0.0.300"),
            Err(FirewallError::ParseError(_))
        ));
        assert!(matches!(
            resolve("10.0.0.1-10.0.0.2-10.0.0.3"),
            Err(FirewallError::ParseError(_))
        ));
        assert!(matches!(
            resolve("10.0.0.9-10.0.0.1"),
            Err(FirewallError::ParseError(_))
        ));
    }

    #[test]
    fn cidr_masks_host_bits() {
        let r = resolve("192.168.2.1/24").unwrap();
        assert_eq!(r.start, Ipv4Addr::new(192, 168, 2, 0));
        assert_eq!(r.end, Some(Ipv4Addr::new(192, 168, 2, 255)));

        let r = resolve("10.1.2.3/32").unwrap();
        assert!(r.is_range());
        assert_eq!(r.start, r.last());

        let r = resolve("10.1.2.3/0").unwrap();
        assert_eq!(r.start, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(r.last(), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn cidr_bounds_lie_within_network() {
        let bases = ["192.168.77.201", "10.0.0.0", "255.255.255.255", "1.2.3.4"];
        for base in bases {
            let addr: Ipv4Addr = base.parse().unwrap();
            for len in 0..=32u32 {
                let r = resolve(&format!("{}/{}", base, len)).unwrap();
                assert!(r.start <= r.last(), "{}/{}", base, len);
                assert!(r.start <= addr && addr <= r.last(), "{}/{} must contain its base", base, len);

                let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
                let network = u32::from(addr) & mask;
                assert_eq!(u32::from(r.start), network);
                assert_eq!(u32::from(r.last()) & mask, network);
            }
        }
    }

    #[test]
    fn malformed_cidr_is_parse_error() {
        assert!(matches!(resolve("10.0.0.0/33"), Err(FirewallError::ParseError(_))));
        assert!(matches!(resolve("10.0.0.0/x"), Err(FirewallError::ParseError(_))));
        assert!(matches!(resolve("10.0.0/8"), Err(FirewallError::ParseError(_))));
    }

    #[test]
    fn dotted_mask_and_ipv6_are_unsupported() {
        assert!(matches!(
            resolve("192.168.2.0/255.255.255.0"),
            Err(FirewallError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            resolve("2001:db8::1"),
            Err(FirewallError::UnsupportedFormat(_))
        ));
    }
}
