use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A network range: address family, base address, prefix length.
///
/// Matching is a family-specific bitmask comparison; `/0` matches every
/// address of its family and nothing of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

/// A string that does not parse as `address` or `address/prefix`.
#[derive(Debug, Clone)]
pub struct InvalidCidr(pub String);

impl fmt::Display for InvalidCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR '{}'", self.0)
    }
}

impl std::error::Error for InvalidCidr {}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, InvalidCidr> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(InvalidCidr(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    /// A single-host network (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(base), IpAddr::V4(candidate)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                u32::from(base) & mask == u32::from(candidate) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(candidate)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                u128::from(base) & mask == u128::from(candidate) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = InvalidCidr;

    /// Parse `addr/prefix`; a bare address is its own single-host network.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().map_err(|_| InvalidCidr(s.to_string()))?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| InvalidCidr(s.to_string()))?;
                Cidr::new(addr, prefix)
            }
            None => {
                let addr: IpAddr = s.trim().parse().map_err(|_| InvalidCidr(s.to_string()))?;
                Ok(Cidr::host(addr))
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Whether any network in the list contains `ip`.
pub fn any_contains(cidrs: &[Cidr], ip: IpAddr) -> bool {
    cidrs.iter().any(|c| c.contains(ip))
}

/// Parse a list of CIDR strings.
pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<Cidr>, InvalidCidr> {
    items.iter().map(|s| s.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_prefix_match() {
        let net: Cidr = "198.51.100.0/24".parse().unwrap();
        assert!(net.contains(ip("198.51.100.25")));
        assert!(net.contains(ip("198.51.100.255")));
        assert!(!net.contains(ip("198.51.101.1")));
    }

    #[test]
    fn bare_address_is_host_network() {
        let net: Cidr = "203.0.113.5".parse().unwrap();
        assert!(net.contains(ip("203.0.113.5")));
        assert!(!net.contains(ip("203.0.113.6")));
    }

    #[test]
    fn zero_prefix_matches_whole_family_only() {
        let v4: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(v4.contains(ip("8.8.8.8")));
        assert!(!v4.contains(ip("::1")));

        let v6: Cidr = "::/0".parse().unwrap();
        assert!(v6.contains(ip("2001:db8::1")));
        assert!(!v6.contains(ip("8.8.8.8")));
    }

    #[test]
    fn v6_prefix_match() {
        let net: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(net.contains(ip("2001:db8::1")));
        assert!(net.contains(ip("2001:db8:ffff::1")));
        assert!(!net.contains(ip("2001:db9::1")));
    }

    #[test]
    fn invalid_inputs() {
        assert!("not-an-ip".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn list_helpers() {
        let nets = parse_list(&["127.0.0.1/32", "10.0.0.0/8"]).unwrap();
        assert!(any_contains(&nets, ip("10.1.2.3")));
        assert!(!any_contains(&nets, ip("192.168.0.1")));
    }
}
