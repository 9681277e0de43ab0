use anyhow::{Context, anyhow, bail};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// An IPv4 interface address together with its subnet prefix (e.g. `10.0.0.1/24`)
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    network_prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, network_prefix: u8) -> anyhow::Result<Self> {
        if network_prefix == 0 {
            bail!("network prefix cannot be 0");
        }
        if network_prefix > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        Ok(Self {
            address,
            network_prefix,
        })
    }

    /// For prefixes that are known to be in range
    pub(crate) const fn from_parts(address: Ipv4Addr, network_prefix: u8) -> Self {
        Self {
            address,
            network_prefix,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn network_prefix(&self) -> u8 {
        self.network_prefix
    }

    fn mask(&self) -> u32 {
        u32::MAX << (32 - self.network_prefix as u32)
    }

    /// The first address of the subnet
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() & self.mask())
    }

    /// Returns true if `ip` is on the same subnet as this address
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.to_bits() & self.mask() == self.address.to_bits() & self.mask()
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.network_prefix)
    }
}

impl Debug for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let base_ip: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .context("invalid ip address in cidr")?;

        let IpAddr::V4(base_ip) = base_ip else {
            bail!("only IPv4 supported at the moment");
        };

        // A missing network prefix is interpreted as /32 (i.e. a single host)
        let network_prefix: u8 = parts
            .next()
            .unwrap_or("32")
            .parse()
            .context("the provided network prefix is not a valid unsigned integer")?;

        if parts.next().is_some() {
            bail!("cidr contains trailing characters");
        }

        Self::new(base_ip, network_prefix)
    }
}

#[test]
fn test_cidr_parsing() {
    let cases = [
        ("10.0.0.1/24", "10.0.0.1", 24, "10.0.0.0"),
        ("10.1.0.252/24", "10.1.0.252", 24, "10.1.0.0"),
        ("10.0.0.7", "10.0.0.7", 32, "10.0.0.7"),
        ("20.17.3.4/12", "20.17.3.4", 12, "20.16.0.0"),
    ];

    for (input, address, prefix, network) in cases {
        let cidr = Ipv4Cidr::from_str(input).unwrap();
        assert_eq!(cidr.address().to_string(), address);
        assert_eq!(cidr.network_prefix(), prefix);
        assert_eq!(cidr.network().to_string(), network);
        assert_eq!(cidr.to_string().parse::<Ipv4Cidr>().unwrap(), cidr);
    }

    for invalid in ["", "10.0.0.1/0", "10.0.0.1/33", "10.0.0.1/24/1", "::1/64", "10.0.0/24"] {
        assert!(Ipv4Cidr::from_str(invalid).is_err(), "{invalid} should not parse");
    }
}

#[test]
fn test_cidr_contains() {
    let cidr: Ipv4Cidr = "10.0.0.251/24".parse().unwrap();
    assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 1)));
    assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 255)));
    assert!(!cidr.contains(Ipv4Addr::new(10, 1, 0, 1)));

    let host: Ipv4Cidr = "10.0.0.251/32".parse().unwrap();
    assert!(host.contains(Ipv4Addr::new(10, 0, 0, 251)));
    assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 1)));
}
