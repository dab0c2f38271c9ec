use std::collections::HashSet;
use std::net::Ipv4Addr;

/// A parsed IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/len`; the address part must be the network address.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (addr, prefix) = raw
            .split_once('/')
            .ok_or_else(|| format!("cidr must be addr/prefix, got {raw}"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("invalid ipv4 address in cidr {raw}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid prefix length in cidr {raw}"))?;
        if prefix > 30 {
            return Err(format!("prefix /{prefix} leaves no allocatable hosts"));
        }

        let network = u32::from(addr);
        let mask = Self::mask(prefix);
        if network & !mask != 0 {
            return Err(format!("{raw} is not a network address"));
        }
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix) == self.network
    }

    /// First and last allocatable host addresses; network and broadcast
    /// addresses are reserved.
    fn host_range(&self) -> (u32, u32) {
        let size = 1u32 << (32 - self.prefix);
        (self.network + 1, self.network + size - 2)
    }

    /// Smallest free host address, honoring existing exclusive leases.
    pub fn allocate(&self, leased: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let (first, last) = self.host_range();
        (first..=last)
            .map(Ipv4Addr::from)
            .find(|candidate| !leased.contains(candidate))
    }
}
