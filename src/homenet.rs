//! Home-network CIDR membership (spec.md §4.6, §6
//! `engine_set_homenet_from_str`), plus the comma-separated exclusion lists
//! consumed by `engine_add_global_exclusions`.
//!
//! Supplemented from `examples/original_source/src/netspade.c`: a missing
//! `/n` suffix defaults to `/32` (a single host), and an empty homenet list
//! makes every "in homenet" predicate vacuously true (spec.md §4.6).

use crate::error::SpadeError;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy)]
pub struct Cidr {
    network: u32,
    mask: u32,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self, SpadeError> {
        let s = s.trim();
        let (addr_part, bits) = match s.split_once('/') {
            Some((a, b)) => (
                a,
                b.parse::<u32>()
                    .map_err(|_| SpadeError::Configuration(format!("bad CIDR prefix in '{s}'")))?,
            ),
            None => (s, 32),
        };
        if bits > 32 {
            return Err(SpadeError::Configuration(format!("bad CIDR prefix in '{s}'")));
        }
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| SpadeError::Configuration(format!("bad CIDR address in '{s}'")))?;
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        Ok(Cidr {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr & self.mask == self.network
    }
}

/// A parsed comma-separated list of CIDR blocks.
#[derive(Debug, Clone, Default)]
pub struct HomeNet {
    blocks: Vec<Cidr>,
}

impl HomeNet {
    pub fn empty() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Parse a comma-separated CIDR list. An empty/whitespace-only string
    /// yields an empty `HomeNet`, under which every membership query is
    /// `true` (spec.md §4.6).
    pub fn parse(s: &str) -> Result<Self, SpadeError> {
        let mut blocks = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            blocks.push(Cidr::parse(part)?);
        }
        Ok(Self { blocks })
    }

    pub fn contains(&self, addr: u32) -> bool {
        if self.blocks.is_empty() {
            return true;
        }
        self.blocks.iter().any(|b| b.contains(addr))
    }
}

/// An exclusion list of IPs (by CIDR) and ports (by exact match), per
/// `engine_add_global_exclusions` / per-detector exclusions (spec.md §4.6).
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    sips: Vec<Cidr>,
    dips: Vec<Cidr>,
    sports: Vec<u32>,
    dports: Vec<u32>,
}

fn parse_ports(s: &str) -> Result<Vec<u32>, SpadeError> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u32>()
                .map_err(|_| SpadeError::Configuration(format!("bad port literal '{p}'")))
        })
        .collect()
}

fn parse_cidrs(s: &str) -> Result<Vec<Cidr>, SpadeError> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(Cidr::parse)
        .collect()
}

impl ExclusionList {
    pub fn parse(xsips: &str, xdips: &str, xsports: &str, xdports: &str) -> Result<Self, SpadeError> {
        Ok(Self {
            sips: parse_cidrs(xsips)?,
            dips: parse_cidrs(xdips)?,
            sports: parse_ports(xsports)?,
            dports: parse_ports(xdports)?,
        })
    }

    pub fn excludes(&self, sip: u32, dip: u32, sport: u32, dport: u32) -> bool {
        self.sips.iter().any(|c| c.contains(sip))
            || self.dips.iter().any(|c| c.contains(dip))
            || self.sports.iter().any(|&p| p == sport)
            || self.dports.iter().any(|&p| p == dport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn empty_homenet_always_contains() {
        let h = HomeNet::empty();
        assert!(h.contains(ip("1.2.3.4")));
    }

    #[test]
    fn cidr_membership() {
        let h = HomeNet::parse("10.0.0.0/8,192.168.1.0/24").unwrap();
        assert!(h.contains(ip("10.1.2.3")));
        assert!(h.contains(ip("192.168.1.200")));
        assert!(!h.contains(ip("8.8.8.8")));
    }

    #[test]
    fn missing_prefix_defaults_to_host_route() {
        let h = HomeNet::parse("10.0.0.1").unwrap();
        assert!(h.contains(ip("10.0.0.1")));
        assert!(!h.contains(ip("10.0.0.2")));
    }

    #[test]
    fn exclusion_matches_any_axis() {
        let ex = ExclusionList::parse("10.0.0.0/8", "", "", "80,443").unwrap();
        assert!(ex.excludes(ip("10.1.1.1"), ip("1.1.1.1"), 1234, 5));
        assert!(ex.excludes(ip("1.1.1.1"), ip("1.1.1.1"), 1234, 80));
        assert!(!ex.excludes(ip("1.1.1.1"), ip("2.2.2.2"), 1234, 5));
    }
}
