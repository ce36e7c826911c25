//! Merged address intervals for interval-typed lookup sets
//!
//! CIDR blocks are converted to half-open `[start, end)` ranges, sorted by
//! start and merged in one linear pass, so overlapping or adjacent blocks
//! collapse into the minimal number of kernel set elements.

use crate::error::{Result, RoutingError};
use crate::ruleset::AddrFamily;
use ipnet::IpNet;
use std::net::IpAddr;

/// Half-open address range; `end == None` runs to the top of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u128,
    pub end: Option<u128>,
}

impl Interval {
    /// Last address covered by the interval
    pub fn last(&self, family: AddrFamily) -> u128 {
        match self.end {
            Some(end) => end - 1,
            None => family.max_value(),
        }
    }

    fn contains(&self, addr: u128) -> bool {
        addr >= self.start && self.end.map_or(true, |end| addr < end)
    }
}

/// One element of an interval set: a start key, or an end key flagged as such
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetElement {
    pub key: IpAddr,
    pub interval_end: bool,
}

/// Sorted, non-overlapping intervals for a single address family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSet {
    family: AddrFamily,
    intervals: Vec<Interval>,
}

impl IntervalSet {
    /// Build from CIDR strings; every entry must parse and match `family`
    pub fn from_cidrs<S: AsRef<str>>(family: AddrFamily, cidrs: &[S]) -> Result<Self> {
        let mut intervals = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let cidr = cidr.as_ref();
            let net: IpNet = cidr.parse().map_err(|_| RoutingError::InvalidCidr {
                cidr: cidr.to_string(),
            })?;
            intervals.push(cidr_interval(family, net).ok_or_else(|| {
                RoutingError::FamilyMismatch {
                    cidr: cidr.to_string(),
                }
            })?);
        }
        Ok(Self::from_intervals(family, intervals))
    }

    /// Build from arbitrary intervals, merging overlaps and adjacency
    pub fn from_intervals(family: AddrFamily, intervals: Vec<Interval>) -> Self {
        Self {
            family,
            intervals: merge(intervals),
        }
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match self.family.to_u128(addr) {
            Some(value) => self.intervals.iter().any(|iv| iv.contains(value)),
            None => false,
        }
    }

    /// Alternating start/end elements as the kernel expects them.
    /// An interval reaching the top of the address space has no end element.
    pub fn elements(&self) -> Vec<SetElement> {
        let mut elements = Vec::with_capacity(self.intervals.len() * 2);
        for interval in &self.intervals {
            elements.push(SetElement {
                key: self.family.from_u128(interval.start),
                interval_end: false,
            });
            if let Some(end) = interval.end {
                elements.push(SetElement {
                    key: self.family.from_u128(end),
                    interval_end: true,
                });
            }
        }
        elements
    }

    /// Inclusive `(first, last)` address pairs
    pub fn ranges(&self) -> Vec<(IpAddr, IpAddr)> {
        self.intervals
            .iter()
            .map(|iv| {
                (
                    self.family.from_u128(iv.start),
                    self.family.from_u128(iv.last(self.family)),
                )
            })
            .collect()
    }
}

fn cidr_interval(family: AddrFamily, net: IpNet) -> Option<Interval> {
    // network base and base | !mask
    let start = family.to_u128(net.network())?;
    let last = family.to_u128(net.broadcast())?;
    let end = if last == family.max_value() {
        None
    } else {
        Some(last + 1)
    };
    Some(Interval { start, end })
}

fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by_key(|iv| iv.start);

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        if let Some(last) = merged.last_mut() {
            match last.end {
                None => continue,
                Some(last_end) if interval.start <= last_end => {
                    last.end = match interval.end {
                        None => None,
                        Some(end) => Some(end.max(last_end)),
                    };
                    continue;
                }
                Some(_) => {}
            }
        }
        merged.push(interval);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(s: &str) -> IpAddr {
        IpAddr::V4(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_overlapping_and_adjacent_merge() {
        let set = IntervalSet::from_cidrs(
            AddrFamily::V4,
            &["11.0.0.0/8", "10.1.0.0/16", "10.0.0.0/8", "192.168.1.0/24"],
        )
        .unwrap();

        assert_eq!(
            set.ranges(),
            vec![
                (v4("10.0.0.0"), v4("11.255.255.255")),
                (v4("192.168.1.0"), v4("192.168.1.255")),
            ]
        );
    }

    #[test]
    fn test_elements_alternate() {
        let set = IntervalSet::from_cidrs(AddrFamily::V4, &["10.0.0.0/8"]).unwrap();
        assert_eq!(
            set.elements(),
            vec![
                SetElement { key: v4("10.0.0.0"), interval_end: false },
                SetElement { key: v4("11.0.0.0"), interval_end: true },
            ]
        );
    }

    #[test]
    fn test_top_of_space_has_no_end_element() {
        let set = IntervalSet::from_cidrs(AddrFamily::V4, &["224.0.0.0/3"]).unwrap();
        let elements = set.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].key, v4("224.0.0.0"));
        assert!(set.contains(v4("255.255.255.255")));

        let set6 = IntervalSet::from_cidrs(AddrFamily::V6, &["ff00::/8", "fe80::/10"]).unwrap();
        assert_eq!(set6.intervals().len(), 2);
        assert_eq!(set6.intervals()[1].end, None);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            IntervalSet::from_cidrs(AddrFamily::V4, &["10.0.0.0/33"]),
            Err(RoutingError::InvalidCidr { .. })
        ));
        assert!(matches!(
            IntervalSet::from_cidrs(AddrFamily::V4, &["fc00::/7"]),
            Err(RoutingError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_ipv6_contains() {
        let set = IntervalSet::from_cidrs(AddrFamily::V6, &["fc00::/7", "::1/128"]).unwrap();
        assert!(set.contains(IpAddr::V6("fd12::1".parse::<Ipv6Addr>().unwrap())));
        assert!(set.contains(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!set.contains(IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap())));
        assert!(!set.contains(v4("10.0.0.1")));
    }

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_random_lists_are_sorted_disjoint_and_idempotent() {
        let mut rng = Lcg(0x5eed);
        for _ in 0..200 {
            let count = (rng.next() % 12) as usize;
            let cidrs: Vec<String> = (0..count)
                .map(|_| {
                    // confine to 10.0.0.0/8 so collisions are likely
                    let addr = Ipv4Addr::from(0x0a00_0000 | (rng.next() as u32 & 0x00ff_ffff));
                    let prefix = 8 + rng.next() % 25;
                    format!("{}/{}", addr, prefix)
                })
                .collect();
            let nets: Vec<ipnet::Ipv4Net> = cidrs.iter().map(|c| c.parse().unwrap()).collect();

            let set = IntervalSet::from_cidrs(AddrFamily::V4, &cidrs).unwrap();
            let ivs = set.intervals();

            for pair in ivs.windows(2) {
                let prev_end = pair[0].end.expect("only the last interval can be open");
                assert!(prev_end < pair[1].start, "intervals must be disjoint and non-adjacent");
            }

            let again = IntervalSet::from_intervals(AddrFamily::V4, ivs.to_vec());
            assert_eq!(again, set);

            for _ in 0..32 {
                let addr = Ipv4Addr::from(0x0a00_0000 | (rng.next() as u32 & 0x00ff_ffff));
                let expected = nets.iter().any(|n| n.contains(&addr));
                assert_eq!(set.contains(IpAddr::V4(addr)), expected, "addr {}", addr);
            }
        }
    }
}
