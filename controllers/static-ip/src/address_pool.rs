//! Address pool arithmetic.
//!
//! `AddressPool` is the in-memory view of one `IPPool`: the allocatable
//! universe (subnets, ranges and explicit addresses, minus gateway and
//! exclusions) together with the current allocations read from status.
//! Addresses are handled as `u128` so IPv4 and IPv6 share one code path.
//!
//! Nothing here touches the store; the claim engine loads a pool, mutates
//! the view and persists [`AddressPool::records`] back to status.

use crate::error::ReconcileError;
use crds::{FulfilledAddress, IPPool, PoolAllocation};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    fn max_prefix(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    fn to_ip(self, value: u128) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(u32::try_from(value).map_or(Ipv4Addr::BROADCAST, Ipv4Addr::from)),
            Self::V6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn parse_addr(field: &str, value: &str) -> Result<IpAddr, ReconcileError> {
    value
        .trim()
        .parse()
        .map_err(|_| ReconcileError::Validation(format!("{} '{}' is not an IP address", field, value)))
}

/// Allocatable bounds of a subnet. IPv4 subnets wider than /31 lose their
/// network and broadcast addresses.
fn subnet_bounds(net: &IpNet) -> (u128, u128) {
    let first = to_u128(net.network());
    let last = to_u128(net.broadcast());
    match net {
        IpNet::V4(v4) if v4.prefix_len() < 31 => (first + 1, last - 1),
        _ => (first, last),
    }
}

/// In-memory view of one pool
#[derive(Debug, Clone)]
pub struct AddressPool {
    family: Family,
    /// Sorted, non-overlapping, non-adjacent inclusive segments
    segments: Vec<(u128, u128)>,
    /// Gateway and exclusions that fall inside the segments
    reserved: BTreeSet<u128>,
    /// Address -> claim name
    allocated: BTreeMap<u128, String>,
    prefix: u8,
    gateway: Option<IpAddr>,
    dns_servers: Vec<String>,
    search_domains: Vec<String>,
}

impl AddressPool {
    /// Parses and validates a pool resource, including its current allocations.
    pub fn from_resource(pool: &IPPool) -> Result<Self, ReconcileError> {
        let spec = &pool.spec;
        let mut family: Option<Family> = None;
        let mut check_family = |addr: IpAddr, field: &str| -> Result<(), ReconcileError> {
            let this = Family::of(addr);
            match family {
                Some(f) if f != this => Err(ReconcileError::Validation(format!(
                    "{} '{}' mixes IPv4 and IPv6 in one pool",
                    field, addr
                ))),
                _ => {
                    family = Some(this);
                    Ok(())
                }
            }
        };

        let mut raw: Vec<(u128, u128)> = Vec::new();
        for subnet in &spec.subnets {
            let net: IpNet = subnet.trim().parse().map_err(|_| {
                ReconcileError::Validation(format!("subnet '{}' is not a CIDR block", subnet))
            })?;
            check_family(net.network(), "subnet")?;
            raw.push(subnet_bounds(&net));
        }
        for range in &spec.ranges {
            let start = parse_addr("range start", &range.start)?;
            let end = parse_addr("range end", &range.end)?;
            check_family(start, "range start")?;
            check_family(end, "range end")?;
            let (start, end) = (to_u128(start), to_u128(end));
            if start > end {
                return Err(ReconcileError::Validation(format!(
                    "range {}-{} is reversed",
                    range.start, range.end
                )));
            }
            raw.push((start, end));
        }
        for address in &spec.addresses {
            let addr = parse_addr("address", address)?;
            check_family(addr, "address")?;
            let value = to_u128(addr);
            raw.push((value, value));
        }

        let gateway = match spec.gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
            Some(gw) => {
                let addr = parse_addr("gateway", gw)?;
                check_family(addr, "gateway")?;
                Some(addr)
            }
            None => None,
        };

        let mut excluded = Vec::with_capacity(spec.excluded_addresses.len());
        for address in &spec.excluded_addresses {
            let addr = parse_addr("excluded address", address)?;
            check_family(addr, "excluded address")?;
            excluded.push(to_u128(addr));
        }

        let family = family.unwrap_or(Family::V4);
        if spec.prefix > family.max_prefix() {
            return Err(ReconcileError::Validation(format!(
                "prefix /{} is too long for the pool's address family",
                spec.prefix
            )));
        }

        let segments = merge_segments(raw);
        let within = |value: &u128| segments.iter().any(|(lo, hi)| lo <= value && value <= hi);
        let reserved: BTreeSet<u128> = gateway
            .map(to_u128)
            .into_iter()
            .chain(excluded)
            .filter(|v| within(v))
            .collect();

        let mut allocated = BTreeMap::new();
        for record in pool.status.iter().flat_map(|s| s.allocations.iter()) {
            let addr = parse_addr("allocated address", &record.address)?;
            if allocated.contains_key(&to_u128(addr)) {
                warn!(
                    "Pool {:?} lists {} twice; keeping the first claim",
                    pool.metadata.name, record.address
                );
                continue;
            }
            allocated.insert(to_u128(addr), record.claim.clone());
        }

        Ok(Self {
            family,
            segments,
            reserved,
            allocated,
            prefix: spec.prefix,
            gateway,
            dns_servers: spec.dns_servers.clone(),
            search_domains: spec.search_domains.clone(),
        })
    }

    /// Lowest address that is neither reserved nor allocated.
    ///
    /// Every skipped candidate is a reserved or allocated address, so the
    /// scan is bounded by those set sizes, not by the pool size.
    pub fn next_free(&self) -> Option<IpAddr> {
        for &(lo, hi) in &self.segments {
            let mut candidate = lo;
            loop {
                if !self.reserved.contains(&candidate) && !self.allocated.contains_key(&candidate) {
                    return Some(self.family.to_ip(candidate));
                }
                if candidate == hi {
                    break;
                }
                candidate += 1;
            }
        }
        None
    }

    /// Address currently held by a claim
    pub fn allocation_of(&self, claim: &str) -> Option<IpAddr> {
        self.allocated
            .iter()
            .find(|(_, holder)| holder.as_str() == claim)
            .map(|(&value, _)| self.family.to_ip(value))
    }

    /// Binds an address to a claim
    pub fn assign(&mut self, addr: IpAddr, claim: &str) {
        self.allocated.insert(to_u128(addr), claim.to_string());
    }

    /// Allocation records for status, ascending by address
    pub fn records(&self) -> Vec<PoolAllocation> {
        self.allocated
            .iter()
            .map(|(&value, claim)| PoolAllocation {
                address: self.family.to_ip(value).to_string(),
                claim: claim.clone(),
            })
            .collect()
    }

    /// Number of allocatable addresses
    pub fn capacity(&self) -> u128 {
        let span = self
            .segments
            .iter()
            .fold(0u128, |total, (lo, hi)| total.saturating_add(hi - lo).saturating_add(1));
        span.saturating_sub(self.reserved.len() as u128)
    }

    /// Number of allocations inside the allocatable universe
    pub fn allocated_count(&self) -> u128 {
        self.allocated
            .keys()
            .filter(|&&v| !self.reserved.contains(&v))
            .filter(|&&v| self.segments.iter().any(|&(lo, hi)| lo <= v && v <= hi))
            .count() as u128
    }

    /// Number of free addresses
    pub fn available(&self) -> u128 {
        self.capacity().saturating_sub(self.allocated_count())
    }

    /// Network configuration handed out with `addr`
    pub fn snapshot(&self, addr: IpAddr) -> FulfilledAddress {
        FulfilledAddress {
            address: addr.to_string(),
            gateway: self.gateway.map(|gw| gw.to_string()).unwrap_or_default(),
            prefix: self.prefix,
            dns_servers: self.dns_servers.clone(),
            search_domains: self.search_domains.clone(),
        }
    }
}

fn merge_segments(mut raw: Vec<(u128, u128)>) -> Vec<(u128, u128)> {
    raw.sort_unstable();
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(raw.len());
    for (lo, hi) in raw {
        match merged.last_mut() {
            Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                *last_hi = (*last_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

/// Saturating conversion for status counters
pub fn counter(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
