//! Pool definitions and allocation records.
//!
//! A pool is declared as a list of [`FipConf`] entries, one per routable
//! subnet. Each entry carries the allocatable addresses as single IPs or
//! `first~last` ranges. [`expand`] validates the declaration and turns it
//! into [`PoolEntry`] values the allocator indexes by subnet.

use crate::error::IpamError;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One pool declaration as found in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FipConf {
    /// The subnet nodes must be able to reach directly.
    pub routable_subnet: Ipv4Network,
    /// Allocatable addresses: `"10.0.0.2"` or `"10.0.0.2~10.0.0.30"`.
    pub ips: Vec<String>,
    /// Gateway for allocated addresses.
    pub gateway: Ipv4Addr,
    /// VLAN id, 0 when untagged.
    #[serde(default)]
    pub vlan: u16,
}

/// A contiguous, inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FipRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
}

impl FipRange {
    /// Parses `"a.b.c.d"` or `"a.b.c.d~a.b.c.e"`.
    pub fn parse(s: &str) -> Result<Self, IpamError> {
        let (first, last) = match s.split_once('~') {
            Some((first, last)) => (first.trim(), last.trim()),
            None => (s.trim(), s.trim()),
        };
        let first: Ipv4Addr = first
            .parse()
            .map_err(|_| IpamError::Config(format!("bad ip range {s:?}")))?;
        let last: Ipv4Addr = last
            .parse()
            .map_err(|_| IpamError::Config(format!("bad ip range {s:?}")))?;
        if u32::from(first) > u32::from(last) {
            return Err(IpamError::Config(format!("ip range {s:?} is reversed")));
        }
        Ok(Self { first, last })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.first)..=u32::from(self.last)).contains(&u32::from(ip))
    }

    pub fn overlaps(&self, other: &FipRange) -> bool {
        u32::from(self.first) <= u32::from(other.last)
            && u32::from(other.first) <= u32::from(self.last)
    }

    /// All addresses in the range, ascending.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }
}

/// A validated pool entry, the in-memory form of one [`FipConf`].
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub routable_subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub vlan: u16,
    pub ranges: Vec<FipRange>,
}

impl PoolEntry {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }

    pub fn ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ranges.iter().flat_map(FipRange::iter)
    }
}

/// Validates pool declarations: every range parses, lies inside its routable
/// subnet, and no two ranges overlap anywhere in the pool.
pub fn expand(confs: &[FipConf]) -> Result<Vec<PoolEntry>, IpamError> {
    let mut entries = Vec::with_capacity(confs.len());
    for conf in confs {
        let mut ranges = Vec::with_capacity(conf.ips.len());
        for spec in &conf.ips {
            let range = FipRange::parse(spec)?;
            if !conf.routable_subnet.contains(range.first)
                || !conf.routable_subnet.contains(range.last)
            {
                return Err(IpamError::Config(format!(
                    "range {spec:?} is outside routable subnet {}",
                    conf.routable_subnet
                )));
            }
            ranges.push(range);
        }
        if !conf.routable_subnet.contains(conf.gateway) {
            return Err(IpamError::Config(format!(
                "gateway {} is outside routable subnet {}",
                conf.gateway, conf.routable_subnet
            )));
        }
        entries.push(PoolEntry {
            routable_subnet: conf.routable_subnet,
            gateway: conf.gateway,
            vlan: conf.vlan,
            ranges,
        });
    }
    let all: Vec<FipRange> = entries
        .iter()
        .flat_map(|e| e.ranges.iter().copied())
        .collect();
    for (i, a) in all.iter().enumerate() {
        for b in all.iter().skip(i + 1) {
            if a.overlaps(b) {
                return Err(IpamError::Config(format!(
                    "ranges {}~{} and {}~{} overlap",
                    a.first, a.last, b.first, b.last
                )));
            }
        }
    }
    Ok(entries)
}

/// Retention policy recorded on an allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    #[default]
    Normal,
    Invariant,
}

impl ReleasePolicy {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ReleasePolicy::Invariant,
            _ => ReleasePolicy::Normal,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ReleasePolicy::Normal => 0,
            ReleasePolicy::Invariant => 1,
        }
    }
}

/// One durable allocation row. `key` is empty while the IP is free.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRecord {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub key: String,
    pub attr: String,
    pub policy: ReleasePolicy,
    pub updated_at: DateTime<Utc>,
}

/// Allocation result handed back to callers and published on the pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    /// Prefix length of the routable subnet.
    pub mask: u8,
    #[serde(default, skip_serializing_if = "vlan_is_untagged")]
    pub vlan: u16,
    pub gateway: Ipv4Addr,
    pub routable_subnet: Ipv4Network,
}

fn vlan_is_untagged(vlan: &u16) -> bool {
    *vlan == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(subnet: &str, ips: &[&str], gateway: &str) -> FipConf {
        FipConf {
            routable_subnet: subnet.parse().unwrap(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            gateway: gateway.parse().unwrap(),
            vlan: 0,
        }
    }

    #[test]
    fn parses_single_ip_and_range() {
        let single = FipRange::parse("10.0.0.5").unwrap();
        assert_eq!(single.first, single.last);

        let range = FipRange::parse("10.0.0.2~10.0.0.30").unwrap();
        assert_eq!(range.first, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(range.last, "10.0.0.30".parse::<Ipv4Addr>().unwrap());
        assert_eq!(range.iter().count(), 29);
    }

    #[test]
    fn rejects_reversed_and_garbage_ranges() {
        assert!(FipRange::parse("10.0.0.9~10.0.0.2").is_err());
        assert!(FipRange::parse("10.0.0.256").is_err());
        assert!(FipRange::parse("not-an-ip").is_err());
    }

    #[test]
    fn expand_rejects_overlapping_definitions() {
        let confs = vec![
            conf("10.0.0.0/24", &["10.0.0.2~10.0.0.10"], "10.0.0.1"),
            conf("10.0.0.0/24", &["10.0.0.8~10.0.0.20"], "10.0.0.1"),
        ];
        let err = expand(&confs).unwrap_err();
        assert!(matches!(err, IpamError::Config(_)));
    }

    #[test]
    fn expand_rejects_range_outside_subnet() {
        let confs = vec![conf("10.0.0.0/29", &["10.0.0.1~10.0.0.9"], "10.0.0.6")];
        assert!(expand(&confs).is_err());
    }

    #[test]
    fn expand_accepts_disjoint_subnets() {
        let confs = vec![
            conf("10.0.0.0/29", &["10.0.0.1~10.0.0.3"], "10.0.0.6"),
            conf("10.0.1.0/29", &["10.0.1.1", "10.0.1.3"], "10.0.1.6"),
        ];
        let entries = expand(&confs).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ips().count(), 3);
        assert_eq!(entries[1].ips().count(), 2);
        assert!(entries[1].contains("10.0.1.3".parse().unwrap()));
        assert!(!entries[1].contains("10.0.1.2".parse().unwrap()));
    }

    #[test]
    fn ip_info_wire_format() {
        let info = IpInfo {
            ip: "10.0.0.2".parse().unwrap(),
            mask: 29,
            vlan: 0,
            gateway: "10.0.0.6".parse().unwrap(),
            routable_subnet: "10.0.0.0/29".parse().unwrap(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["ip"], "10.0.0.2");
        assert_eq!(value["mask"], 29);
        assert_eq!(value["gateway"], "10.0.0.6");
        assert_eq!(value["routableSubnet"], "10.0.0.0/29");
        assert!(value.get("vlan").is_none());

        let tagged = IpInfo { vlan: 7, ..info };
        let value = serde_json::to_value(&tagged).unwrap();
        assert_eq!(value["vlan"], 7);
    }
}
