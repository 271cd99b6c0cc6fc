//! Network-origin signals.

use super::{RequestContext, SignalResult, SignalRule};
use crate::config::{ConfigError, NetworkConfig};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;

const CAP: u8 = 20;

/// Decides whether an address belongs to hosting infrastructure.
///
/// Stands in for an ASN or geo database lookup.
pub trait DatacenterLookup: Send + Sync {
    fn is_datacenter(&self, ip: &IpAddr) -> bool;
}

impl<F> DatacenterLookup for F
where
    F: Fn(&IpAddr) -> bool + Send + Sync,
{
    fn is_datacenter(&self, ip: &IpAddr) -> bool {
        self(ip)
    }
}

/// Datacenter lookup backed by a static list of CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct CidrDatacenterList {
    ranges: Vec<IpNet>,
}

impl CidrDatacenterList {
    /// Parse ranges in CIDR notation.
    pub fn new<S: AsRef<str>>(ranges: &[S]) -> Result<Self, ConfigError> {
        let ranges = ranges
            .iter()
            .map(|r| {
                r.as_ref()
                    .parse::<IpNet>()
                    .map_err(|_| ConfigError::Cidr(r.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl DatacenterLookup for CidrDatacenterList {
    fn is_datacenter(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// Network-origin rule.
pub struct NetworkRule {
    missing_ip_penalty: u8,
    datacenter_penalty: u8,
    datacenters: Arc<dyn DatacenterLookup>,
}

impl NetworkRule {
    /// Create a rule with the configured CIDR list.
    pub fn new(config: &NetworkConfig) -> Result<Self, ConfigError> {
        let list = CidrDatacenterList::new(&config.datacenter_ranges)?;
        Ok(Self::with_lookup(config, Arc::new(list)))
    }

    /// Create a rule with a custom datacenter lookup.
    pub fn with_lookup(config: &NetworkConfig, datacenters: Arc<dyn DatacenterLookup>) -> Self {
        Self {
            missing_ip_penalty: config.missing_ip_penalty,
            datacenter_penalty: config.datacenter_penalty,
            datacenters,
        }
    }
}

impl SignalRule for NetworkRule {
    fn evaluate(&self, ctx: &RequestContext) -> SignalResult {
        let raw = ctx.client_ip.as_deref().map(str::trim).unwrap_or("");
        if raw.is_empty() {
            return SignalResult::new(self.missing_ip_penalty)
                .with_reason("missing_client_ip")
                .capped(CAP);
        }

        let Some(ip) = ctx.parsed_ip() else {
            return SignalResult::new(self.missing_ip_penalty)
                .with_reason("malformed_client_ip")
                .capped(CAP);
        };

        if self.datacenters.is_datacenter(&ip) {
            return SignalResult::new(self.datacenter_penalty)
                .with_reason("datacenter_ip")
                .capped(CAP);
        }

        SignalResult::clean()
    }

    fn cap(&self) -> u8 {
        CAP
    }

    fn name(&self) -> &'static str {
        "network"
    }
}
