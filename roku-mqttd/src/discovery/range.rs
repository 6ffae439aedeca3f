use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use serde::Deserialize;
use thiserror::Error;

/// Largest number of addresses a single range may expand to
pub const MAX_RANGE_ADDRESSES: u64 = 65_536;

/// An entry of `roku_ips`: `"10.0.0.7"`, `"10.0.0.0/24"`, `"10.0.0.5-10.0.0.9"`
/// or `["10.0.0.5", "10.0.0.9"]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RangeSpec {
    Text(String),
    Pair([String; 2]),
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Text(text) => write!(f, "{}", text),
            RangeSpec::Pair([start, end]) => write!(f, "[{}, {}]", start, end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangeError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),
    #[error("range start {start} is after end {end}")]
    Reversed { start: Ipv4Addr, end: Ipv4Addr },
    #[error("range {spec} covers {count} addresses, limit is {max}", max = MAX_RANGE_ADDRESSES)]
    TooLarge { spec: String, count: u64 },
}

fn parse_v4(text: &str) -> Result<Ipv4Addr, RangeError> {
    text.trim()
        .parse()
        .map_err(|_| RangeError::InvalidAddress(text.trim().to_string()))
}

/// Expand a range into concrete addresses.
///
/// CIDR blocks leave out their network and broadcast addresses.
pub fn expand(spec: &RangeSpec) -> Result<Vec<IpAddr>, RangeError> {
    match spec {
        RangeSpec::Pair([start, end]) => inclusive(spec, parse_v4(start)?, parse_v4(end)?),
        RangeSpec::Text(text) => {
            let text = text.trim();
            if let Some((base, prefix)) = text.split_once('/') {
                cidr_hosts(spec, parse_v4(base)?, prefix)
            } else if let Some((start, end)) = text.split_once('-') {
                inclusive(spec, parse_v4(start)?, parse_v4(end)?)
            } else {
                text.parse::<IpAddr>()
                    .map(|address| vec![address])
                    .map_err(|_| RangeError::InvalidAddress(text.to_string()))
            }
        }
    }
}

fn inclusive(spec: &RangeSpec, start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<IpAddr>, RangeError> {
    let (first, last) = (u32::from(start), u32::from(end));
    if first > last {
        return Err(RangeError::Reversed { start, end });
    }
    let count = u64::from(last - first) + 1;
    if count > MAX_RANGE_ADDRESSES {
        return Err(RangeError::TooLarge { spec: spec.to_string(), count });
    }
    Ok((first..=last).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect())
}

fn cidr_hosts(spec: &RangeSpec, base: Ipv4Addr, prefix: &str) -> Result<Vec<IpAddr>, RangeError> {
    let prefix: u32 = prefix
        .trim()
        .parse()
        .ok()
        .filter(|bits| *bits <= 32)
        .ok_or_else(|| RangeError::InvalidPrefix(prefix.trim().to_string()))?;

    let size = 1u64 << (32 - prefix);
    if size > MAX_RANGE_ADDRESSES + 2 {
        return Err(RangeError::TooLarge { spec: spec.to_string(), count: size });
    }
    if size <= 2 {
        return Ok(Vec::new());
    }

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u64::from(u32::from(base) & mask);
    Ok((network + 1..network + size - 1)
        .map(|n| IpAddr::V4(Ipv4Addr::from(n as u32)))
        .collect())
}
