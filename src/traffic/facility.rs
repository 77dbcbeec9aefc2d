//! Traffic facility group validation
//!
//! A group is a JSON array of facility objects. Validation is
//! all-or-nothing: the first bad facility rejects the whole group, with a
//! message naming the facility by name or, when it has none, by position.

use crate::error::{RouterError, RouterResult};
use crate::routing::normalize_prefix;
use crate::validation::is_dotted_decimal;
use ipnet::Ipv4Net;
use serde::Serialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

/// Ranges a gateway facility may not redirect
static RESERVED_NETWORKS: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.88.99.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// One validated facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "facility-type", rename_all = "kebab-case")]
pub enum Facility {
    /// Resolve `domains` through `targets` (`host[:port]`)
    Nameserver {
        #[serde(rename = "facility-name")]
        name: String,
        target: Vec<String>,
        #[serde(rename = "domain-list")]
        domains: Vec<String>,
    },
    /// Send traffic for `networks` through the target next hop pair
    Gateway {
        #[serde(rename = "facility-name")]
        name: String,
        target: (Option<String>, Option<String>),
        #[serde(rename = "network-list")]
        networks: Vec<Ipv4Net>,
    },
}

impl Facility {
    pub fn name(&self) -> &str {
        match self {
            Facility::Nameserver { name, .. } | Facility::Gateway { name, .. } => name,
        }
    }
}

fn reject(msg: String) -> RouterError {
    RouterError::InvalidFacility(msg)
}

/// Validate a whole facility group
pub fn validate_facility_group(group: &Value) -> RouterResult<Vec<Facility>> {
    let items = group
        .as_array()
        .ok_or_else(|| reject("Traffic facility group must be a list.".to_string()))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| validate_facility(idx + 1, item))
        .collect()
}

fn validate_facility(number: usize, item: &Value) -> RouterResult<Facility> {
    let name = match item.get("facility-name") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(reject(format!("Invalid \"facility-name\" for facility No.{}.", number))),
        None => return Err(reject(format!("Lacking \"facility-name\" for facility No.{}.", number))),
    };

    let kind = item
        .get("facility-type")
        .ok_or_else(|| reject(format!("Lacking \"facility-type\" for facility \"{}\".", name)))?;

    match kind.as_str() {
        Some("nameserver") => validate_nameserver(name, item),
        Some("gateway") => validate_gateway(name, item),
        _ => Err(reject(format!("Invalid \"facility-type\" for facility \"{}\".", name))),
    }
}

fn required<'a>(item: &'a Value, key: &str, name: &str) -> RouterResult<&'a Value> {
    item.get(key)
        .ok_or_else(|| reject(format!("Lacking \"{}\" for facility \"{}\".", key, name)))
}

fn string_list(value: &Value, key: &str, name: &str) -> RouterResult<Vec<String>> {
    let list = value
        .as_array()
        .ok_or_else(|| reject(format!("Type of \"{}\" is invalid for facility \"{}\".", key, name)))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| reject(format!("Some element in \"{}\" is invalid for facility \"{}\".", key, name)))
        })
        .collect()
}

fn validate_nameserver(name: String, item: &Value) -> RouterResult<Facility> {
    let target = string_list(required(item, "target", &name)?, "target", &name)?;
    for server in &target {
        if let Some((_, port)) = server.split_once(':') {
            if port.contains(':') || port.parse::<u16>().is_err() {
                return Err(reject(format!(
                    "Some element in \"target\" is invalid for facility \"{}\".",
                    name
                )));
            }
        }
    }

    let domains = string_list(required(item, "domain-list", &name)?, "domain-list", &name)?;

    Ok(Facility::Nameserver {
        name,
        target,
        domains,
    })
}

fn validate_gateway(name: String, item: &Value) -> RouterResult<Facility> {
    let invalid_target = || reject(format!("Invalid \"target\" for facility \"{}\".", name));
    let target = match required(item, "target", &name)?.as_array() {
        Some(pair) if pair.len() == 2 => {
            let hop = |v: &Value| match v {
                Value::Null => Ok(None),
                Value::String(s) => Ok(Some(s.clone())),
                _ => Err(invalid_target()),
            };
            (hop(&pair[0])?, hop(&pair[1])?)
        }
        _ => return Err(invalid_target()),
    };

    let raw = string_list(required(item, "network-list", &name)?, "network-list", &name)?;
    let networks = raw
        .iter()
        .map(|text| {
            parse_public_network(text).ok_or_else(|| {
                reject(format!(
                    "Some element in \"network-list\" is invalid for facility \"{}\".",
                    name
                ))
            })
        })
        .collect::<RouterResult<Vec<_>>>()?;

    Ok(Facility::Gateway {
        name,
        target,
        networks,
    })
}

/// A network given as `a.b.c.d[/len]` or `a.b.c.d/m.m.m.m` with no host
/// bits set, outside every reserved range
pub fn parse_public_network(text: &str) -> Option<Ipv4Net> {
    let host = text.split_once('/').map_or(text, |(host, _)| host);
    if !is_dotted_decimal(host) {
        return None;
    }

    let net = normalize_prefix(text).ok()?;
    if net.network() != host.parse::<Ipv4Addr>().ok()? {
        return None;
    }

    let overlaps = RESERVED_NETWORKS
        .iter()
        .any(|reserved| reserved.contains(&net) || net.contains(reserved));
    (!overlaps).then_some(net)
}
