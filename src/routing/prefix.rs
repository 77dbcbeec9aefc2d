//! Prefix normalization
//!
//! Peers advertise prefixes either as `a.b.c.d/len` or `a.b.c.d/m.m.m.m`.
//! Both forms are converted to a canonical [`Ipv4Net`] (host bits cleared)
//! before any comparison or kernel call.

use crate::error::{RouterError, RouterResult};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Convert a dotted netmask into a prefix length (`255.255.255.0` -> 24)
pub fn mask_to_prefix_len(mask: Ipv4Addr) -> RouterResult<u8> {
    ipnet::ipv4_mask_to_prefix(mask)
        .map_err(|_| RouterError::InvalidParameter(format!("Non-contiguous netmask: {}", mask)))
}

/// Parse one advertised prefix into canonical CIDR form
pub fn normalize_prefix(text: &str) -> RouterResult<Ipv4Net> {
    let text = text.trim();
    let (addr, len) = match text.split_once('/') {
        Some((addr, suffix)) => {
            let len = if suffix.contains('.') {
                let mask = suffix.parse::<Ipv4Addr>().map_err(|_| {
                    RouterError::InvalidParameter(format!("Invalid netmask in prefix '{}'", text))
                })?;
                mask_to_prefix_len(mask)?
            } else {
                suffix.parse::<u8>().map_err(|_| {
                    RouterError::InvalidParameter(format!("Invalid prefix length in '{}'", text))
                })?
            };
            (addr, len)
        }
        None => (text, 32),
    };

    let addr = addr
        .parse::<Ipv4Addr>()
        .map_err(|_| RouterError::InvalidParameter(format!("Invalid prefix address in '{}'", text)))?;

    Ipv4Net::new(addr, len)
        .map(|net| net.trunc())
        .map_err(|_| RouterError::InvalidParameter(format!("Prefix length out of range in '{}'", text)))
}

/// Normalize a whole advertised list. Duplicates in any representation
/// collapse into one entry.
pub fn normalize_prefixes<I, S>(items: I) -> RouterResult<BTreeSet<Ipv4Net>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| normalize_prefix(item.as_ref()))
        .collect()
}
