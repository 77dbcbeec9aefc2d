//! Traffic management
//!
//! - facility: traffic facility group validation
//! - dns_forwarder: local dnsmasq instance
//! - manager: WAN services, facility groups, masquerade

pub mod facility;
pub mod dns_forwarder;
pub mod manager;

pub use facility::{validate_facility_group, Facility};
pub use dns_forwarder::DnsForwarder;
pub use manager::{TfacGroup, TrafficManager};
