//! Sub-host NAT
//!
//! - pool: free NAT addresses of the active uplink
//! - rules: DNAT/SNAT rule pairs in the daemon's nft table
//! - allocator: client mappings and their binding to pool addresses

pub mod pool;
pub mod rules;
pub mod allocator;

pub use pool::AddressPool;
pub use rules::NatRuleStore;
pub use allocator::{NatAllocator, NatMapping, SourceId, UplinkInfo};
