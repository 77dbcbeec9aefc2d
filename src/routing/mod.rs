//! Cascade route management
//!
//! - prefix: canonical CIDR conversion of advertised prefixes
//! - table: kernel route table boundary (rtnetlink)
//! - reconciler: per (gateway, router id) desired-state reconciliation

pub mod prefix;
pub mod table;
pub mod reconciler;

pub use prefix::{mask_to_prefix_len, normalize_prefix, normalize_prefixes};
pub use table::{NetlinkRouteTable, RouteTable};
pub use reconciler::{RouteDelta, RouteReconciler};
