//! Events posted by plugins to the daemon loop

use crate::cascade::CascadeEvent;
use crate::error::{RouterError, RouterResult};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// Upstream or downstream peer activity
    Cascade(CascadeEvent),
    /// A local LAN client got or changed its address
    ClientChange {
        client_ip: Ipv4Addr,
        original_ip: Ipv4Addr,
    },
    ClientRemove {
        client_ip: Ipv4Addr,
    },
    /// Prefixes assigned to this node by its VPN uplink
    LocalPrefixes(BTreeSet<Ipv4Net>),
    WanUp {
        interface: String,
    },
    WanDown,
}

/// Cloneable sender plugins use to reach the daemon
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterEvent>,
}

impl RouterHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, event: RouterEvent) -> RouterResult<()> {
        self.tx
            .send(event)
            .map_err(|_| RouterError::InvalidState("Router event loop has stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_receive() {
        let (handle, mut rx) = RouterHandle::channel();
        handle.post(RouterEvent::WanUp { interface: "eth0".into() }).unwrap();
        assert_eq!(rx.recv().await, Some(RouterEvent::WanUp { interface: "eth0".into() }));

        drop(rx);
        assert!(handle.post(RouterEvent::WanDown).is_err());
    }
}
