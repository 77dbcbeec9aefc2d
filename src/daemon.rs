//! Router daemon
//!
//! All router state lives in one [`Daemon`] value driven by a single task.
//! Plugins reach it through [`RouterHandle`] events, the IPC service through
//! [`ServiceRequest`] messages answered on oneshot channels. Interface
//! polling runs off a deadline inside the same loop, so no state is ever
//! shared between tasks.

use crate::cascade::CascadeEventRouter;
use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};
use crate::events::{RouterEvent, RouterHandle};
use crate::identity::load_or_create_uuid;
use crate::interface_watcher::{InterfaceWatcher, LinkSource, SysfsLinkSource};
use crate::nat::{NatAllocator, NatRuleStore, SourceId};
use crate::nft::{CommandNftables, Nftables};
use crate::plugin::{
    ManagerRegistry, PluginCapability, PluginConfigStore, PluginContext, PluginHub,
    PluginLifecycleManager, RouterPlugin, TRAFFIC_CATEGORY,
};
use crate::prefix_pool::{PrefixPool, SharedPrefixPool};
use crate::routing::{NetlinkRouteTable, RouteReconciler, RouteTable};
use crate::traffic::{DnsForwarder, TrafficManager};
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REQUEST_QUEUE: usize = 32;

/// Reply channel for IPC mutations
pub type Reply = oneshot::Sender<RouterResult<()>>;

/// Requests from the IPC service
#[derive(Debug)]
pub enum ServiceRequest {
    GetRouterInfo {
        reply: oneshot::Sender<Value>,
    },
    AddWanService {
        name: String,
        service: Value,
        owner: Option<String>,
        reply: Reply,
    },
    RemoveWanService {
        name: String,
        reply: Reply,
    },
    AddTfacGroup {
        name: String,
        priority: i32,
        group: Value,
        owner: Option<String>,
        reply: Reply,
    },
    ChangeTfacGroup {
        name: String,
        group: Value,
        reply: Reply,
    },
    RemoveTfacGroup {
        name: String,
        reply: Reply,
    },
    /// An IPC caller left the bus
    OwnerVanished {
        owner: String,
    },
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Stop,
    Restart,
}

/// Kernel and process boundaries the daemon drives
pub struct Seams {
    pub nft: Arc<dyn Nftables>,
    pub routes: Arc<dyn RouteTable>,
    pub links: Arc<dyn LinkSource>,
    pub forwarder: Option<DnsForwarder>,
}

impl Seams {
    /// The real system: `nft`, rtnetlink, sysfs and dnsmasq
    pub fn system(config: &RouterConfig) -> Self {
        Self {
            nft: Arc::new(CommandNftables::new(
                config.firewall.nft_binary.clone(),
                config.firewall.table.clone(),
            )),
            routes: Arc::new(NetlinkRouteTable::new()),
            links: Arc::new(SysfsLinkSource::new()),
            forwarder: Some(DnsForwarder::new(
                config.dns.dnsmasq_binary.clone(),
                &config.paths.tmp_dir,
                config.paths.own_resolv_conf(),
            )),
        }
    }
}

pub struct Daemon {
    config: RouterConfig,
    uuid: Uuid,
    nft: Arc<dyn Nftables>,
    traffic: TrafficManager,
    plugins: PluginLifecycleManager,
    managers: ManagerRegistry,
    prefix_pool: SharedPrefixPool,
    watcher: InterfaceWatcher,
    cascade: CascadeEventRouter,
    handle: RouterHandle,
    events: mpsc::UnboundedReceiver<RouterEvent>,
    requests_tx: mpsc::Sender<ServiceRequest>,
    requests: mpsc::Receiver<ServiceRequest>,
}

impl Daemon {
    /// Bring the router up: directories, identity, prefix pool, PID file,
    /// nft table, DNS forwarder, traffic plugins and the other plugins.
    ///
    /// A failure after the nft table exists tears down whatever was set up
    /// before returning the error.
    pub async fn start(config: RouterConfig, seams: Seams, hub: &mut PluginHub) -> RouterResult<Self> {
        prepare_dirs(&config).await?;

        let (uuid, _) = load_or_create_uuid(&config.paths.uuid_file()).await?;
        let prefix_pool =
            PrefixPool::load(config.paths.prefix_pool_file(), &config.prefix_pool.ranges).await?;
        write_pid_file(&config.paths.pid_file()).await?;

        if let Err(e) = seams.nft.create_table().await {
            error!("Failed to create nft table {}: {}", config.firewall.table, e);
            remove_pid_file(&config.paths.pid_file()).await;
            return Err(e);
        }

        let mut traffic = TrafficManager::new(seams.nft.clone(), config.paths.etc_dir.clone());
        if let Some(forwarder) = seams.forwarder {
            traffic = traffic.with_forwarder(forwarder);
        }

        let (handle, events) = RouterHandle::channel();
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);

        let cascade = CascadeEventRouter::new(
            uuid.to_string(),
            RouteReconciler::new(seams.routes),
            NatAllocator::new(NatRuleStore::new(seams.nft.clone())),
        );
        let watcher = InterfaceWatcher::new(
            seams.links,
            config.interfaces.prefixes.clone(),
            config.interfaces.default_bridge.clone(),
            config.interfaces.poll_interval(),
        );
        let plugins = PluginLifecycleManager::new(PluginConfigStore::new(config.paths.etc_dir.clone()));

        let mut daemon = Self {
            config,
            uuid,
            nft: seams.nft,
            traffic,
            plugins,
            managers: ManagerRegistry::new(),
            prefix_pool: prefix_pool.into_shared(),
            watcher,
            cascade,
            handle,
            events,
            requests_tx,
            requests,
        };

        if let Err(e) = daemon.bring_up(hub).await {
            error!("Startup failed: {}", e);
            daemon.shutdown().await;
            return Err(e);
        }
        Ok(daemon)
    }

    async fn bring_up(&mut self, hub: &mut PluginHub) -> RouterResult<()> {
        // Upstream servers are filled in by the WAN plugin
        fs::write(self.config.paths.own_resolv_conf(), "").await?;
        self.traffic.start().await?;

        let ctx = self.plugin_context();
        let (traffic, others): (Vec<Box<dyn RouterPlugin>>, Vec<_>) = hub
            .discover()
            .await
            .into_iter()
            .partition(|plugin| plugin.descriptor().category == TRAFFIC_CATEGORY);
        self.traffic.activate_plugins(traffic, &ctx).await?;
        self.plugins.activate_all(others, &ctx).await
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Handle given to plugins
    pub fn router_handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Sender for the IPC service
    pub fn requests(&self) -> mpsc::Sender<ServiceRequest> {
        self.requests_tx.clone()
    }

    pub fn plugins(&self) -> &PluginLifecycleManager {
        &self.plugins
    }

    pub fn traffic(&self) -> &TrafficManager {
        &self.traffic
    }

    pub fn cascade(&self) -> &CascadeEventRouter {
        &self.cascade
    }

    pub fn watcher(&self) -> &InterfaceWatcher {
        &self.watcher
    }

    pub fn managers(&self) -> &ManagerRegistry {
        &self.managers
    }

    pub fn prefix_pool(&self) -> SharedPrefixPool {
        self.prefix_pool.clone()
    }

    fn plugin_context(&self) -> PluginContext {
        PluginContext {
            uuid: self.uuid,
            etc_dir: self.config.paths.etc_dir.clone(),
            tmp_dir: self.config.paths.tmp_dir.clone(),
            var_dir: self.config.paths.var_dir.clone(),
            default_bridge: self.config.interfaces.default_bridge.clone(),
            router: self.handle.clone(),
            managers: self.managers.clone(),
            prefix_pool: self.prefix_pool.clone(),
        }
    }

    /// Serve events, requests and interface polls until `until` resolves.
    ///
    /// The first interface poll runs immediately.
    pub async fn run<F>(&mut self, until: F) -> Exit
    where
        F: Future<Output = Exit>,
    {
        tokio::pin!(until);
        let mut next_poll = Instant::now();
        info!("Router {} running", self.uuid);

        loop {
            tokio::select! {
                exit = &mut until => {
                    info!("Leaving main loop ({:?})", exit);
                    return exit;
                }
                Some(request) = self.requests.recv() => {
                    self.handle_request(request).await;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
                _ = sleep_until(next_poll) => {
                    self.poll_interfaces().await;
                    next_poll = Instant::now() + self.watcher.interval();
                }
            }
        }
    }

    pub async fn poll_interfaces(&mut self) {
        let report = self.watcher.tick(&mut self.plugins).await;
        if !report.appeared.is_empty() || !report.disappeared.is_empty() {
            debug!(
                "Interface pass: {} appeared, {} disappeared",
                report.appeared.len(),
                report.disappeared.len()
            );
        }
    }

    /// Apply one plugin event. Failures are logged; the loop keeps going.
    pub async fn handle_event(&mut self, event: RouterEvent) {
        let result = match event {
            RouterEvent::Cascade(event) => self.cascade.handle(event).await,
            RouterEvent::ClientChange { client_ip, original_ip } => {
                self.cascade
                    .nat_mut()
                    .on_client_change(SourceId::Local, client_ip, original_ip)
                    .await
            }
            RouterEvent::ClientRemove { client_ip } => {
                self.cascade.nat_mut().on_client_remove(&SourceId::Local, client_ip).await;
                Ok(())
            }
            RouterEvent::LocalPrefixes(prefixes) => {
                self.cascade.set_local_prefixes(prefixes);
                Ok(())
            }
            RouterEvent::WanUp { interface } => self.traffic.on_wan_up(&interface).await,
            RouterEvent::WanDown => {
                self.traffic.on_wan_down().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Event handling failed: {}", e);
        }
    }

    /// Answer one IPC request
    pub async fn handle_request(&mut self, request: ServiceRequest) {
        match request {
            ServiceRequest::GetRouterInfo { reply } => {
                let _ = reply.send(self.router_info());
            }
            ServiceRequest::AddWanService { name, service, owner, reply } => {
                let result = self.traffic.add_wan_service(&name, service, owner.as_deref());
                respond(reply, "AddWanService", result);
            }
            ServiceRequest::RemoveWanService { name, reply } => {
                let result = self.traffic.remove_wan_service(&name);
                respond(reply, "RemoveWanService", result);
            }
            ServiceRequest::AddTfacGroup { name, priority, group, owner, reply } => {
                let result = self.traffic.add_tfac_group(&name, priority, &group, owner.as_deref());
                respond(reply, "AddTrafficFacilityGroup", result);
            }
            ServiceRequest::ChangeTfacGroup { name, group, reply } => {
                let result = self.traffic.change_tfac_group(&name, &group);
                respond(reply, "ChangeTrafficFacilityGroup", result);
            }
            ServiceRequest::RemoveTfacGroup { name, reply } => {
                let result = self.traffic.remove_tfac_group(&name);
                respond(reply, "RemoveTrafficFacilityGroup", result);
            }
            ServiceRequest::OwnerVanished { owner } => {
                let removed = self.traffic.remove_owned_by(&owner);
                if removed > 0 {
                    info!("Removed {} entr(ies) owned by vanished caller {}", removed, owner);
                }
            }
        }
    }

    /// Status report for `GetRouterInfo`
    pub fn router_info(&self) -> Value {
        let wconn = self
            .plugins
            .names_with(PluginCapability::WanConnection)
            .into_iter()
            .next()
            .map(|name| {
                json!({
                    "name": name,
                    "interface": self.traffic.masquerade_interface(),
                })
            });

        let mut info = json!({
            "uuid": self.uuid.to_string(),
            "hostname": hostname(),
            "wconn-plugin": wconn,
            "default-bridge": self.config.interfaces.default_bridge,
            "lif-plugin": self.plugins.names_with(PluginCapability::LanInterface),
            "vpns-plugin": self.plugins.names_with(PluginCapability::VpnServer),
            "traffic-plugin": self.traffic.plugin_names(),
            "wan-service": self.traffic.wan_service_names(),
            "tfac-group": self.traffic.tfac_group_snapshot(),
            "interfaces": self.watcher.snapshot(),
            "nat": self.cascade.nat().snapshot(),
            "routes": self.cascade.routes().snapshot(),
            "cascade": self.cascade.snapshot(),
        });

        if let Value::Object(map) = &mut info {
            if let Some(dns_name) = &self.config.dns.dns_name {
                map.insert("dns-name".to_string(), json!(dns_name));
            }
            if let Some(port) = self.traffic.dns_port() {
                map.insert("dns-port".to_string(), json!(port));
            }
            // Held only for the moment a plugin allocates
            if let Ok(pool) = self.prefix_pool.try_lock() {
                map.insert("prefix-pool".to_string(), pool.snapshot());
            }
            map.extend(self.traffic.plugin_info());
            map.extend(self.plugins.router_info());
        }
        info
    }

    /// Tear everything down in reverse startup order. Every step runs even
    /// when an earlier one failed.
    pub async fn shutdown(&mut self) {
        info!("Shutting down");

        let failures = self.plugins.dispose_all().await;
        if failures > 0 {
            warn!("{} plugin(s) failed to dispose", failures);
        }

        self.cascade.shutdown().await;
        self.traffic.dispose().await;

        if let Err(e) = self.nft.force_delete_table().await {
            error!("Failed to delete nft table {}: {}", self.config.firewall.table, e);
        }

        remove_pid_file(&self.config.paths.pid_file()).await;
        if let Err(e) = fs::remove_dir_all(&self.config.paths.tmp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.config.paths.tmp_dir.display(), e);
            }
        }

        info!("Shutdown complete");
    }
}

fn respond(reply: Reply, method: &str, result: RouterResult<()>) {
    match &result {
        Ok(()) => debug!("{} succeeded", method),
        Err(e) if e.is_rejection() => info!("{} rejected: {}", method, e),
        Err(e) => error!("{} failed: {}", method, e),
    }
    if reply.send(result).is_err() {
        warn!("{} caller went away before the reply", method);
    }
}

/// Var dir is kept, tmp and run dirs start out empty
async fn prepare_dirs(config: &RouterConfig) -> RouterResult<()> {
    let paths = &config.paths;
    fs::create_dir_all(&paths.var_dir).await?;
    for dir in [&paths.tmp_dir, &paths.run_dir] {
        match fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

async fn write_pid_file(path: &Path) -> RouterResult<()> {
    fs::write(path, format!("{}\n", std::process::id()))
        .await
        .map_err(|e| RouterError::ServiceError(format!("Failed to write PID file {}: {}", path.display(), e)))
}

async fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for writes of its full length
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}
