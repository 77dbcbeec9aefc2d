//! Router D-Bus interface
//!
//! - **Service Name**: `org.crrouter.Router`
//! - **Object Path**: `/org/crrouter/Router`
//! - **Interface**: `org.crrouter.Router`
//!
//! ```bash
//! dbus-send --system --print-reply \
//!   --dest=org.crrouter.Router /org/crrouter/Router \
//!   org.crrouter.Router.GetRouterInfo
//! ```
//!
//! The interface object holds no router state. Each call is forwarded to
//! the daemon loop as a [`ServiceRequest`] and answered from there.

use crate::daemon::ServiceRequest;
use crate::error::{RouterError, RouterResult};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zbus::message::Header;
use zbus::names::BusName;
use zbus::{fdo, interface, Connection};

pub const ROUTER_DBUS_SERVICE: &str = "org.crrouter.Router";
pub const ROUTER_DBUS_PATH: &str = "/org/crrouter/Router";

/// Map a daemon error onto the D-Bus error a caller sees
pub fn to_fdo_error(error: RouterError) -> fdo::Error {
    if error.is_rejection() {
        fdo::Error::InvalidArgs(error.to_string())
    } else {
        fdo::Error::Failed(error.to_string())
    }
}

fn parse_json(what: &str, text: &str) -> fdo::Result<Value> {
    serde_json::from_str(text).map_err(|e| fdo::Error::InvalidArgs(format!("Invalid {} JSON: {}", what, e)))
}

fn sender_of(header: &Header<'_>) -> Option<String> {
    header.sender().map(|name| name.to_string())
}

/// `org.crrouter.Router` object
#[derive(Clone)]
pub struct RouterService {
    requests: mpsc::Sender<ServiceRequest>,
}

impl RouterService {
    pub fn new(requests: mpsc::Sender<ServiceRequest>) -> Self {
        Self { requests }
    }

    async fn submit(&self, request: ServiceRequest) -> fdo::Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| fdo::Error::Failed("Router is shutting down".to_string()))
    }

    /// Send a mutation and wait for its outcome
    async fn call<F>(&self, build: F) -> fdo::Result<()>
    where
        F: FnOnce(oneshot::Sender<RouterResult<()>>) -> ServiceRequest,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx)).await?;
        rx.await
            .map_err(|_| fdo::Error::Failed("Router dropped the request".to_string()))?
            .map_err(to_fdo_error)
    }
}

#[interface(name = "org.crrouter.Router")]
impl RouterService {
    /// Router status as a JSON document
    async fn get_router_info(&self) -> fdo::Result<String> {
        let (tx, rx) = oneshot::channel();
        self.submit(ServiceRequest::GetRouterInfo { reply: tx }).await?;
        let info = rx
            .await
            .map_err(|_| fdo::Error::Failed("Router dropped the request".to_string()))?;
        serde_json::to_string(&info).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    async fn add_wan_service(
        &self,
        #[zbus(header)] header: Header<'_>,
        name: &str,
        json: &str,
    ) -> fdo::Result<()> {
        let service = parse_json("WAN service", json)?;
        let owner = sender_of(&header);
        debug!("AddWanService {} from {:?}", name, owner);
        self.call(|reply| ServiceRequest::AddWanService {
            name: name.to_string(),
            service,
            owner,
            reply,
        })
        .await
    }

    async fn remove_wan_service(&self, name: &str) -> fdo::Result<()> {
        self.call(|reply| ServiceRequest::RemoveWanService {
            name: name.to_string(),
            reply,
        })
        .await
    }

    async fn add_traffic_facility_group(
        &self,
        #[zbus(header)] header: Header<'_>,
        name: &str,
        priority: i32,
        json: &str,
    ) -> fdo::Result<()> {
        let group = parse_json("facility group", json)?;
        let owner = sender_of(&header);
        debug!("AddTrafficFacilityGroup {} from {:?}", name, owner);
        self.call(|reply| ServiceRequest::AddTfacGroup {
            name: name.to_string(),
            priority,
            group,
            owner,
            reply,
        })
        .await
    }

    async fn change_traffic_facility_group(&self, name: &str, json: &str) -> fdo::Result<()> {
        let group = parse_json("facility group", json)?;
        self.call(|reply| ServiceRequest::ChangeTfacGroup {
            name: name.to_string(),
            group,
            reply,
        })
        .await
    }

    async fn remove_traffic_facility_group(&self, name: &str) -> fdo::Result<()> {
        self.call(|reply| ServiceRequest::RemoveTfacGroup {
            name: name.to_string(),
            reply,
        })
        .await
    }
}

/// Register the router object and claim the well-known name on the system
/// bus. The returned connection must be kept alive.
pub async fn serve(requests: mpsc::Sender<ServiceRequest>) -> RouterResult<Connection> {
    info!("Starting router D-Bus service");

    let connection = Connection::system()
        .await
        .map_err(|e| RouterError::ServiceError(format!("Failed to connect to D-Bus: {}", e)))?;

    connection
        .object_server()
        .at(ROUTER_DBUS_PATH, RouterService::new(requests.clone()))
        .await
        .map_err(|e| RouterError::ServiceError(format!("Failed to register router object: {}", e)))?;

    connection
        .request_name(ROUTER_DBUS_SERVICE)
        .await
        .map_err(|e| RouterError::ServiceError(format!("Failed to acquire {}: {}", ROUTER_DBUS_SERVICE, e)))?;

    info!("Registered {} at {}", ROUTER_DBUS_SERVICE, ROUTER_DBUS_PATH);

    let watched = connection.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_vanished_callers(watched, requests).await {
            warn!("Caller watcher stopped: {}", e);
        }
    });

    Ok(connection)
}

/// Report unique bus names that lost their owner so the entries they
/// created can be dropped.
async fn watch_vanished_callers(
    connection: Connection,
    requests: mpsc::Sender<ServiceRequest>,
) -> RouterResult<()> {
    let proxy = fdo::DBusProxy::new(&connection).await?;
    let mut changes = proxy.receive_name_owner_changed().await?;

    while let Some(signal) = changes.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                debug!("Unparsable NameOwnerChanged: {}", e);
                continue;
            }
        };
        let BusName::Unique(name) = args.name() else {
            continue;
        };
        if args.new_owner().is_some() {
            continue;
        }
        let owner = name.to_string();
        if requests.send(ServiceRequest::OwnerVanished { owner }).await.is_err() {
            break;
        }
    }
    Ok(())
}
