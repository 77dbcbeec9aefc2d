//! Local DNS forwarder (dnsmasq)
//!
//! The forwarder listens on loopback on the first free port from 10000 up
//! and reads its upstream servers from the daemon's private resolv.conf.

use crate::error::{RouterError, RouterResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const FIRST_PORT: u16 = 10000;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// dnsmasq controller
pub struct DnsForwarder {
    binary: PathBuf,
    config_file: PathBuf,
    pid_file: PathBuf,
    resolv_file: PathBuf,
    port: Option<u16>,
    child: Option<Child>,
}

impl DnsForwarder {
    pub fn new(binary: PathBuf, tmp_dir: &Path, resolv_file: PathBuf) -> Self {
        Self {
            binary,
            config_file: tmp_dir.join("l2-dnsmasq.conf"),
            pid_file: tmp_dir.join("l2-dnsmasq.pid"),
            resolv_file,
            port: None,
            child: None,
        }
    }

    /// Port the forwarder listens on, while running
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Generate dnsmasq configuration
    pub fn render_config(&self) -> String {
        let mut config = String::new();
        config.push_str("strict-order\n");
        config.push_str("bind-interfaces\n");
        config.push_str("interface=lo\n");
        config.push_str("user=root\n");
        config.push_str("group=root\n");
        config.push('\n');
        config.push_str("domain-needed\n");
        config.push_str("bogus-priv\n");
        config.push_str("no-hosts\n");
        config.push_str(&format!("resolv-file={}\n", self.resolv_file.display()));
        config
    }

    pub async fn start(&mut self) -> RouterResult<()> {
        if self.child.is_some() {
            return Err(RouterError::AlreadyExists("DNS forwarder already running".to_string()));
        }

        let port = find_free_port(FIRST_PORT).await?;
        fs::write(&self.config_file, self.render_config()).await?;

        let child = Command::new(&self.binary)
            .arg("--keep-in-foreground")
            .arg(format!("--port={}", port))
            .arg(format!("--conf-file={}", self.config_file.display()))
            .arg(format!("--pid-file={}", self.pid_file.display()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RouterError::CommandFailed {
                cmd: format!("{} --port={}", self.binary.display(), port),
                code: None,
                stderr: e.to_string(),
            })?;

        info!("DNS forwarder started on port {} (pid {:?})", port, child.id());
        self.port = Some(port);
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the forwarder and remove its files
    pub async fn stop(&mut self) -> RouterResult<()> {
        let result = match self.child.take() {
            Some(child) => terminate(child).await,
            None => Ok(()),
        };
        self.port = None;

        for path in [&self.pid_file, &self.config_file] {
            if let Err(e) = fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        if result.is_ok() {
            info!("DNS forwarder stopped");
        }
        result
    }
}

async fn terminate(mut child: Child) -> RouterResult<()> {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }

    match timeout(STOP_TIMEOUT, child.wait()).await {
        Ok(status) => {
            debug!("DNS forwarder exited: {:?}", status?);
            Ok(())
        }
        Err(_) => {
            child.kill().await?;
            Err(RouterError::Timeout("DNS forwarder did not stop, killed".to_string()))
        }
    }
}

/// First TCP port from `start` that can be bound on all addresses
pub async fn find_free_port(start: u16) -> RouterResult<u16> {
    for port in start..=u16::MAX {
        if TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(RouterError::ServiceError(format!("No free TCP port at or above {}", start)))
}
