//! Configuration management for crrouterd

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{RouterError, RouterResult};

/// Default location of the daemon configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/crrouter/routerd.toml";

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub interfaces: InterfaceSettings,
    #[serde(default)]
    pub firewall: FirewallSettings,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub prefix_pool: PrefixPoolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Persistent configuration (plugin configs live here)
    #[serde(default = "default_etc_dir")]
    pub etc_dir: PathBuf,
    /// Scratch directory, recreated empty on every start
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// Persistent state (uuid, plugin data)
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
    /// Runtime directory holding the PID file
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Seconds between two interface polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Name prefixes of physical interfaces handed out to plugins
    #[serde(default = "default_interface_prefixes")]
    pub prefixes: Vec<String>,
    /// Bridge that LAN interface plugins attach claimed interfaces to
    #[serde(default = "default_bridge")]
    pub default_bridge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSettings {
    /// nftables table owned by the daemon
    #[serde(default = "default_nft_table")]
    pub table: String,
    /// nft binary
    #[serde(default = "default_nft_binary")]
    pub nft_binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// dnsmasq binary used as the local forwarder
    #[serde(default = "default_dnsmasq_binary")]
    pub dnsmasq_binary: PathBuf,
    /// Domain name announced to clients
    #[serde(default)]
    pub dns_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Extra directories searched for plugin modules
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixPoolSettings {
    /// Networks that plugin subnets are carved from, in preference order
    #[serde(default = "default_pool_ranges")]
    pub ranges: Vec<String>,
}

fn default_etc_dir() -> PathBuf {
    PathBuf::from("/etc/crrouter/routerd")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp/crrouterd")
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/crrouter/routerd")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/crrouter/routerd")
}

fn default_poll_interval() -> u64 {
    10
}

fn default_interface_prefixes() -> Vec<String> {
    vec!["en".to_string(), "eth".to_string(), "wl".to_string()]
}

fn default_bridge() -> String {
    "br-lan".to_string()
}

fn default_nft_table() -> String {
    "crrouter".to_string()
}

fn default_nft_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/nft")
}

fn default_dnsmasq_binary() -> PathBuf {
    PathBuf::from("/usr/sbin/dnsmasq")
}

fn default_pool_ranges() -> Vec<String> {
    vec![
        "10.0.0.0/8".to_string(),
        "172.16.0.0/12".to_string(),
        "192.168.0.0/16".to_string(),
    ]
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            etc_dir: default_etc_dir(),
            tmp_dir: default_tmp_dir(),
            var_dir: default_var_dir(),
            run_dir: default_run_dir(),
        }
    }
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            prefixes: default_interface_prefixes(),
            default_bridge: default_bridge(),
        }
    }
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            table: default_nft_table(),
            nft_binary: default_nft_binary(),
        }
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            dnsmasq_binary: default_dnsmasq_binary(),
            dns_name: None,
        }
    }
}

impl Default for PrefixPoolSettings {
    fn default() -> Self {
        Self {
            ranges: default_pool_ranges(),
        }
    }
}

impl InterfaceSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl ConfigPaths {
    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join("crrouterd.pid")
    }

    pub fn uuid_file(&self) -> PathBuf {
        self.var_dir.join("uuid")
    }

    pub fn prefix_pool_file(&self) -> PathBuf {
        self.var_dir.join("prefix-pool.json")
    }

    /// resolv.conf consumed by the local DNS forwarder
    pub fn own_resolv_conf(&self) -> PathBuf {
        self.tmp_dir.join("resolv.conf")
    }
}

impl RouterConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> RouterResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RouterError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RouterError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> RouterResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> RouterResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RouterError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| RouterError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}
