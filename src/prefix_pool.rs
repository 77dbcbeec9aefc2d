//! Persistent prefix pool
//!
//! LAN and VPN plugins draw their subnets from one shared pool so that no
//! two of them pick overlapping networks. Allocations are keyed by a name
//! chosen by the caller and survive restarts in `<var>/prefix-pool.json`.

use crate::error::{RouterError, RouterResult};
use crate::routing::normalize_prefix;
use ipnet::Ipv4Net;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The pool as handed to plugins
pub type SharedPrefixPool = Arc<Mutex<PrefixPool>>;

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[derive(Debug)]
pub struct PrefixPool {
    file: PathBuf,
    ranges: Vec<Ipv4Net>,
    allocations: BTreeMap<String, Ipv4Net>,
}

impl PrefixPool {
    /// Empty pool over `ranges`, persisted to `file` on first change
    pub fn new(file: PathBuf, ranges: Vec<Ipv4Net>) -> Self {
        Self {
            file,
            ranges,
            allocations: BTreeMap::new(),
        }
    }

    /// Load the pool stored in `file`. A missing or blank file is an empty
    /// pool. `ranges` are the networks new prefixes are carved from.
    pub async fn load(file: PathBuf, ranges: &[String]) -> RouterResult<Self> {
        let ranges = ranges
            .iter()
            .map(|range| normalize_prefix(range))
            .collect::<RouterResult<Vec<_>>>()
            .map_err(|e| RouterError::ConfigError(format!("Invalid prefix pool range: {}", e)))?;

        let allocations = match fs::read_to_string(&file).await {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => parse_allocations(&file, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Prefix pool loaded, {} allocation(s)", allocations.len());
        Ok(Self {
            file,
            ranges,
            allocations,
        })
    }

    pub fn into_shared(self) -> SharedPrefixPool {
        Arc::new(Mutex::new(self))
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn get(&self, key: &str) -> Option<Ipv4Net> {
        self.allocations.get(key).copied()
    }

    pub fn allocations(&self) -> &BTreeMap<String, Ipv4Net> {
        &self.allocations
    }

    /// Whether `prefix` overlaps no allocation except the one under `key`
    pub fn is_free(&self, prefix: &Ipv4Net, key: Option<&str>) -> bool {
        !self
            .allocations
            .iter()
            .any(|(owner, used)| Some(owner.as_str()) != key && overlaps(used, prefix))
    }

    /// Prefix of length `prefix_len` for `key`.
    ///
    /// An existing allocation of the same length is returned unchanged. One
    /// of another length is given up and a new prefix is carved from the
    /// first range with room.
    pub async fn allocate(&mut self, key: &str, prefix_len: u8) -> RouterResult<Ipv4Net> {
        if let Some(current) = self.get(key) {
            if current.prefix_len() == prefix_len {
                return Ok(current);
            }
        }

        let candidate = self
            .ranges
            .iter()
            .filter(|range| range.prefix_len() <= prefix_len)
            .filter_map(|range| range.subnets(prefix_len).ok())
            .flatten()
            .find(|prefix| self.is_free(prefix, Some(key)))
            .ok_or_else(|| {
                RouterError::PoolExhausted(format!("No free /{} prefix for {}", prefix_len, key))
            })?;

        self.store(key, candidate).await?;
        Ok(candidate)
    }

    /// Claim a specific prefix for `key`
    pub async fn reserve(&mut self, key: &str, prefix: &str) -> RouterResult<Ipv4Net> {
        let prefix = normalize_prefix(prefix)?;
        if !self.is_free(&prefix, Some(key)) {
            return Err(RouterError::AlreadyExists(format!(
                "Prefix {} overlaps an existing allocation",
                prefix
            )));
        }
        self.store(key, prefix).await?;
        Ok(prefix)
    }

    /// Give back the prefix held by `key`
    pub async fn release(&mut self, key: &str) -> RouterResult<Option<Ipv4Net>> {
        let released = self.allocations.remove(key);
        if let Some(prefix) = released {
            self.persist().await?;
            info!("Prefix {} released by {}", prefix, key);
        }
        Ok(released)
    }

    pub fn snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .allocations
            .iter()
            .map(|(key, prefix)| (key.clone(), json!(prefix.to_string())))
            .collect();
        Value::Object(map)
    }

    async fn store(&mut self, key: &str, prefix: Ipv4Net) -> RouterResult<()> {
        let previous = self.allocations.insert(key.to_string(), prefix);
        if let Err(e) = self.persist().await {
            match previous {
                Some(old) => self.allocations.insert(key.to_string(), old),
                None => self.allocations.remove(key),
            };
            return Err(e);
        }
        info!("Prefix {} allocated to {}", prefix, key);
        Ok(())
    }

    /// Write through a temporary file so a crash never leaves half a pool
    async fn persist(&self) -> RouterResult<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = self.file.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &self.file).await?;
        debug!("Prefix pool saved to {}", self.file.display());
        Ok(())
    }
}

fn parse_allocations(file: &Path, contents: &str) -> RouterResult<BTreeMap<String, Ipv4Net>> {
    let raw: BTreeMap<String, String> = serde_json::from_str(contents).map_err(|e| {
        RouterError::ConfigError(format!("Invalid JSON in {}: {}", file.display(), e))
    })?;
    raw.into_iter()
        .map(|(key, prefix)| {
            normalize_prefix(&prefix)
                .map(|net| (key, net))
                .map_err(|e| RouterError::ConfigError(format!("{}: {}", file.display(), e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ranges() -> Vec<String> {
        vec!["10.128.0.0/16".to_string(), "172.20.0.0/24".to_string()]
    }

    fn net(text: &str) -> Ipv4Net {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_allocations_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let mut pool = PrefixPool::load(dir.path().join("prefix-pool.json"), &ranges())
            .await
            .unwrap();

        let lan = pool.allocate("lif-ports", 24).await.unwrap();
        let vpn = pool.allocate("vpns-wg", 24).await.unwrap();
        assert_eq!(lan, net("10.128.0.0/24"));
        assert_eq!(vpn, net("10.128.1.0/24"));

        // Stable for the same key and length
        assert_eq!(pool.allocate("lif-ports", 24).await.unwrap(), lan);

        let wide = pool.allocate("vpns-wg", 23).await.unwrap();
        assert_eq!(wide, net("10.128.2.0/23"));
        assert!(pool.is_free(&net("10.128.1.0/24"), None));
    }

    #[tokio::test]
    async fn test_persisted_across_loads() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("var").join("prefix-pool.json");

        let mut pool = PrefixPool::load(file.clone(), &ranges()).await.unwrap();
        pool.reserve("lif-ports", "10.128.5.0/255.255.255.0").await.unwrap();
        pool.allocate("vpns-wg", 24).await.unwrap();

        let reloaded = PrefixPool::load(file.clone(), &ranges()).await.unwrap();
        assert_eq!(reloaded.get("lif-ports"), Some(net("10.128.5.0/24")));
        assert_eq!(reloaded.get("vpns-wg"), Some(net("10.128.0.0/24")));
        assert!(!dir.path().join("var/prefix-pool.json.tmp").exists());

        let mut reloaded = reloaded;
        assert_eq!(reloaded.release("vpns-wg").await.unwrap(), Some(net("10.128.0.0/24")));
        assert_eq!(reloaded.release("vpns-wg").await.unwrap(), None);
        let again = PrefixPool::load(file, &ranges()).await.unwrap();
        assert_eq!(again.allocations().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_and_exhaustion() {
        let dir = TempDir::new().unwrap();
        let mut pool = PrefixPool::load(dir.path().join("pool.json"), &["172.20.0.0/24".to_string()])
            .await
            .unwrap();

        pool.reserve("a", "172.20.0.0/25").await.unwrap();
        let err = pool.reserve("b", "172.20.0.64/26").await.unwrap_err();
        assert!(err.is_rejection());

        assert_eq!(pool.allocate("b", 25).await.unwrap(), net("172.20.0.128/25"));
        assert!(matches!(
            pool.allocate("c", 26).await,
            Err(RouterError::PoolExhausted(_))
        ));
        // Larger than any range
        assert!(pool.allocate("d", 16).await.is_err());
    }

    #[tokio::test]
    async fn test_blank_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("prefix-pool.json");

        std::fs::write(&file, "  \n").unwrap();
        assert!(PrefixPool::load(file.clone(), &ranges()).await.unwrap().allocations().is_empty());

        std::fs::write(&file, r#"{"lif-ports": "not-a-prefix"}"#).unwrap();
        assert!(matches!(
            PrefixPool::load(file.clone(), &ranges()).await,
            Err(RouterError::ConfigError(_))
        ));

        std::fs::write(&file, "[1, 2").unwrap();
        assert!(PrefixPool::load(file, &ranges()).await.is_err());
    }
}
