//! nftables boundary
//!
//! The daemon owns one private table with three chains:
//!
//! - `fw`: filter, hook prerouting, priority 0
//! - `natpre`: nat, hook prerouting, priority 0
//! - `natpost`: nat, hook postrouting, priority 100
//!
//! The table is created at startup and force-deleted at shutdown. Every
//! invocation of the `nft` binary passes its arguments directly, never
//! through a shell.

use crate::error::{RouterError, RouterResult};
use crate::validation::sanitize_error_message;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const CHAIN_FILTER: &str = "fw";
pub const CHAIN_NAT_PRE: &str = "natpre";
pub const CHAIN_NAT_POST: &str = "natpost";

/// Chain name and its base-chain declaration
const CHAINS: [(&str, &str); 3] = [
    (CHAIN_FILTER, "{ type filter hook prerouting priority 0 ; }"),
    (CHAIN_NAT_PRE, "{ type nat hook prerouting priority 0 ; }"),
    (CHAIN_NAT_POST, "{ type nat hook postrouting priority 100 ; }"),
];

/// One rule as reported by a handle-annotated table listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub chain: String,
    pub rule: String,
    pub handle: u64,
}

/// Packet-filter table owned by the daemon
#[async_trait]
pub trait Nftables: Send + Sync {
    /// Create the table and its chains
    async fn create_table(&self) -> RouterResult<()>;

    /// Delete the table if it exists
    async fn force_delete_table(&self) -> RouterResult<()>;

    /// Append `rule` to `chain`. Returns the rule handle when the backend
    /// reports one.
    async fn add_rule(&self, chain: &str, rule: &str) -> RouterResult<Option<u64>>;

    async fn delete_rule(&self, chain: &str, handle: u64) -> RouterResult<()>;

    /// Every rule currently in the table, with handles
    async fn list_rules(&self) -> RouterResult<Vec<RuleEntry>>;
}

/// [`Nftables`] implementation driving the `nft` command line tool
pub struct CommandNftables {
    binary: PathBuf,
    table: String,
}

impl CommandNftables {
    pub fn new(binary: PathBuf, table: String) -> Self {
        Self { binary, table }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn nft(&self, args: &[&str]) -> RouterResult<String> {
        let cmd = format!("nft {}", args.join(" "));
        debug!("Running {}", cmd);

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RouterError::CommandFailed {
                cmd: cmd.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RouterError::CommandFailed {
                cmd,
                code: output.status.code(),
                stderr: sanitize_error_message(&stderr),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn table_exists(&self) -> RouterResult<bool> {
        let listing = self.nft(&["list", "tables", "ip"]).await?;
        Ok(listing
            .lines()
            .any(|line| line.split_whitespace().collect::<Vec<_>>() == ["table", "ip", self.table.as_str()]))
    }
}

#[async_trait]
impl Nftables for CommandNftables {
    async fn create_table(&self) -> RouterResult<()> {
        self.nft(&["add", "table", "ip", &self.table]).await?;
        for (chain, decl) in CHAINS {
            self.nft(&["add", "chain", "ip", &self.table, chain, decl]).await?;
        }
        info!("Created nftables table {}", self.table);
        Ok(())
    }

    async fn force_delete_table(&self) -> RouterResult<()> {
        if !self.table_exists().await? {
            debug!("nftables table {} not present", self.table);
            return Ok(());
        }
        self.nft(&["delete", "table", "ip", &self.table]).await?;
        info!("Deleted nftables table {}", self.table);
        Ok(())
    }

    async fn add_rule(&self, chain: &str, rule: &str) -> RouterResult<Option<u64>> {
        let out = self
            .nft(&["--echo", "--handle", "add", "rule", "ip", &self.table, chain, rule])
            .await?;
        let handle = out.lines().find_map(|line| split_handle(line).map(|(_, h)| h));
        if handle.is_none() {
            warn!("nft did not echo a handle for rule '{}'", rule);
        }
        debug!("Added rule to {}: {} (handle {:?})", chain, rule, handle);
        Ok(handle)
    }

    async fn delete_rule(&self, chain: &str, handle: u64) -> RouterResult<()> {
        let handle = handle.to_string();
        self.nft(&["delete", "rule", "ip", &self.table, chain, "handle", &handle])
            .await?;
        debug!("Deleted rule {} from {}", handle, chain);
        Ok(())
    }

    async fn list_rules(&self) -> RouterResult<Vec<RuleEntry>> {
        let listing = self
            .nft(&["--handle", "list", "table", "ip", &self.table])
            .await?;
        Ok(parse_rule_listing(&listing))
    }
}

/// Split `<rule> # handle <n>` into its rule text and handle
fn split_handle(line: &str) -> Option<(&str, u64)> {
    let (rule, handle) = line.trim().rsplit_once(" # handle ")?;
    Some((rule.trim(), handle.trim().parse().ok()?))
}

/// Parse the output of `nft --handle list table`.
///
/// Chain headers carry a handle too, so only lines inside a chain body that
/// are not chain declarations are taken as rules.
pub fn parse_rule_listing(listing: &str) -> Vec<RuleEntry> {
    let mut entries = Vec::new();
    let mut chain: Option<String> = None;

    for line in listing.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("chain ") {
            chain = rest.split_whitespace().next().map(str::to_string);
            continue;
        }
        if trimmed == "}" {
            chain = None;
            continue;
        }
        if trimmed.starts_with("type ") {
            continue;
        }

        let (Some(current), Some((rule, handle))) = (chain.as_ref(), split_handle(trimmed)) else {
            continue;
        };
        entries.push(RuleEntry {
            chain: current.clone(),
            rule: rule.to_string(),
            handle,
        });
    }

    entries
}
