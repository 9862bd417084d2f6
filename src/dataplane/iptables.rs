//! iptables rule tables

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

use super::{DataPlaneError, RuleTable};

/// Rules managed through the `iptables` binary
///
/// Existence is checked with `-C`, so appending and deleting are idempotent.
#[derive(Clone, Debug)]
pub struct IptablesRuleTable {
    binary: String,
}

impl Default for IptablesRuleTable {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl IptablesRuleTable {
    /// Use the given iptables binary
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args<'a>(flag: &'a str, table: &'a str, chain: &'a str, spec: &'a [String]) -> Vec<&'a str> {
        let mut args = vec!["-w", "-t", table, flag, chain];
        args.extend(spec.iter().map(String::as_str));
        args
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, DataPlaneError> {
        debug!(cmd = %self.binary, args = ?args, "executing");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| DataPlaneError::Spawn(format!("{}: {}", self.binary, e)))
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, DataPlaneError> {
        let output = self.run(&Self::args("-C", table, chain, spec)).await?;
        if output.status.success() {
            return Ok(true);
        }
        // Exit status 1 means "no such rule"; anything else is a real failure
        match output.status.code() {
            Some(1) => Ok(false),
            _ => Err(self.failure("-C", chain, spec, &output)),
        }
    }

    async fn require(&self, flag: &str, table: &str, chain: &str, spec: &[String]) -> Result<(), DataPlaneError> {
        let output = self.run(&Self::args(flag, table, chain, spec)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(flag, chain, spec, &output))
        }
    }

    fn failure(&self, flag: &str, chain: &str, spec: &[String], output: &std::process::Output) -> DataPlaneError {
        DataPlaneError::Command {
            command: format!("{} {} {} {}", self.binary, flag, chain, spec.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[async_trait]
impl RuleTable for IptablesRuleTable {
    async fn ensure_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), DataPlaneError> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.require("-A", table, chain, spec).await
    }

    async fn delete_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), DataPlaneError> {
        if !self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.require("-D", table, chain, spec).await
    }
}

/// In-memory rule table for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryRuleTable {
    chains: Mutex<BTreeMap<(String, String), Vec<Vec<String>>>>,
}

impl MemoryRuleTable {
    /// Rules currently in `table`/`chain`, in insertion order
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of rules across all chains
    pub fn len(&self) -> usize {
        self.chains.lock().values().map(Vec::len).sum()
    }

    /// Whether no rule is installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RuleTable for MemoryRuleTable {
    async fn ensure_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), DataPlaneError> {
        let mut chains = self.chains.lock();
        let rules = chains
            .entry((table.to_string(), chain.to_string()))
            .or_default();
        if !rules.iter().any(|r| r.as_slice() == spec) {
            debug!(table, chain, rule = ?spec, "dry-run: append rule");
            rules.push(spec.to_vec());
        }
        Ok(())
    }

    async fn delete_rule(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), DataPlaneError> {
        let mut chains = self.chains.lock();
        let key = (table.to_string(), chain.to_string());
        if let Some(rules) = chains.get_mut(&key) {
            if let Some(pos) = rules.iter().position(|r| r.as_slice() == spec) {
                debug!(table, chain, rule = ?spec, "dry-run: delete rule");
                rules.remove(pos);
            }
            if rules.is_empty() {
                chains.remove(&key);
            }
        }
        Ok(())
    }
}
