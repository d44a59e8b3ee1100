//! In-memory [`NatTable`] for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tcs_common::command::{Error, Output};

use crate::{NatError, NatTable, Result};

const BUILTIN: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

/// A `nat` table held in memory, recording every mutating call.
#[derive(Debug)]
pub struct MemoryNatTable {
    chains: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl Default for MemoryNatTable {
    fn default() -> Self {
        let chains = BUILTIN.iter().map(|c| (c.to_string(), Vec::new())).collect();
        Self { chains: Mutex::new(chains), calls: Mutex::default(), failures: Mutex::default() }
    }
}

impl MemoryNatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call whose log line contains `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.failures.lock().push(pattern.into());
    }

    /// Mutating calls so far, as `<op> <chain> <rule...>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Mutating calls whose log line starts with `op`.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.calls.lock().iter().filter(|c| c.starts_with(op)).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.lock().contains_key(chain)
    }

    pub fn rules(&self, chain: &str) -> Vec<Vec<String>> {
        self.chains.lock().get(chain).cloned().unwrap_or_default()
    }

    fn record(&self, op: &str, chain: &str, rule: &[String], mutating: bool) -> Result<()> {
        let mut line = format!("{op} {chain}");
        for arg in rule {
            line.push(' ');
            line.push_str(arg);
        }

        let failed = self.failures.lock().iter().any(|p| line.contains(p.as_str()));
        if mutating {
            self.calls.lock().push(line.clone());
        }

        if failed {
            let output =
                Output { code: Some(2), stdout: String::new(), stderr: "scripted failure".into() };
            return Err(NatError::Command(Error::NonZero { command: line, output }));
        }
        Ok(())
    }

    fn missing(chain: &str) -> NatError {
        let output = Output {
            code: Some(1),
            stdout: String::new(),
            stderr: format!("No chain/target/match by that name: {chain}"),
        };
        NatError::Command(Error::NonZero { command: chain.to_string(), output })
    }
}

#[async_trait]
impl NatTable for MemoryNatTable {
    async fn list_chains(&self) -> Result<Vec<String>> {
        self.record("list", "nat", &[], false)?;
        Ok(self.chains.lock().keys().cloned().collect())
    }

    async fn new_chain(&self, chain: &str) -> Result<()> {
        self.record("new", chain, &[], true)?;
        let mut chains = self.chains.lock();
        if chains.contains_key(chain) {
            let output = Output {
                code: Some(1),
                stdout: String::new(),
                stderr: "Chain already exists.".into(),
            };
            return Err(NatError::Command(Error::NonZero { command: chain.to_string(), output }));
        }
        chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn exists(&self, chain: &str, rule: &[String]) -> Result<bool> {
        self.record("check", chain, rule, false)?;
        Ok(self.chains.lock().get(chain).is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    async fn append(&self, chain: &str, rule: &[String]) -> Result<()> {
        self.record("append", chain, rule, true)?;
        self.chains.lock().get_mut(chain).ok_or_else(|| Self::missing(chain))?.push(rule.to_vec());
        Ok(())
    }

    async fn delete(&self, chain: &str, rule: &[String]) -> Result<()> {
        self.record("delete", chain, rule, true)?;
        let mut chains = self.chains.lock();
        let rules = chains.get_mut(chain).ok_or_else(|| Self::missing(chain))?;
        let pos = rules.iter().position(|r| r == rule).ok_or_else(|| Self::missing(chain))?;
        rules.remove(pos);
        Ok(())
    }

    async fn clear_chain(&self, chain: &str) -> Result<()> {
        self.record("clear", chain, &[], true)?;
        self.chains.lock().get_mut(chain).ok_or_else(|| Self::missing(chain))?.clear();
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.record("remove", chain, &[], true)?;
        let mut chains = self.chains.lock();

        let referenced = chains.values().flatten().any(|r| r.last().is_some_and(|t| t == chain));
        if referenced || !chains.get(chain).is_some_and(Vec::is_empty) {
            let output = Output {
                code: Some(1),
                stdout: String::new(),
                stderr: "Directory not empty".into(),
            };
            return Err(NatError::Command(Error::NonZero { command: chain.to_string(), output }));
        }

        chains.remove(chain);
        Ok(())
    }
}
