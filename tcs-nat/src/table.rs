use std::sync::Arc;

use async_trait::async_trait;
use tcs_common::{command, Executor};
use tracing::debug;

use crate::{NatError, Result};

/// The operations the NAT reconciler needs on the `nat` table.
///
/// Rules are given as argument lists, exactly as they follow the chain name on an `iptables`
/// command line.
#[async_trait]
pub trait NatTable: Send + Sync + 'static {
    /// Names of all chains, built-in ones included.
    async fn list_chains(&self) -> Result<Vec<String>>;

    async fn new_chain(&self, chain: &str) -> Result<()>;

    async fn exists(&self, chain: &str, rule: &[String]) -> Result<bool>;

    async fn append(&self, chain: &str, rule: &[String]) -> Result<()>;

    /// Appends `rule` unless an identical rule is already in `chain`.
    async fn append_unique(&self, chain: &str, rule: &[String]) -> Result<()> {
        if self.exists(chain, rule).await? {
            return Ok(());
        }
        self.append(chain, rule).await
    }

    async fn delete(&self, chain: &str, rule: &[String]) -> Result<()>;

    /// Removes every rule from `chain`.
    async fn clear_chain(&self, chain: &str) -> Result<()>;

    async fn delete_chain(&self, chain: &str) -> Result<()>;
}

/// [`NatTable`] driving the `iptables` binary.
#[derive(Debug)]
pub struct IptablesCli<E> {
    executor: Arc<E>,
}

impl<E: Executor> IptablesCli<E> {
    const PROGRAM: &'static str = "iptables";

    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }

    /// Fails if `iptables` is not installed on this host.
    pub async fn ensure_available(&self) -> Result<()> {
        if self.executor.available(Self::PROGRAM).await {
            Ok(())
        } else {
            Err(NatError::Unavailable(Self::PROGRAM))
        }
    }

    async fn run(&self, op: &str, chain: &str, rule: &[String]) -> command::Result<String> {
        let mut cmd = format!("{} -w -t nat {op} {chain}", Self::PROGRAM);
        for arg in rule {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        self.executor.run(&cmd).await
    }
}

#[async_trait]
impl<E: Executor> NatTable for IptablesCli<E> {
    async fn list_chains(&self) -> Result<Vec<String>> {
        let out = self.executor.run(&format!("{} -w -t nat -S", Self::PROGRAM)).await?;
        Ok(parse_chains(&out))
    }

    async fn new_chain(&self, chain: &str) -> Result<()> {
        self.run("-N", chain, &[]).await?;
        Ok(())
    }

    async fn exists(&self, chain: &str, rule: &[String]) -> Result<bool> {
        match self.run("-C", chain, rule).await {
            Ok(_) => Ok(true),
            // `-C` exits with 1 when no such rule exists.
            Err(command::Error::NonZero { output, .. }) if output.code == Some(1) => {
                debug!(chain, stderr = %output.stderr.trim(), "rule not found");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, chain: &str, rule: &[String]) -> Result<()> {
        self.run("-A", chain, rule).await?;
        Ok(())
    }

    async fn delete(&self, chain: &str, rule: &[String]) -> Result<()> {
        self.run("-D", chain, rule).await?;
        Ok(())
    }

    async fn clear_chain(&self, chain: &str) -> Result<()> {
        self.run("-F", chain, &[]).await?;
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.run("-X", chain, &[]).await?;
        Ok(())
    }
}

/// Extracts the chain names from `iptables -S` output: built-in chains appear as policies
/// (`-P`), user chains as declarations (`-N`).
fn parse_chains(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("-P" | "-N") => tokens.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// Builds an owned rule from string literals.
pub fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use tcs_common::testing::RecordingExecutor;

    use super::*;

    const LISTING: &str = "-P PREROUTING ACCEPT
-P INPUT ACCEPT
-P OUTPUT ACCEPT
-P POSTROUTING ACCEPT
-N TCS-ME-SERVICES
-N TCS-ME-SVC-QWERTYUIOPASDF
-A OUTPUT -j TCS-ME-SERVICES
-A POSTROUTING -o eth0 -j MASQUERADE
";

    #[test]
    fn parses_chain_listing() {
        assert_eq!(
            parse_chains(LISTING),
            vec![
                "PREROUTING",
                "INPUT",
                "OUTPUT",
                "POSTROUTING",
                "TCS-ME-SERVICES",
                "TCS-ME-SVC-QWERTYUIOPASDF"
            ]
        );
    }

    #[tokio::test]
    async fn builds_iptables_commands() {
        let executor = Arc::new(RecordingExecutor::new());
        let table = IptablesCli::new(Arc::clone(&executor));

        table.new_chain("TCS-X").await.unwrap();
        table.append("TCS-X", &rule(&["-j", "DNAT"])).await.unwrap();
        table.delete("OUTPUT", &rule(&["-j", "TCS-X"])).await.unwrap();
        table.clear_chain("TCS-X").await.unwrap();
        table.delete_chain("TCS-X").await.unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "iptables -w -t nat -N TCS-X",
                "iptables -w -t nat -A TCS-X -j DNAT",
                "iptables -w -t nat -D OUTPUT -j TCS-X",
                "iptables -w -t nat -F TCS-X",
                "iptables -w -t nat -X TCS-X",
            ]
        );
    }

    #[tokio::test]
    async fn append_unique_checks_first() {
        let executor = Arc::new(RecordingExecutor::new());
        let table = IptablesCli::new(Arc::clone(&executor));
        let masquerade = rule(&["-o", "eth0", "-j", "MASQUERADE"]);

        table.append_unique("POSTROUTING", &masquerade).await.unwrap();
        assert_eq!(
            executor.commands(),
            vec!["iptables -w -t nat -C POSTROUTING -o eth0 -j MASQUERADE"]
        );

        executor.clear();
        executor.fail_on("-C POSTROUTING");
        table.append_unique("POSTROUTING", &masquerade).await.unwrap();
        assert_eq!(
            executor.commands(),
            vec![
                "iptables -w -t nat -C POSTROUTING -o eth0 -j MASQUERADE",
                "iptables -w -t nat -A POSTROUTING -o eth0 -j MASQUERADE",
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.mark_missing("iptables");

        let err = IptablesCli::new(executor).ensure_available().await.unwrap_err();
        assert!(matches!(err, NatError::Unavailable("iptables")));
    }
}
