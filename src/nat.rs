//! Idempotent NAT chain management.
//!
//! Both reconcilers drive the kernel's `nat` table toward a desired map of
//! `chain -> rules`. The forwarder owns PREROUTING/POSTROUTING outright on
//! its pod and replaces them wholesale; the gateway keeps its rules in named
//! per-gateway chains and only appends jump rules into the base chains, so
//! multiple gateways coexist on one host.
//!
//! The [`NatBackend`] trait is the seam to the kernel; production shells out
//! to `iptables`, tests record calls.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::Error;
use crate::Result;

/// The only table this system touches.
pub const TABLE_NAT: &str = "nat";
/// Base chain rewritten for inbound legs.
pub const CHAIN_PREROUTING: &str = "PREROUTING";
/// Base chain rewritten for outbound legs.
pub const CHAIN_POSTROUTING: &str = "POSTROUTING";

/// Desired rules per chain. Ordered so application is deterministic.
pub type ChainRules = BTreeMap<String, Vec<Vec<String>>>;

/// Low-level NAT operations.
#[async_trait]
pub trait NatBackend: Send + Sync {
    /// Create the chain if needed and remove all rules from it.
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Append a rule unless an identical one is already present.
    async fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;

    /// True if an identical rule is currently present.
    async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool>;
}

/// Flush each listed chain, then append its rules.
///
/// Used where the caller owns the chain's full contents.
pub async fn replace_chains(backend: &dyn NatBackend, table: &str, rules: &ChainRules) -> Result<()> {
    apply_chains(backend, table, rules, true).await
}

/// Append rules without disturbing what peers put in the chain.
///
/// Used for jump rules into base chains shared between gateways.
pub async fn add_chains(backend: &dyn NatBackend, table: &str, rules: &ChainRules) -> Result<()> {
    apply_chains(backend, table, rules, false).await
}

async fn apply_chains(
    backend: &dyn NatBackend,
    table: &str,
    rules: &ChainRules,
    flush: bool,
) -> Result<()> {
    for (chain, chain_rules) in rules {
        if flush {
            backend.clear_chain(table, chain).await?;
        }
        for rule in chain_rules {
            backend.append_unique(table, chain, rule).await?;
        }
    }
    Ok(())
}

/// True only if every listed rule currently exists.
///
/// Extra rules in the chains are not detected; drift recovery re-replaces
/// the owned chains anyway.
pub async fn check_chains_exist(backend: &dyn NatBackend, table: &str, rules: &ChainRules) -> bool {
    for (chain, chain_rules) in rules {
        for rule in chain_rules {
            match backend.exists(table, chain, rule).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return false,
            }
        }
    }
    true
}

/// DNAT rule matching `--dst dst_ip --src src_ip --dport dport`, rewriting
/// the destination to `dest_ip:dest_port`.
pub fn dnat_rule(dst_ip: &str, src_ip: &str, dport: u16, dest_ip: &str, dest_port: u16) -> Vec<String> {
    vec![
        "-m".into(),
        "tcp".into(),
        "-p".into(),
        "tcp".into(),
        "--dst".into(),
        dst_ip.into(),
        "--src".into(),
        src_ip.into(),
        "--dport".into(),
        dport.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{dest_ip}:{dest_port}"),
    ]
}

/// SNAT rule matching `--dst dst_ip --dport dport`, rewriting the source to
/// `src_ip`.
pub fn snat_rule(dst_ip: &str, dport: u16, src_ip: &str) -> Vec<String> {
    vec![
        "-m".into(),
        "tcp".into(),
        "-p".into(),
        "tcp".into(),
        "--dst".into(),
        dst_ip.into(),
        "--dport".into(),
        dport.to_string(),
        "-j".into(),
        "SNAT".into(),
        "--to-source".into(),
        src_ip.into(),
    ]
}

/// NAT backend shelling out to the `iptables` binary.
///
/// Mirrors what the kernel-facing side of go-iptables does: `-N`/`-F` for
/// clearing, `-C` for existence, `-C`-then-`-A` for unique appends.
#[derive(Clone, Copy, Debug, Default)]
pub struct Iptables;

impl Iptables {
    async fn run(&self, args: &[&str]) -> Result<bool> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::nat(format!("failed to run iptables: {e}")))?;
        if output.status.success() {
            return Ok(true);
        }
        // Exit code 1 is the protocol-level "no" (rule or chain missing);
        // anything else is a real failure.
        if output.status.code() == Some(1) {
            return Ok(false);
        }
        Err(Error::nat(format!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl NatBackend for Iptables {
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        // -N fails with code 1 when the chain already exists; either way the
        // chain exists afterwards and -F empties it.
        self.run(&["-t", table, "-N", chain]).await?;
        if !self.run(&["-t", table, "-F", chain]).await? {
            return Err(Error::nat(format!("failed to flush chain {chain}")));
        }
        Ok(())
    }

    async fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if self.exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-A", chain];
        args.extend(rule.iter().map(String::as_str));
        if !self.run(&args).await? {
            return Err(Error::nat(format!(
                "failed to append rule to {chain}: {}",
                rule.join(" ")
            )));
        }
        Ok(())
    }

    async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend(rule.iter().map(String::as_str));
        self.run(&args).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording NAT backend for tests.

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// One recorded backend call.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        /// clear_chain(table, chain)
        Clear(String, String),
        /// append_unique(table, chain, rule)
        Append(String, String, Vec<String>),
        /// exists(table, chain, rule)
        Exists(String, String, Vec<String>),
    }

    /// Backend that records calls and serves canned state.
    #[derive(Default)]
    pub struct MockBackend {
        pub calls: Mutex<Vec<Call>>,
        /// Rules reported present by exists(), keyed "chain|rule".
        pub present: Mutex<HashSet<String>>,
        /// When set, clear_chain fails.
        pub fail_clear: bool,
        /// When set, append_unique fails.
        pub fail_append: bool,
    }

    impl MockBackend {
        pub fn mark_present(&self, chain: &str, rule: &[String]) {
            self.present
                .lock()
                .unwrap()
                .insert(format!("{chain}|{}", rule.join(" ")));
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NatBackend for MockBackend {
        async fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Clear(table.into(), chain.into()));
            if self.fail_clear {
                return Err(Error::nat(format!("failed to clear chain {chain}")));
            }
            Ok(())
        }

        async fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Append(table.into(), chain.into(), rule.to_vec()));
            if self.fail_append {
                return Err(Error::nat(format!("failed to append to chain {chain}")));
            }
            self.mark_present(chain, rule);
            Ok(())
        }

        async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Exists(table.into(), chain.into(), rule.to_vec()));
            Ok(self
                .present
                .lock()
                .unwrap()
                .contains(&format!("{chain}|{}", rule.join(" "))))
        }
    }
}
