use std::sync::Arc;

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tcs_common::Executor;
use tcs_store::{KeySchema, LbRecord, ServiceType, Store, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

use crate::{conntrack, table::rule, NatTable, Result};

/// Prefix of every chain this node owns in the `nat` table.
pub const CHAIN_PREFIX: &str = "TCS-";
/// Upper bound on generated chain names, below the kernel limit.
pub const MAX_CHAIN_LEN: usize = 25;

/// Top-level chain collecting the services of `ty`.
pub const fn top_chain(ty: ServiceType) -> &'static str {
    match ty {
        ServiceType::MeshInternal => "TCS-ME-SERVICES",
        ServiceType::Ingress => "TCS-INGRESS-SERVICES",
        ServiceType::Egress => "TCS-EGRESS-SERVICES",
    }
}

/// Built-in chain the top-level chain of `ty` is hooked into. Ingress traffic arrives from
/// outside the node; the other classes originate locally.
pub const fn hook(ty: ServiceType) -> &'static str {
    match ty {
        ServiceType::MeshInternal | ServiceType::Egress => "OUTPUT",
        ServiceType::Ingress => "PREROUTING",
    }
}

/// Prefix of the per-service chains of `ty`.
const fn service_prefix(ty: ServiceType) -> &'static str {
    match ty {
        ServiceType::MeshInternal => "TCS-ME-SVC-",
        ServiceType::Ingress => "TCS-IN-SVC-",
        ServiceType::Egress => "TCS-EG-SVC-",
    }
}

/// The top-level chain a per-service chain hangs off, derived from its name.
fn parent_of(chain: &str) -> Option<&'static str> {
    ServiceType::ALL
        .into_iter()
        .find(|ty| chain.starts_with(service_prefix(*ty)))
        .map(top_chain)
}

/// A prefix followed by random uppercase letters, [`MAX_CHAIN_LEN`] long in total.
fn random_chain(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String =
        (0..MAX_CHAIN_LEN.saturating_sub(prefix.len())).map(|_| rng.gen_range('A'..='Z')).collect();
    format!("{prefix}{suffix}")
}

/// The DNAT rule redirecting the service of `record` to its current target.
pub fn dnat_rule(record: &LbRecord) -> Vec<String> {
    vec![
        "-p".into(),
        record.protocol.clone(),
        "-d".into(),
        record.service_ip.clone(),
        "--dport".into(),
        record.port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:{}", record.target_ip, record.target_port),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        record.service_key(),
    ]
}

fn jump(chain: &str) -> Vec<String> {
    rule(&["-j", chain])
}

#[derive(Debug, Clone)]
pub struct NatOptions {
    /// Interface whose outgoing traffic is masqueraded.
    pub egress_device: String,
}

impl Default for NatOptions {
    fn default() -> Self {
        Self { egress_device: "eth0".to_string() }
    }
}

impl NatOptions {
    pub fn with_egress_device(mut self, device: impl Into<String>) -> Self {
        self.egress_device = device.into();
        self
    }
}

/// What a single NAT pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatReport {
    pub chains_created: usize,
    pub chains_removed: usize,
    /// Whether the connection-tracking table was flushed.
    pub flushed: bool,
}

/// The chain generated for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceChain {
    chain: String,
    parent: &'static str,
}

/// Converges the DNAT chains of this node to the load-balancing records in the store.
///
/// Each service gets its own chain with a random name, hooked from the top-level chain of its
/// class. A service whose rule changed gets a fresh chain and the old one is removed with the
/// other orphans. Any failure aborts the pass; the next event starts over.
#[derive(Debug)]
pub struct NatReconciler<T, S, E> {
    table: Arc<T>,
    store: Arc<S>,
    executor: Arc<E>,
    keys: KeySchema,
    options: NatOptions,
    /// Service key to its chain.
    services: Mutex<FxHashMap<String, ServiceChain>>,
}

impl<T, S, E> NatReconciler<T, S, E>
where
    T: NatTable,
    S: Store,
    E: Executor,
{
    pub fn new(
        table: Arc<T>,
        store: Arc<S>,
        executor: Arc<E>,
        keys: KeySchema,
        options: NatOptions,
    ) -> Self {
        Self { table, store, executor, keys, options, services: Mutex::default() }
    }

    /// Runs one NAT pass.
    pub async fn reconcile(&self) -> Result<NatReport> {
        async move {
            let mut services = self.services.lock().await;
            let mut report = NatReport::default();

            let all_chains: FxHashSet<String> =
                self.table.list_chains().await?.into_iter().collect();
            let mut orphans: FxHashSet<String> =
                all_chains.iter().filter(|c| c.starts_with(CHAIN_PREFIX)).cloned().collect();

            for ty in ServiceType::ALL {
                let top = top_chain(ty);
                if !orphans.remove(top) {
                    debug!(chain = top, "creating top-level chain");
                    self.table.new_chain(top).await?;
                }
                self.table.append_unique(hook(ty), &jump(top)).await?;
            }

            let masquerade = rule(&["-o", self.options.egress_device.as_str(), "-j", "MASQUERADE"]);
            self.table.append_unique("POSTROUTING", &masquerade).await?;

            for entry in self.store.scan(&self.keys.lb_pattern()).await? {
                let record = LbRecord::from_fields(&entry.fields)
                    .map_err(|source| StoreError::Record { key: entry.key.clone(), source })?;
                let key = record.service_key();
                let dnat = dnat_rule(&record);

                if let Some(existing) = services.get(&key) {
                    if orphans.contains(&existing.chain)
                        && self.table.exists(&existing.chain, &dnat).await?
                    {
                        orphans.remove(&existing.chain);
                        continue;
                    }
                }

                let parent = top_chain(record.service_type);
                let chain = loop {
                    let chain = random_chain(service_prefix(record.service_type));
                    if !all_chains.contains(&chain)
                        && !services.values().any(|s| s.chain == chain)
                    {
                        break chain;
                    }
                };

                debug!(service = %key, %chain, "creating service chain");
                self.table.new_chain(&chain).await?;
                self.table.append_unique(parent, &jump(&chain)).await?;
                self.table.append_unique(&chain, &dnat).await?;

                services.insert(key, ServiceChain { chain, parent });
                report.chains_created += 1;
            }

            for chain in orphans {
                debug!(%chain, "removing orphaned chain");
                let parent = services
                    .values()
                    .find(|s| s.chain == chain)
                    .map(|s| s.parent)
                    .or_else(|| parent_of(&chain));
                if let Some(parent) = parent {
                    self.table.delete(parent, &jump(&chain)).await?;
                }
                self.table.clear_chain(&chain).await?;
                self.table.delete_chain(&chain).await?;

                services.retain(|_, s| s.chain != chain);
                report.chains_removed += 1;
            }

            if report.chains_created + report.chains_removed > 0 {
                report.flushed = conntrack::flush(self.executor.as_ref()).await?;
            }

            info!(?report, "nat pass complete");
            Ok(report)
        }
        .instrument(info_span!("nat_pass"))
        .await
    }
}
