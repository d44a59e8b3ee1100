//! NAT-based load balancing.
//!
//! Load-balancing records map a service address and port to the instance currently serving it.
//! The [`NatReconciler`] renders them as DNAT rules in per-service chains of the `nat` table,
//! through the [`NatTable`] abstraction ([`IptablesCli`] in production).

use tcs_common::command;
use tcs_store::StoreError;

pub mod conntrack;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

mod reconciler;
pub use reconciler::{
    dnat_rule, hook, top_chain, NatOptions, NatReconciler, NatReport, CHAIN_PREFIX, MAX_CHAIN_LEN,
};

mod table;
pub use table::{rule, IptablesCli, NatTable};

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("command failed: {0}")]
    Command(#[from] command::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("`{0}` is not available on this host")]
    Unavailable(&'static str),
}

pub type Result<T> = std::result::Result<T, NatError>;
