//! Traffic-shaping reconciliation.
//!
//! Shaping records become `ifb` interfaces carrying a `netem` discipline; filter records become
//! classifiers on the ingress interface redirecting a source into its interface. The
//! [`TrafficReconciler`] diffs both against what it applied before and also maintains the
//! [`DestinationIndex`](tcs_measure::DestinationIndex) the measurement loops work on.

use tcs_store::StoreError;

mod counter;
pub use counter::TransactionCounter;

mod reconciler;
pub use reconciler::{PassReport, TrafficOptions, TrafficReconciler, TRANSACTION_FIELD};

pub mod tc;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
