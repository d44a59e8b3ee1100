//! Measurement of the emulated links towards the destinations of this node.
//!
//! Two independent loops run over the shared [`DestinationIndex`]:
//!
//! - active probing: an ICMP echo per destination and tick, recorded in a bounded [`History`]
//!   from which [`Statistics`] are aggregated;
//! - passive sampling: the shaping counters of each destination's ifb, turned into throughput
//!   and drop rate by [`RxHistory`] and published to the store.

mod destination;
pub use destination::{Destination, DestinationIndex};

mod engine;
pub use engine::{MeasureOptions, MeasurementEngine, LATENCY_FIELD, LOSS_FIELD, THROUGHPUT_FIELD};

pub mod history;
pub use history::{History, Statistics};

pub mod parser;
pub use parser::{CounterParser, JsonCounters, TextCounters};

pub mod probe;
pub use probe::{IcmpProber, ProbeError, Prober};

mod rx;
pub use rx::{QdiscCounters, RxHistory, RxSample};
