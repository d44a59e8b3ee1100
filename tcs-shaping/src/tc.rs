//! Command lines driving the kernel shaping subsystem.
//!
//! Every shaping target is an `ifb<N>` interface with a root `netem` discipline. Traffic entering
//! the node on the ingress interface is classified by source address and redirected into the
//! target of its origin.

use tcs_common::ifb_device;
use tcs_store::ShapingRecord;

/// Handle of the ingress discipline the classifiers hang off.
const INGRESS_HANDLE: &str = "ffff:";

/// Renders a loss percentage given in hundredths as a decimal, e.g. `"550"` as `"5.50"`.
///
/// Inputs of one or two digits are taken verbatim as the fraction, so `"5"` renders as `"0.5"`.
pub fn encode_loss(loss: &str) -> String {
    match loss.len() {
        0 => "0.00".to_string(),
        1 | 2 => format!("0.{loss}"),
        n => format!("{}.{}", &loss[..n - 2], &loss[n - 2..]),
    }
}

/// Disciplines installed once on the ingress interface: a root `netem` and the ingress hook.
pub fn bootstrap(device: &str) -> [String; 2] {
    [
        format!("tc qdisc replace dev {device} root handle 1: netem"),
        format!("tc qdisc replace dev {device} handle {INGRESS_HANDLE} ingress"),
    ]
}

/// Creates the interface of `ifb_id`, brings it up and installs an empty `netem` discipline.
pub fn create_ifb(ifb_id: &str) -> [String; 3] {
    let dev = ifb_device(ifb_id);
    [
        format!("ip link add {dev} type ifb"),
        format!("ip link set {dev} up"),
        format!("tc qdisc replace dev {dev} handle 1:0 root netem"),
    ]
}

/// Applies the impairment of `record` to its interface.
pub fn set_ifb(record: &ShapingRecord) -> String {
    let dev = ifb_device(&record.ifb_id);
    let distribution =
        if record.delay_variation_ms != 0 { " distribution normal" } else { "" };

    format!(
        "tc qdisc change dev {dev} handle 1:0 root netem delay {}ms {}ms {}%{distribution} loss {}% rate {}bit",
        record.delay_ms,
        record.delay_variation_ms,
        record.delay_correlation_pct,
        encode_loss(&record.packet_loss),
        record.data_rate_bits,
    )
}

pub fn delete_ifb(ifb_id: &str) -> String {
    format!("ip link delete {}", ifb_device(ifb_id))
}

/// Redirects traffic from `source` entering on `device` to the interface of `ifb_id`. The
/// filter id doubles as the classifier priority, which is how it is deleted again.
pub fn add_filter(device: &str, filter_id: &str, source: &str, ifb_id: &str) -> String {
    format!(
        "tc filter add dev {device} parent {INGRESS_HANDLE} protocol ip prio {filter_id} u32 match ip src {source} match u32 0 0 action mirred egress redirect dev {}",
        ifb_device(ifb_id)
    )
}

/// Deletes every classifier installed with priority `filter_id`.
pub fn delete_filter(device: &str, filter_id: &str) -> String {
    format!("tc filter del dev {device} parent {INGRESS_HANDLE} pref {filter_id}")
}
