use std::time::Duration;

use clap::Parser;
use tcs_measure::MeasureOptions;
use tcs_nat::NatOptions;
use tcs_shaping::TrafficOptions;
use tcs_store::KeySchema;

/// Command-line and environment configuration of the sidecar.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tc-sidecar",
    version,
    about = "Applies emulated network characteristics and service load balancing on this node"
)]
pub struct SidecarConfig {
    /// Identity of the node this sidecar governs.
    #[arg(long, env = "POD_NAME", value_parser = non_empty)]
    pub node: String,

    /// Address of the desired-state store.
    #[arg(long, env = "TCS_STORE_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub store_url: String,

    /// Prefix of every key and channel in the store.
    #[arg(long, env = "TCS_NAMESPACE", default_value = KeySchema::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Interface receiving the traffic to shape.
    #[arg(long, default_value = "eth0")]
    pub ingress_device: String,

    /// Interface masqueraded for egress load balancing.
    #[arg(long, default_value = "eth0")]
    pub egress_device: String,

    /// Interval between probe ticks, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub probe_interval_ms: u64,

    /// How long a probe waits for its reply, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub probe_timeout_ms: u64,

    /// Interval between counter samples, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub sample_interval_ms: u64,

    /// Number of RTT slots kept per destination.
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u64).range(1..))]
    pub history_capacity: u64,

    /// Probe payload size in bytes.
    #[arg(long, default_value_t = 56)]
    pub payload_size: usize,

    /// Timeout for resolving destination names, in milliseconds.
    #[arg(long, default_value_t = 15_000)]
    pub resolve_timeout_ms: u64,

    /// Attempts made to reach the store before giving up.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_attempts: u64,

    /// Delay before the second connection attempt, in milliseconds. Doubled after every attempt.
    #[arg(long, default_value_t = 500)]
    pub connect_backoff_ms: u64,

    /// Emit logs as JSON.
    #[arg(long, env = "TCS_LOG_JSON")]
    pub log_json: bool,
}

impl SidecarConfig {
    pub fn keys(&self) -> KeySchema {
        KeySchema::new(self.namespace.clone(), self.node.clone())
    }

    pub fn traffic_options(&self) -> TrafficOptions {
        TrafficOptions::default()
            .with_device(self.ingress_device.clone())
            .with_resolve_timeout(Duration::from_millis(self.resolve_timeout_ms))
            .with_history_capacity(self.history_capacity as usize)
    }

    pub fn nat_options(&self) -> NatOptions {
        NatOptions::default().with_egress_device(self.egress_device.clone())
    }

    pub fn measure_options(&self) -> MeasureOptions {
        MeasureOptions::default()
            .with_probe_interval(Duration::from_millis(self.probe_interval_ms))
            .with_probe_timeout(Duration::from_millis(self.probe_timeout_ms))
            .with_sample_interval(Duration::from_millis(self.sample_interval_ms))
            .with_history_capacity(self.history_capacity as usize)
            .with_payload_size(self.payload_size)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

fn non_empty(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    Ok(value.to_string())
}
