//! Decoding of the shaping-discipline statistics printed by `tc`.

use std::fmt;

use serde::Deserialize;

use crate::rx::QdiscCounters;

/// Knows how to query the counters of a device and how to read the answer.
pub trait CounterParser: Send + Sync + fmt::Debug {
    /// The command printing the statistics of `device`.
    fn command(&self, device: &str) -> String;

    /// Extracts the counters from the command output, `None` if the output is malformed.
    fn parse(&self, output: &str) -> Option<QdiscCounters>;
}

/// Structured statistics: `tc -s -j qdisc show dev <device>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCounters;

#[derive(Debug, Deserialize)]
struct QdiscStats {
    #[serde(default)]
    root: bool,
    bytes: u64,
    packets: u64,
    #[serde(default)]
    drops: u64,
}

impl CounterParser for JsonCounters {
    fn command(&self, device: &str) -> String {
        format!("tc -s -j qdisc show dev {device}")
    }

    fn parse(&self, output: &str) -> Option<QdiscCounters> {
        let qdiscs: Vec<QdiscStats> = match serde_json::from_str(output) {
            Ok(qdiscs) => qdiscs,
            Err(e) => {
                tracing::debug!(%e, "failed to decode qdisc statistics");
                return None;
            }
        };

        // The shaping discipline is the root one; fall back to the first listed.
        let qdisc = qdiscs.iter().find(|q| q.root).or_else(|| qdiscs.first())?;
        Some(QdiscCounters { bytes: qdisc.bytes, packets: qdisc.packets, dropped: qdisc.drops })
    }
}

/// Human-readable statistics: `tc -s qdisc show dev <device>`.
///
/// Reads the first `Sent <bytes> bytes <packets> pkt (dropped <drops>, ...)` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCounters;

impl CounterParser for TextCounters {
    fn command(&self, device: &str) -> String {
        format!("tc -s qdisc show dev {device}")
    }

    fn parse(&self, output: &str) -> Option<QdiscCounters> {
        let line = output.lines().map(str::trim).find(|l| l.starts_with("Sent "))?;
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let after = |keyword: &str| -> Option<u64> {
            let pos = tokens.iter().position(|t| t.trim_start_matches('(') == keyword)?;
            tokens.get(pos + 1)?.trim_end_matches(',').parse().ok()
        };

        // `Sent 1234 bytes 10 pkt`: the counts precede their unit.
        let before = |unit: &str| -> Option<u64> {
            let pos = tokens.iter().position(|t| *t == unit)?;
            tokens.get(pos.checked_sub(1)?)?.parse().ok()
        };

        Some(QdiscCounters {
            bytes: before("bytes")?,
            packets: before("pkt")?,
            dropped: after("dropped")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"[{"kind":"netem","handle":"1:","root":true,"refcnt":2,"options":{"limit":1000,"delay":{"delay":0.1,"jitter":0.01,"correlation":0},"loss-random":{"loss":0.055,"correlation":0},"ecn":false,"gap":0,"rate":{"rate":125000,"packetoverhead":0,"cellsize":0,"celloverhead":0}},"bytes":183204,"packets":1873,"drops":12,"overlimits":0,"requeues":0,"backlog":0,"qlen":0}]"#;

    const TEXT: &str = "qdisc netem 1: root refcnt 2 limit 1000 delay 100.0ms  10.0ms loss 5.5% rate 1Mbit
 Sent 183204 bytes 1873 pkt (dropped 12, overlimits 0 requeues 0)
 backlog 0b 0p requeues 0
";

    #[test]
    fn json_counters() {
        let counters = JsonCounters.parse(JSON).unwrap();
        assert_eq!(counters, QdiscCounters { bytes: 183204, packets: 1873, dropped: 12 });
        assert_eq!(JsonCounters.command("ifb3"), "tc -s -j qdisc show dev ifb3");
    }

    #[test]
    fn json_prefers_root_qdisc() {
        let output = r#"[
            {"kind":"ingress","handle":"ffff:","parent":"ffff:fff1","bytes":1,"packets":1,"drops":0},
            {"kind":"netem","handle":"1:","root":true,"bytes":500,"packets":5,"drops":1}
        ]"#;
        let counters = JsonCounters.parse(output).unwrap();
        assert_eq!(counters.bytes, 500);
        assert_eq!(counters.dropped, 1);
    }

    #[test]
    fn json_rejects_malformed_output() {
        assert_eq!(JsonCounters.parse(""), None);
        assert_eq!(JsonCounters.parse("[]"), None);
        assert_eq!(JsonCounters.parse("Cannot find device \"ifb9\""), None);
        assert_eq!(JsonCounters.parse(r#"[{"kind":"netem"}]"#), None);
    }

    #[test]
    fn text_counters() {
        let counters = TextCounters.parse(TEXT).unwrap();
        assert_eq!(counters, QdiscCounters { bytes: 183204, packets: 1873, dropped: 12 });
        assert_eq!(TextCounters.command("ifb3"), "tc -s qdisc show dev ifb3");
    }

    #[test]
    fn text_rejects_malformed_output() {
        assert_eq!(TextCounters.parse(""), None);
        assert_eq!(TextCounters.parse("qdisc netem 1: root refcnt 2 limit 1000"), None);
        assert_eq!(TextCounters.parse(" Sent x bytes 1 pkt (dropped 0, overlimits 0)"), None);
    }
}
