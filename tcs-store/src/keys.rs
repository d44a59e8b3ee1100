/// The key and channel layout shared with the traffic-control engine.
///
/// Every record is scoped by a namespace (`tc-engine` by default) and, for per-node records, by
/// the node identity:
///
/// | record        | key                                     |
/// |---------------|-----------------------------------------|
/// | shaping       | `<ns>:net:<node>:shape:<ifb>`           |
/// | filter        | `<ns>:net:<node>:filter:<filter>`       |
/// | transaction   | `<ns>:net:dbState`                      |
/// | load-balancer | `<ns>:lb:<node>:<service>:<port>`       |
/// | metrics       | `<ns>:metrics:<node>:<remote>`          |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    namespace: String,
    node: String,
}

impl KeySchema {
    pub const DEFAULT_NAMESPACE: &'static str = "tc-engine";

    const NET: &'static str = "net";
    const LB: &'static str = "lb";

    pub fn new(namespace: impl Into<String>, node: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), node: node.into() }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn shape_pattern(&self) -> String {
        format!("{}:{}:{}:shape:*", self.namespace, Self::NET, self.node)
    }

    pub fn shape_key(&self, ifb_id: &str) -> String {
        format!("{}:{}:{}:shape:{ifb_id}", self.namespace, Self::NET, self.node)
    }

    pub fn filter_pattern(&self) -> String {
        format!("{}:{}:{}:filter:*", self.namespace, Self::NET, self.node)
    }

    pub fn filter_key(&self, filter_id: &str) -> String {
        format!("{}:{}:{}:filter:{filter_id}", self.namespace, Self::NET, self.node)
    }

    /// Holds the transaction id of the last batch written by the engine.
    pub fn db_state_key(&self) -> String {
        format!("{}:{}:dbState", self.namespace, Self::NET)
    }

    pub fn lb_pattern(&self) -> String {
        format!("{}:{}:{}:*", self.namespace, Self::LB, self.node)
    }

    pub fn metrics_key(&self, remote_name: &str) -> String {
        format!("{}:metrics:{}:{remote_name}", self.namespace, self.node)
    }

    /// Channel announcing network-characteristic changes. The payload is a transaction id.
    pub fn net_channel(&self) -> String {
        format!("{}-{}", self.namespace, Self::NET)
    }

    /// Channel announcing load-balancer changes.
    pub fn lb_channel(&self) -> String {
        format!("{}-{}", self.namespace, Self::LB)
    }
}
