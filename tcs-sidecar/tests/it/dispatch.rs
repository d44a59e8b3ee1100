use std::sync::Arc;

use tcs_common::testing::RecordingExecutor;
use tcs_measure::DestinationIndex;
use tcs_nat::{memory::MemoryNatTable, NatOptions, NatReconciler};
use tcs_shaping::{TrafficOptions, TrafficReconciler, TRANSACTION_FIELD};
use tcs_sidecar::Dispatcher;
use tcs_store::{
    memory::{MemoryEvents, MemoryStore},
    Event, KeySchema,
};

const NET: &str = "tc-engine-net";
const LB: &str = "tc-engine-lb";

/// Helper functions.
mod helpers {
    use super::*;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub executor: Arc<RecordingExecutor>,
        pub table: Arc<MemoryNatTable>,
        pub traffic: Arc<TrafficReconciler<MemoryStore, RecordingExecutor>>,
        pub dispatcher: Dispatcher<MemoryStore, RecordingExecutor, MemoryNatTable>,
    }

    pub fn harness() -> Harness {
        let _ = tracing_subscriber::fmt::try_init();

        let keys = KeySchema::new(KeySchema::DEFAULT_NAMESPACE, "node-a");
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(RecordingExecutor::new());
        let table = Arc::new(MemoryNatTable::new());

        let traffic = Arc::new(TrafficReconciler::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            keys.clone(),
            DestinationIndex::new(),
            TrafficOptions::default(),
        ));
        let nat = Arc::new(NatReconciler::new(
            Arc::clone(&table),
            Arc::clone(&store),
            Arc::clone(&executor),
            keys.clone(),
            NatOptions::default(),
        ));
        let dispatcher = Dispatcher::new(&keys, Arc::clone(&traffic), nat);

        Harness { store, executor, table, traffic, dispatcher }
    }

    pub fn insert_shape(store: &MemoryStore, ifb: &str, delay: &str) {
        store.insert(
            format!("tc-engine:net:node-a:shape:{ifb}"),
            &[
                ("ifb_uniqueId", ifb),
                ("delay", delay),
                ("delayVariation", "0"),
                ("delayCorrelation", "0"),
                ("packetLoss", "0"),
                ("dataRate", "0"),
            ],
        );
    }

    pub fn insert_filter(store: &MemoryStore, id: &str, src: &str) {
        store.insert(
            format!("tc-engine:net:node-a:filter:{id}"),
            &[
                ("ifb_uniqueId", id),
                ("srcIp", src),
                ("srcSvcIp", "10.96.0.9"),
                ("srcName", &format!("pod-{id}")),
            ],
        );
    }

    pub fn insert_service(store: &MemoryStore, name: &str, target: &str) {
        store.insert(
            format!("tc-engine:lb:node-a:{name}"),
            &[
                ("svc-type", "ME-SVC"),
                ("svc-name", name),
                ("svc-ip", "10.96.0.10"),
                ("svc-protocol", "TCP"),
                ("svc-port", "80"),
                ("lb-svc-ip", target),
                ("lb-svc-port", "8080"),
            ],
        );
    }

    pub fn store_transaction(store: &MemoryStore, id: &str) {
        store.insert("tc-engine:net:dbState", &[(TRANSACTION_FIELD, id)]);
    }

    pub fn service_chains(table: &MemoryNatTable) -> Vec<String> {
        table.rules("TCS-ME-SERVICES").into_iter().filter_map(|r| r.last().cloned()).collect()
    }
}

use helpers::*;

#[tokio::test]
async fn subscribes_to_both_channels() {
    let h = harness();
    assert_eq!(h.dispatcher.channels(), [NET.to_string(), LB.to_string()]);
}

#[tokio::test]
async fn initial_pass_converges_traffic_and_nat() {
    let h = harness();
    insert_shape(&h.store, "1", "20");
    insert_filter(&h.store, "1", "10.0.0.2");
    insert_service(&h.store, "web", "10.0.0.5");

    h.dispatcher.initial_pass().await;

    assert_eq!(h.executor.matching("ip link add").len(), 1);
    assert_eq!(h.executor.matching("tc filter add").len(), 2);
    assert_eq!(service_chains(&h.table).len(), 1);
    assert_eq!(h.executor.matching("conntrack -F").len(), 1);
    assert_eq!(h.traffic.destinations().len(), 1);
}

#[tokio::test]
async fn network_events_are_gated_by_transaction() {
    let h = harness();
    insert_shape(&h.store, "1", "20");
    store_transaction(&h.store, "5");

    h.dispatcher.dispatch(Event::new(NET, "5")).await;
    assert_eq!(h.traffic.counter().current(), 5);
    assert_eq!(h.traffic.counter().last_applied(), 5);
    assert_eq!(h.executor.matching("tc qdisc change dev ifb1").len(), 1);

    // Same transaction again: nothing to re-apply.
    h.executor.clear();
    h.dispatcher.dispatch(Event::new(NET, "5")).await;
    assert!(h.executor.matching("tc qdisc change").is_empty());

    // The engine moved on: the existing interface is re-parameterized once.
    insert_shape(&h.store, "1", "40");
    store_transaction(&h.store, "6");
    h.dispatcher.dispatch(Event::new(NET, "6")).await;
    assert_eq!(
        h.executor.matching("tc qdisc change dev ifb1"),
        vec!["tc qdisc change dev ifb1 handle 1:0 root netem delay 40ms 0ms 0% loss 0.0% rate 0bit"]
    );
    assert_eq!(h.traffic.counter().last_applied(), 6);
}

#[tokio::test]
async fn invalid_transaction_id_still_reconciles() {
    let h = harness();
    insert_shape(&h.store, "1", "20");

    h.dispatcher.dispatch(Event::new(NET, "not-a-number")).await;

    assert_eq!(h.traffic.counter().current(), 0);
    assert_eq!(h.executor.matching("ip link add ifb1").len(), 1);
}

#[tokio::test]
async fn load_balancer_events_follow_service_changes() {
    let h = harness();
    insert_service(&h.store, "web", "10.0.0.5");

    h.dispatcher.dispatch(Event::new(LB, "")).await;
    let chains = service_chains(&h.table);
    assert_eq!(chains.len(), 1);
    assert!(h.table.has_chain(&chains[0]));

    h.store.remove("tc-engine:lb:node-a:web");
    h.dispatcher.dispatch(Event::new(LB, "")).await;
    assert!(service_chains(&h.table).is_empty());
    assert!(!h.table.has_chain(&chains[0]));
}

#[tokio::test]
async fn unexpected_channel_is_ignored() {
    let h = harness();
    insert_shape(&h.store, "1", "20");
    insert_service(&h.store, "web", "10.0.0.5");

    h.dispatcher.dispatch(Event::new("other-net", "1")).await;

    assert!(h.executor.commands().is_empty());
    assert!(h.table.calls().is_empty());
}

#[tokio::test]
async fn failed_pass_is_retried_by_the_next_event() {
    let h = harness();
    insert_shape(&h.store, "1", "20");

    h.store.set_unavailable(true);
    h.dispatcher.dispatch(Event::new(NET, "1")).await;
    assert!(h.executor.matching("ip link add").is_empty());

    h.store.set_unavailable(false);
    h.dispatcher.dispatch(Event::new(NET, "2")).await;
    assert_eq!(h.executor.matching("ip link add ifb1").len(), 1);
}

#[tokio::test]
async fn run_handles_events_until_the_source_ends() {
    let h = harness();
    insert_shape(&h.store, "1", "20");
    insert_service(&h.store, "web", "10.0.0.5");
    store_transaction(&h.store, "3");

    let (publisher, events) = MemoryEvents::channel();
    publisher.publish(NET, "3");
    publisher.publish("unrelated", "");
    publisher.publish(LB, "");
    drop(publisher);

    h.dispatcher.run(events).await;

    assert_eq!(h.traffic.counter().current(), 3);
    assert_eq!(h.traffic.counter().last_applied(), 3);
    assert_eq!(h.executor.matching("ip link add ifb1").len(), 1);
    assert_eq!(service_chains(&h.table).len(), 1);
}
