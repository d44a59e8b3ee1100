use std::sync::Arc;

use futures::future::join_all;
use tcs_common::Executor;
use tcs_nat::{NatReconciler, NatTable};
use tcs_shaping::TrafficReconciler;
use tcs_store::{Event, EventSource, KeySchema, Store};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The pass an event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Traffic,
    Nat,
}

/// Routes store events to the reconciler they concern.
///
/// Network events trigger a traffic pass, load-balancing events a NAT pass. Failed passes are
/// logged and the dispatcher waits for the next event.
#[derive(Debug)]
pub struct Dispatcher<S, E, T> {
    traffic: Arc<TrafficReconciler<S, E>>,
    nat: Arc<NatReconciler<T, S, E>>,
    net_channel: String,
    lb_channel: String,
}

impl<S, E, T> Clone for Dispatcher<S, E, T> {
    fn clone(&self) -> Self {
        Self {
            traffic: Arc::clone(&self.traffic),
            nat: Arc::clone(&self.nat),
            net_channel: self.net_channel.clone(),
            lb_channel: self.lb_channel.clone(),
        }
    }
}

impl<S, E, T> Dispatcher<S, E, T>
where
    S: Store,
    E: Executor,
    T: NatTable,
{
    pub fn new(
        keys: &KeySchema,
        traffic: Arc<TrafficReconciler<S, E>>,
        nat: Arc<NatReconciler<T, S, E>>,
    ) -> Self {
        Self { traffic, nat, net_channel: keys.net_channel(), lb_channel: keys.lb_channel() }
    }

    /// The channels to subscribe to.
    pub fn channels(&self) -> [String; 2] {
        [self.net_channel.clone(), self.lb_channel.clone()]
    }

    /// Runs one traffic pass and one NAT pass, for the state present before any event arrives.
    pub async fn initial_pass(&self) {
        self.execute(Pass::Traffic).await;
        self.execute(Pass::Nat).await;
    }

    /// Handles a single event to completion.
    pub async fn dispatch(&self, event: Event) {
        if let Some(pass) = self.accept(&event) {
            self.execute(pass).await;
        }
    }

    /// Receives events until the source ends, handling each in its own task.
    ///
    /// Passes of the same kind queue on their reconciler. Returns once the source has ended and
    /// all handlers finished.
    pub async fn run<Ev: EventSource>(&self, mut events: Ev) {
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let event = match events.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!(%e, "failed to receive event");
                    continue;
                }
            };

            let Some(pass) = self.accept(&event) else {
                continue;
            };

            handlers.retain(|h| !h.is_finished());
            let this = self.clone();
            handlers.push(tokio::spawn(async move { this.execute(pass).await }));
        }

        info!("event stream ended");
        for res in join_all(handlers).await {
            if let Err(e) = res {
                error!(%e, "event handler failed");
            }
        }
    }

    /// Classifies `event`. An announced transaction id is recorded here, so ids are taken in
    /// arrival order even though passes run in their own tasks.
    fn accept(&self, event: &Event) -> Option<Pass> {
        if event.channel == self.net_channel {
            match event.payload.trim().parse::<u64>() {
                Ok(id) => self.traffic.counter().set_current(id),
                Err(e) => warn!(payload = %event.payload, %e, "invalid transaction id"),
            }
            Some(Pass::Traffic)
        } else if event.channel == self.lb_channel {
            Some(Pass::Nat)
        } else {
            warn!(channel = %event.channel, "event on unexpected channel");
            None
        }
    }

    async fn execute(&self, pass: Pass) {
        match pass {
            Pass::Traffic => match self.traffic.on_transaction(None).await {
                Ok(report) => debug!(?report, "traffic pass handled"),
                Err(e) => error!(%e, "traffic pass failed"),
            },
            Pass::Nat => match self.nat.reconcile().await {
                Ok(report) => debug!(?report, "NAT pass handled"),
                Err(e) => error!(%e, "NAT pass failed"),
            },
        }
    }
}
