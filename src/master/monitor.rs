//! qmaster liveness tracking.
//!
//! The monitor is the only component that opens or closes event
//! subscriptions: they are opened on the down→up transition and closed on
//! up→down. It starts in the down state, so the first successful probe
//! performs the initial subscription.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::master::{EventSource, MasterProbe, Subscription};

struct LivenessState {
    alive: bool,
    subscriptions: Vec<Box<dyn Subscription>>,
}

pub struct LivenessMonitor {
    probe: Arc<dyn MasterProbe>,
    sources: Vec<Arc<dyn EventSource>>,
    state: Mutex<LivenessState>,
    alive_tx: watch::Sender<bool>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        probe: Arc<dyn MasterProbe>,
        sources: Vec<Arc<dyn EventSource>>,
        interval: Duration,
    ) -> Self {
        let (alive_tx, _) = watch::channel(false);
        Self {
            probe,
            sources,
            state: Mutex::new(LivenessState {
                alive: false,
                subscriptions: Vec::new(),
            }),
            alive_tx,
            interval,
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.alive_tx.borrow()
    }

    pub fn subscribe_liveness(&self) -> watch::Receiver<bool> {
        self.alive_tx.subscribe()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe the master once and apply any resulting transition. Returns the
    /// liveness after the probe. Concurrent probes are serialized.
    pub async fn probe(&self) -> bool {
        let mut state = self.state.lock().await;
        let reachable = self.probe.probe().await;

        match (state.alive, reachable) {
            (false, true) => match self.subscribe_all().await {
                Ok(subscriptions) => {
                    state.alive = true;
                    state.subscriptions = subscriptions;
                    self.alive_tx.send_replace(true);
                    tracing::info!(at = %Utc::now(), "Qmaster is up, event subscriptions opened");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Qmaster reachable but subscribing failed");
                }
            },
            (true, false) => {
                state.alive = false;
                let subscriptions = std::mem::take(&mut state.subscriptions);
                tracing::warn!(at = %Utc::now(), "Qmaster is down, closing event subscriptions");
                close_all(subscriptions).await;
                // Observers see "down" only once nothing is subscribed.
                self.alive_tx.send_replace(false);
            }
            _ => {}
        }

        state.alive
    }

    async fn subscribe_all(&self) -> Result<Vec<Box<dyn Subscription>>> {
        let mut opened = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.subscribe().await {
                Ok(subscription) => opened.push(subscription),
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "Subscription failed");
                    close_all(opened).await;
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    /// Block until the master is reachable, re-probing on the monitor interval.
    pub async fn wait_until_alive(&self) {
        while !self.probe().await {
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Probe on a fixed interval until `shutdown` fires, then drop all
    /// subscriptions.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe().await;
                }
            }
        }

        let mut state = self.state.lock().await;
        state.alive = false;
        close_all(std::mem::take(&mut state.subscriptions)).await;
        self.alive_tx.send_replace(false);
        tracing::info!("Liveness monitor stopped");
    }
}

async fn close_all(subscriptions: Vec<Box<dyn Subscription>>) {
    for subscription in subscriptions {
        if let Err(e) = subscription.close().await {
            tracing::warn!(error = %e, "Failed to close event subscription");
        }
    }
}
