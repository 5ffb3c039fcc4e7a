use std::{sync::Arc, time::Duration};

use engine_api::server::EventServer;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use warden_core::{ShutdownSignal, StatsSink};

use super::rate_limiter::RateLimiter;
use crate::probe::Probe;

/// Periodically publishes the stats of every component.
pub(crate) struct StatsPublisher {
    pub(crate) probe: Arc<dyn Probe>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) event_server: EventServer,
    pub(crate) sink: Arc<dyn StatsSink>,
}

impl StatsPublisher {
    /// Publish once. A failing component doesn't prevent the others from
    /// publishing.
    pub(crate) fn publish(&self) {
        if let Err(err) = self.probe.send_stats(self.sink.as_ref()) {
            log::debug!("failed to send probe stats: {err}");
        }
        if let Err(err) = self.rate_limiter.send_stats(self.sink.as_ref()) {
            log::debug!("failed to send rate limiter stats: {err}");
        }
        if let Err(err) = self.event_server.send_stats(self.sink.as_ref()) {
            log::debug!("failed to send event server stats: {err}");
        }
    }

    pub(crate) fn spawn(self, interval: Duration, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => self.publish(),
                }
            }
            log::debug!("stats task stopped");
        })
    }
}
