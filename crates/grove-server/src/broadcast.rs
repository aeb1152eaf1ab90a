use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use grove_core::Event;
use grove_telemetry::{names, MetricsRecorder};
use tracing::{debug, error, warn};

use crate::registry::{Channel, ChannelRegistry, DeliveryError};

/// Outcome of one fan-out pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Pushes events to registered channels. One slow or dead channel never
/// holds up or fails the others.
pub struct Broadcaster {
    registry: Arc<ChannelRegistry>,
    send_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        send_timeout: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            registry,
            send_timeout,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Deliver `event` to every channel registered when the call starts.
    /// Channels whose delivery failed are unregistered after the pass.
    pub async fn broadcast_to_all(&self, event: &Event) -> BroadcastReport {
        let channels = self.registry.snapshot();
        if channels.is_empty() {
            return BroadcastReport::default();
        }

        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(action = event.action(), error = %e, "failed to serialize event");
                return BroadcastReport::default();
            }
        };

        let started = Instant::now();
        let timeout = self.send_timeout;
        let outcomes = join_all(channels.iter().map(|channel| {
            let payload = payload.clone();
            async move { (channel, channel.deliver(payload, timeout).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (channel, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(channel_id = %channel.id(), action = event.action(), error = %e, "delivery failed, evicting channel");
                    failed.push(channel);
                }
            }
        }

        for channel in failed {
            if self.registry.unregister(channel.id()) {
                report.evicted += 1;
            }
        }

        self.metrics.counter_inc(names::BROADCAST_TOTAL, &[], 1);
        self.metrics
            .counter_inc(names::BROADCAST_DELIVERIES_TOTAL, &[], report.delivered as u64);
        if report.evicted > 0 {
            self.metrics
                .counter_inc(names::BROADCAST_EVICTIONS_TOTAL, &[], report.evicted as u64);
        }
        self.metrics.histogram_observe(
            names::BROADCAST_DURATION_MS,
            &[],
            started.elapsed().as_secs_f64() * 1000.0,
        );

        debug!(
            action = event.action(),
            delivered = report.delivered,
            evicted = report.evicted,
            "broadcast complete"
        );
        report
    }

    /// Deliver `event` to a single channel. The failure goes back to the
    /// caller; the registry is left untouched.
    pub async fn send_to_one(&self, event: &Event, channel: &Channel) -> Result<(), DeliveryError> {
        let payload = event.to_json()?;
        channel.deliver(payload, self.send_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup(timeout_ms: u64) -> (Broadcaster, Arc<ChannelRegistry>, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::in_memory());
        let registry = Arc::new(ChannelRegistry::new(metrics.clone()));
        let broadcaster = Broadcaster::new(
            registry.clone(),
            Duration::from_millis(timeout_ms),
            metrics.clone(),
        );
        (broadcaster, registry, metrics)
    }

    fn open(registry: &ChannelRegistry, queue: usize) -> (Arc<Channel>, mpsc::Receiver<String>) {
        let (channel, rx) = Channel::new(queue);
        registry.register(channel.clone());
        (channel, rx)
    }

    fn action_of(raw: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        value["action"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn empty_registry_is_noop() {
        let (broadcaster, _registry, metrics) = setup(50);
        let report = broadcaster
            .broadcast_to_all(&Event::client_disconnected(0))
            .await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(metrics.counter_get(names::BROADCAST_TOTAL, &[]), 0);
    }

    #[tokio::test]
    async fn every_channel_receives_the_event() {
        let (broadcaster, registry, _metrics) = setup(50);
        let (_a, mut rx_a) = open(&registry, 8);
        let (_b, mut rx_b) = open(&registry, 8);

        let report = broadcaster.broadcast_to_all(&Event::error("x")).await;
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 0 });
        assert_eq!(action_of(&rx_a.recv().await.unwrap()), "error");
        assert_eq!(action_of(&rx_b.recv().await.unwrap()), "error");
    }

    #[tokio::test]
    async fn closed_channel_is_evicted_and_others_still_receive() {
        let (broadcaster, registry, metrics) = setup(50);
        let (_a, mut rx_a) = open(&registry, 8);
        let (dead, rx_dead) = open(&registry, 8);
        let (_c, mut rx_c) = open(&registry, 8);
        drop(rx_dead);

        let report = broadcaster
            .broadcast_to_all(&Event::client_disconnected(3))
            .await;

        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 1 });
        assert_eq!(registry.count(), 2);
        assert!(!registry.contains(dead.id()));
        assert!(dead.is_closed());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert_eq!(metrics.counter_get(names::BROADCAST_EVICTIONS_TOTAL, &[]), 1);
        assert_eq!(metrics.counter_get(names::BROADCAST_DELIVERIES_TOTAL, &[]), 2);
    }

    #[tokio::test]
    async fn stalled_channel_times_out_without_blocking_others() {
        let (broadcaster, registry, _metrics) = setup(30);
        let (_fast, mut rx_fast) = open(&registry, 8);
        let (slow, _rx_slow) = open(&registry, 1);
        slow.deliver("fill".into(), Duration::from_millis(10)).await.unwrap();

        let started = Instant::now();
        let report = broadcaster.broadcast_to_all(&Event::error("x")).await;

        assert_eq!(report, BroadcastReport { delivered: 1, evicted: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(rx_fast.try_recv().is_ok());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn membership_changes_during_a_pass_apply_to_the_next_one() {
        let (broadcaster, registry, metrics) = setup(200);
        let broadcaster = Arc::new(broadcaster);
        let (_a, mut rx_a) = open(&registry, 8);
        let (b, _rx_b) = open(&registry, 8);
        let (slow, _rx_slow) = open(&registry, 1);
        slow.deliver("fill".into(), Duration::from_millis(10)).await.unwrap();

        let pass = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.broadcast_to_all(&Event::error("x")).await })
        };

        // A has its copy, so the pass is underway and waiting on the slow channel.
        assert_eq!(action_of(&rx_a.recv().await.unwrap()), "error");
        let (late, mut rx_late) = open(&registry, 8);
        assert!(registry.unregister(b.id()));
        assert!(registry.unregister(slow.id()));

        let report = pass.await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 0 });
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(late.id()));
        assert!(rx_late.try_recv().is_err());
        assert!(slow.is_closed());
        assert_eq!(metrics.counter_get(names::BROADCAST_EVICTIONS_TOTAL, &[]), 0);

        let report = broadcaster.broadcast_to_all(&Event::error("y")).await;
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 0 });
        assert_eq!(action_of(&rx_late.recv().await.unwrap()), "error");
    }

    #[tokio::test]
    async fn unregistered_channel_is_skipped() {
        let (broadcaster, registry, _metrics) = setup(50);
        let (gone, rx_gone) = open(&registry, 8);
        drop(rx_gone);
        registry.unregister(gone.id());

        let report = broadcaster.broadcast_to_all(&Event::error("x")).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn send_to_one_targets_a_single_channel() {
        let (broadcaster, registry, _metrics) = setup(50);
        let (a, mut rx_a) = open(&registry, 8);
        let (_b, mut rx_b) = open(&registry, 8);

        broadcaster
            .send_to_one(&Event::connection_established(2), &a)
            .await
            .unwrap();
        assert_eq!(action_of(&rx_a.recv().await.unwrap()), "connection_established");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_one_propagates_failure_and_keeps_registry() {
        let (broadcaster, registry, _metrics) = setup(50);
        let (a, rx_a) = open(&registry, 8);
        drop(rx_a);

        let err = broadcaster
            .send_to_one(&Event::pong(None), &a)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Closed));
        assert_eq!(registry.count(), 1);
    }
}
