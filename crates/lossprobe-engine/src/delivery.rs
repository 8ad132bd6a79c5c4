// Drains a publish client's delivery reports.
use crate::Telemetry;
use lossprobe_client::DeliveryEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
}

pub struct DeliveryHandler {
    events: mpsc::Receiver<DeliveryEvent>,
    telemetry: Telemetry,
}

impl DeliveryHandler {
    pub fn new(events: mpsc::Receiver<DeliveryEvent>, telemetry: Telemetry) -> Self {
        Self { events, telemetry }
    }

    /// Consume reports until the channel closes or `shutdown` fires; reports
    /// already queued at shutdown are still counted.
    pub async fn run(mut self, shutdown: CancellationToken) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event, &mut stats),
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    while let Ok(event) = self.events.try_recv() {
                        self.handle(event, &mut stats);
                    }
                    break;
                }
            }
        }
        tracing::debug!(
            delivered = stats.delivered,
            failed = stats.failed,
            "delivery handler finished"
        );
        stats
    }

    fn handle(&self, event: DeliveryEvent, stats: &mut DeliveryStats) {
        match event {
            DeliveryEvent::Delivered(message) => {
                stats.delivered += 1;
                tracing::trace!(placement = %message.partition_info(), "delivered");
            }
            DeliveryEvent::Failed { message, error } => {
                stats.failed += 1;
                self.telemetry.delivery_failed();
                tracing::warn!(placement = %message.partition_info(), %error, "delivery failed");
            }
        }
    }
}
