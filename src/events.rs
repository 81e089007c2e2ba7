//! Request event records and asynchronous shipping to the streaming log.
//!
//! One JSON record is produced per completed (or failed) request, keyed by
//! client IP so a single source lands on a single partition. Shipping is
//! fire-and-forget: a task is spawned per event and the request path never
//! waits on the producer. Delivery is best-effort — leader ack, bounded
//! retries, log-and-drop on final failure — because the downstream is an
//! advisory analytics pipeline, not a system of record.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::flow::TrafficFeatures;

/// Upper bound on a single produce attempt, including the producer's
/// internal retries.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// One structured record per request, as consumed by the anomaly engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub url: String,
    pub user_agent: String,
    pub status: u16,
    pub duration_ms: u64,
    pub request_size: u64,
    pub response_size: u64,
    pub protocol: String,
    pub features: TrafficFeatures,
}

/// Kafka producer wrapper for request events.
///
/// The producer is shared and internally synchronized; `ship` can be called
/// from any number of tasks. An in-flight gauge lets shutdown drain pending
/// sends before the producer is dropped.
pub struct EventShipper {
    producer: FutureProducer,
    topic: String,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl EventShipper {
    /// Build the producer. Fails fast on malformed broker configuration so
    /// startup can abort before the listener binds.
    pub fn new(brokers: &[String], topic: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("client.id", "aegis-zero-proxy")
            // Leader ack trades durability for throughput; the consumer is
            // advisory analytics, not a system of record
            .set("acks", "1")
            .set("message.send.max.retries", "3")
            .set("message.timeout.ms", "10000")
            .create()
            .context("failed to create Kafka producer")?;

        Ok(Self {
            producer,
            topic: topic.to_owned(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        })
    }

    /// Submit an event for delivery without blocking the caller.
    ///
    /// Spawns a send task per event; after the producer's retries are
    /// exhausted the event is logged and dropped.
    pub fn ship(&self, event: RequestEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize request event, dropping");
                return;
            }
        };

        // Completion callbacks can run during teardown, outside a runtime
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(client_ip = %event.client_ip, "no runtime available, dropping request event");
            return;
        };

        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let key = event.client_ip.clone();
        let status = event.status;
        let in_flight = self.in_flight.clone();
        let drained = self.drained.clone();

        in_flight.fetch_add(1, Ordering::SeqCst);
        handle.spawn(async move {
            let record = FutureRecord::to(&topic).key(&key).payload(&payload);
            match producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
                Ok((partition, offset)) => {
                    debug!(client_ip = %key, status, partition, offset, "request event shipped");
                }
                Err((e, _)) => {
                    warn!(client_ip = %key, status, error = %e, "failed to ship request event, dropping");
                }
            }
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });
    }

    /// Number of send tasks currently in flight.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for in-flight sends to finish, bounded by `grace`, then flush
    /// the producer's local queue.
    pub async fn close(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    pending = self.pending(),
                    "shutdown grace elapsed with event sends still in flight"
                );
                break;
            }
        }

        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(error = %e, "Kafka producer flush failed during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> RequestEvent {
        RequestEvent {
            timestamp: Utc::now(),
            client_ip: "10.0.0.9".into(),
            method: "GET".into(),
            url: "/api/v1/status?verbose=1".into(),
            user_agent: "curl/8.5.0".into(),
            status: 200,
            duration_ms: 12,
            request_size: 600,
            response_size: 2048,
            protocol: "HTTP/1.1".into(),
            features: TrafficFeatures {
                total_fwd_packets: 3,
                subflow_fwd_packets: 3,
                fwd_iat_mean: 1000.0,
                ..TrafficFeatures::default()
            },
        }
    }

    #[test]
    fn event_serializes_with_schema_field_names() {
        let value = serde_json::to_value(sample_event()).unwrap();

        for field in [
            "timestamp",
            "client_ip",
            "method",
            "url",
            "user_agent",
            "status",
            "duration_ms",
            "request_size",
            "response_size",
            "protocol",
            "features",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }

        let features = value.get("features").unwrap();
        for field in [
            "bwd_packet_length_std",
            "bwd_packet_length_mean",
            "avg_packet_size",
            "flow_bytes_s",
            "flow_packets_s",
            "fwd_iat_mean",
            "fwd_iat_max",
            "fwd_iat_min",
            "fwd_iat_total",
            "total_fwd_packets",
            "subflow_fwd_packets",
        ] {
            assert!(features.get(field).is_some(), "missing feature {field}");
        }
        assert!(features.get("total_fwd_packets").unwrap().is_u64());
        assert!(features.get("fwd_iat_mean").unwrap().is_f64());
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let value = serde_json::to_value(sample_event()).unwrap();
        let ts = value.get("timestamp").unwrap().as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(ts).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[tokio::test]
    async fn shipper_tolerates_unreachable_brokers() {
        let shipper = EventShipper::new(&["127.0.0.1:1".into()], "request-logs").unwrap();
        shipper.ship(sample_event());
        // The send fails in the background after its timeout; close must
        // return without hanging on the dead broker
        shipper.close(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    #[ignore] // Requires a Kafka broker on localhost:9092
    async fn shipper_delivers_to_local_broker() {
        let shipper = EventShipper::new(&["localhost:9092".into()], "request-logs").unwrap();
        shipper.ship(sample_event());
        shipper.close(Duration::from_secs(15)).await;
        assert_eq!(shipper.pending(), 0);
    }
}
