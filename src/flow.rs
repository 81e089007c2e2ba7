//! Per-client flow tracking and traffic feature extraction.
//!
//! Maintains a process-wide, sharded map from client key (textual IP) to a
//! sliding-window view of that client's traffic. The derived statistics feed
//! the anomaly-detection pipeline as ML features, so their numeric semantics
//! are part of the wire contract: window-bounded aggregates, population
//! standard deviation, microsecond inter-arrival times.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of samples retained per sliding window.
pub const FLOW_WINDOW: usize = 100;

/// Traffic characteristics extracted for the anomaly detector.
///
/// Field names and types match the feature schema the downstream consumer
/// was trained against; `subflow_fwd_packets` intentionally mirrors
/// `total_fwd_packets`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficFeatures {
    pub bwd_packet_length_std: f64,
    pub bwd_packet_length_mean: f64,
    pub avg_packet_size: f64,
    pub flow_bytes_s: f64,
    pub flow_packets_s: f64,
    pub fwd_iat_mean: f64,
    pub fwd_iat_max: f64,
    pub fwd_iat_min: f64,
    pub fwd_iat_total: f64,
    pub total_fwd_packets: u64,
    pub subflow_fwd_packets: u64,
}

/// Sliding-window state for a single client flow.
#[derive(Debug)]
pub struct FlowState {
    pub flow_start: Instant,
    pub last_forward_time: Option<Instant>,
    pub forward_sizes: VecDeque<f64>,
    pub backward_sizes: VecDeque<f64>,
    pub forward_iats: VecDeque<f64>,
    pub total_forward: u64,
    pub total_backward: u64,
}

impl FlowState {
    fn new() -> Self {
        Self {
            flow_start: Instant::now(),
            last_forward_time: None,
            forward_sizes: VecDeque::with_capacity(FLOW_WINDOW),
            backward_sizes: VecDeque::with_capacity(FLOW_WINDOW),
            forward_iats: VecDeque::with_capacity(FLOW_WINDOW),
            total_forward: 0,
            total_backward: 0,
        }
    }

    /// Instant of the most recent activity, for idle eviction.
    fn last_activity(&self) -> Instant {
        self.last_forward_time.unwrap_or(self.flow_start)
    }
}

/// Process-wide flow state, keyed by client IP.
///
/// Lookups are lock-free across keys; mutations serialize per key through
/// the entry mutex. States are created lazily on the first forward
/// observation and retained for the process lifetime unless idle eviction
/// is enabled (see [`FlowTracker::evict_idle`]).
pub struct FlowTracker {
    flows: DashMap<String, Arc<Mutex<FlowState>>>,
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTracker {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<FlowState>> {
        if let Some(state) = self.flows.get(key) {
            return state.clone();
        }
        self.flows
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(FlowState::new())))
            .clone()
    }

    /// Record a forward (client → proxy) observation and return the feature
    /// snapshot with the forward-side fields populated.
    pub fn track_request(&self, key: &str, req_size: u64) -> TrafficFeatures {
        let state = self.get_or_create(key);
        let mut flow = state.lock();

        let now = Instant::now();
        if let Some(last) = flow.last_forward_time {
            let iat = now.duration_since(last).as_micros() as f64;
            // Same-tick arrivals carry no interval information
            if iat > 0.0 {
                flow.forward_iats.push_back(iat);
            }
        }

        flow.forward_sizes.push_back(req_size as f64);
        flow.total_forward += 1;
        flow.last_forward_time = Some(now);

        trim_window(&mut flow.forward_sizes);
        trim_window(&mut flow.forward_iats);

        TrafficFeatures {
            total_fwd_packets: flow.total_forward,
            subflow_fwd_packets: flow.total_forward,
            fwd_iat_mean: mean(&flow.forward_iats),
            fwd_iat_max: max(&flow.forward_iats),
            fwd_iat_min: min(&flow.forward_iats),
            fwd_iat_total: sum(&flow.forward_iats),
            ..TrafficFeatures::default()
        }
    }

    /// Record a backward (proxy → client) observation and fill the
    /// backward-side and bidirectional fields of `features`.
    pub fn update_response_stats(&self, key: &str, resp_size: u64, features: &mut TrafficFeatures) {
        let state = self.get_or_create(key);
        let mut flow = state.lock();

        flow.backward_sizes.push_back(resp_size as f64);
        flow.total_backward += 1;
        trim_window(&mut flow.backward_sizes);

        let bwd_mean = mean(&flow.backward_sizes);
        features.bwd_packet_length_mean = bwd_mean;
        features.bwd_packet_length_std = std_dev(&flow.backward_sizes, bwd_mean);

        let total_packets = (flow.total_forward + flow.total_backward) as f64;
        let total_size = sum(&flow.forward_sizes) + sum(&flow.backward_sizes);
        if total_packets > 0.0 {
            features.avg_packet_size = total_size / total_packets;
        }

        let elapsed = flow.flow_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            features.flow_bytes_s = total_size / elapsed;
            features.flow_packets_s = total_packets / elapsed;
        }
    }

    /// Number of tracked flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flows.contains_key(key)
    }

    /// Access a flow's state, if one exists for `key`.
    pub fn get(&self, key: &str) -> Option<Arc<Mutex<FlowState>>> {
        self.flows.get(key).map(|s| s.clone())
    }

    /// Drop flows idle for longer than `idle`. Returns the number evicted.
    ///
    /// Disabled by default (`FLOW_IDLE_SECS=0`); with eviction off, states
    /// live for the process lifetime.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let before = self.flows.len();
        let Some(cutoff) = Instant::now().checked_sub(idle) else {
            return 0;
        };
        self.flows
            .retain(|_, state| state.lock().last_activity() > cutoff);
        before - self.flows.len()
    }
}

/// Derive the client key for a request.
///
/// Precedence: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// host portion of the peer address. IPv6 brackets are stripped so the key
/// matches the denylist writer's convention.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return strip_brackets(first).to_owned();
            }
        }
    }

    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let xri = xri.trim();
        if !xri.is_empty() {
            return strip_brackets(xri).to_owned();
        }
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn strip_brackets(ip: &str) -> &str {
    ip.trim_start_matches('[').trim_end_matches(']')
}

fn trim_window(window: &mut VecDeque<f64>) {
    while window.len() > FLOW_WINDOW {
        window.pop_front();
    }
}

fn sum(data: &VecDeque<f64>) -> f64 {
    data.iter().sum()
}

fn mean(data: &VecDeque<f64>) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    sum(data) / data.len() as f64
}

/// Population standard deviation over the window.
fn std_dev(data: &VecDeque<f64>, mean: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = data.iter().map(|v| (v - mean) * (v - mean)).sum();
    (sum_sq / data.len() as f64).sqrt()
}

fn max(data: &VecDeque<f64>) -> f64 {
    data.iter().copied().fold(0.0, f64::max)
}

fn min(data: &VecDeque<f64>) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().copied().fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn first_observation_yields_empty_aggregates() {
        let tracker = FlowTracker::new();
        let features = tracker.track_request("10.0.0.9", 600);

        assert_eq!(features.total_fwd_packets, 1);
        assert_eq!(features.subflow_fwd_packets, 1);
        assert_eq!(features.fwd_iat_mean, 0.0);
        assert_eq!(features.fwd_iat_max, 0.0);
        assert_eq!(features.fwd_iat_min, 0.0);
        assert_eq!(features.fwd_iat_total, 0.0);
        assert_eq!(features.bwd_packet_length_mean, 0.0);
        assert_eq!(features.bwd_packet_length_std, 0.0);
        assert_eq!(features.avg_packet_size, 0.0);
    }

    #[test]
    fn windows_stay_bounded() {
        let tracker = FlowTracker::new();
        let mut features = TrafficFeatures::default();
        for i in 0..(FLOW_WINDOW as u64 * 3) {
            features = tracker.track_request("k", 100 + i);
            tracker.update_response_stats("k", 200 + i, &mut features);
        }

        let state = tracker.get("k").unwrap();
        let flow = state.lock();
        assert_eq!(flow.forward_sizes.len(), FLOW_WINDOW);
        assert_eq!(flow.backward_sizes.len(), FLOW_WINDOW);
        assert!(flow.forward_iats.len() <= FLOW_WINDOW);
        assert_eq!(flow.total_forward, FLOW_WINDOW as u64 * 3);
        assert_eq!(flow.total_backward, FLOW_WINDOW as u64 * 3);
        assert_eq!(features.total_fwd_packets, FLOW_WINDOW as u64 * 3);
    }

    #[test]
    fn iats_are_strictly_positive() {
        let tracker = FlowTracker::new();
        for _ in 0..200 {
            tracker.track_request("iat", 100);
        }

        let state = tracker.get("iat").unwrap();
        let flow = state.lock();
        assert!(flow.forward_iats.iter().all(|&v| v > 0.0));
        assert!(flow.forward_iats.len() as u64 <= flow.total_forward - 1);
    }

    #[test]
    fn std_dev_is_zero_for_identical_responses() {
        let tracker = FlowTracker::new();
        let mut features = tracker.track_request("same", 100);
        for _ in 0..5 {
            tracker.update_response_stats("same", 512, &mut features);
        }

        assert_eq!(features.bwd_packet_length_mean, 512.0);
        assert_eq!(features.bwd_packet_length_std, 0.0);
    }

    #[test]
    fn avg_packet_size_matches_window_contents() {
        let tracker = FlowTracker::new();
        let mut features = tracker.track_request("avg", 100);
        features = tracker.track_request("avg", 300);
        tracker.update_response_stats("avg", 200, &mut features);

        // (100 + 300 + 200) / (2 fwd + 1 bwd)
        assert!((features.avg_packet_size - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_eviction_drops_stale_flows_only() {
        let tracker = FlowTracker::new();
        tracker.track_request("old", 100);
        assert_eq!(tracker.evict_idle(Duration::from_secs(600)), 0);
        assert!(tracker.contains("old"));
        assert_eq!(tracker.evict_idle(Duration::ZERO), 1);
        assert!(!tracker.contains("old"));
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*k).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        let peer = "192.0.2.1:4433".parse().ok();
        assert_eq!(client_key(&map, peer), "203.0.113.7");
    }

    #[test]
    fn client_key_falls_back_to_real_ip_then_peer() {
        let map = headers(&[("x-real-ip", "198.51.100.2")]);
        let peer = "192.0.2.1:4433".parse().ok();
        assert_eq!(client_key(&map, peer), "198.51.100.2");
        assert_eq!(client_key(&HeaderMap::new(), peer), "192.0.2.1");
    }

    #[test]
    fn client_key_strips_ipv6_brackets() {
        let map = headers(&[("x-forwarded-for", "[2001:db8::1]")]);
        assert_eq!(client_key(&map, None), "2001:db8::1");
        let peer = "[2001:db8::2]:4433".parse().ok();
        assert_eq!(client_key(&HeaderMap::new(), peer), "2001:db8::2");
    }
}
