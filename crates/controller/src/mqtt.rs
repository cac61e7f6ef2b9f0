use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{parse_inbound, CommandQueue, StatusTag};
use crate::config::{Config, MqttConfig};

/// Pause before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

const NEVER: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// "smartmeter/<device_id>/pub/controlcomm/message"
pub(crate) fn publish_topic(device_id: &str) -> String {
    format!("smartmeter/{device_id}/pub/controlcomm/message")
}

/// "smartmeter/<device_id>-<address>/sub/controlcomm/message"
pub(crate) fn subscribe_topic(device_id: &str, address: u8) -> String {
    format!("smartmeter/{device_id}-{address}/sub/controlcomm/message")
}

pub(crate) fn subscribe_topics(cfg: &Config) -> Vec<String> {
    cfg.addresses
        .iter()
        .map(|&a| subscribe_topic(&cfg.device_id, a))
        .collect()
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

const REPORT_TYPE: &str = "device_report";

/// Periodic per-meter reading.
#[derive(Debug, Serialize)]
pub(crate) struct TelemetryReport {
    #[serde(rename = "type")]
    kind: &'static str,
    device: u8,
    #[serde(rename = "cumulative_flow_L")]
    cumulative_flow_l: u32,
    target_flow: u32,
}

impl TelemetryReport {
    pub(crate) fn new(device: u8, cumulative: u32, target: u32) -> Self {
        Self {
            kind: REPORT_TYPE,
            device,
            cumulative_flow_l: cumulative,
            target_flow: target,
        }
    }
}

/// Answer to one processed operator command.
#[derive(Debug, Serialize)]
pub(crate) struct StatusReport<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    device: &'a str,
    status: StatusTag,
}

impl<'a> StatusReport<'a> {
    pub(crate) fn new(device: &'a str, status: StatusTag) -> Self {
        Self {
            kind: REPORT_TYPE,
            device,
            status,
        }
    }
}

// ---------------------------------------------------------------------------
// PubSub seam
// ---------------------------------------------------------------------------

/// Outbound side of the pub/sub link as the worker sees it.
pub(crate) trait PubSub: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Whether the broker connection is currently usable.
    fn ping(&self) -> bool;
}

pub(crate) fn publish_json<T: Serialize>(link: &dyn PubSub, topic: &str, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    link.publish(topic, payload)
}

// ---------------------------------------------------------------------------
// Connection health
// ---------------------------------------------------------------------------

/// Written by the listener as broker traffic arrives, read by the worker.
#[derive(Debug)]
pub(crate) struct LinkHealth {
    epoch: Instant,
    connected: AtomicBool,
    last_traffic_ms: AtomicU64,
}

impl LinkHealth {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            connected: AtomicBool::new(false),
            last_traffic_ms: AtomicU64::new(NEVER),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.mark_traffic();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_traffic(&self) {
        self.last_traffic_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connected, and heard from the broker within `window`.
    pub(crate) fn is_healthy(&self, window: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        let last = self.last_traffic_ms.load(Ordering::SeqCst);
        last != NEVER && self.now_ms().saturating_sub(last) <= window.as_millis() as u64
    }
}

// ---------------------------------------------------------------------------
// rumqttc adapter
// ---------------------------------------------------------------------------

pub(crate) fn client_options(cfg: &Config) -> MqttOptions {
    let m: &MqttConfig = &cfg.mqtt;
    let mut opts = MqttOptions::new(cfg.device_id.clone(), m.host.clone(), m.port);
    opts.set_keep_alive(Duration::from_secs(m.keep_alive_secs));
    if let Some(user) = &m.username {
        opts.set_credentials(user.clone(), m.password.clone().unwrap_or_default());
    }
    opts
}

pub(crate) struct MqttLink {
    client: AsyncClient,
    health: Arc<LinkHealth>,
    keep_alive: Duration,
}

impl MqttLink {
    pub(crate) fn new(client: AsyncClient, health: Arc<LinkHealth>, keep_alive: Duration) -> Self {
        Self {
            client,
            health,
            keep_alive,
        }
    }
}

impl PubSub for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("failed to queue publish on {topic}"))
    }

    fn ping(&self) -> bool {
        self.health.is_healthy(self.keep_alive * 2)
    }
}

/// Parse one inbound payload and queue it. Anything unparseable is logged and
/// dropped.
pub(crate) fn dispatch_inbound(
    topic: &str,
    payload: &[u8],
    addresses: &[u8],
    queue: &CommandQueue,
) -> bool {
    match parse_inbound(payload, addresses) {
        Ok(cmd) => {
            info!(topic, address = cmd.address, kind = %cmd.kind, "command queued");
            queue.push(cmd);
            true
        }
        Err(e) => {
            warn!(topic, error = format!("{e:#}"), "inbound message dropped");
            false
        }
    }
}

/// Everything the listener thread needs.
pub(crate) struct Listener {
    pub(crate) client: AsyncClient,
    pub(crate) eventloop: EventLoop,
    pub(crate) topics: Vec<String>,
    pub(crate) addresses: Vec<u8>,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) health: Arc<LinkHealth>,
}

impl Listener {
    /// Drive the event loop on a current-thread runtime. Only returns if the
    /// runtime cannot be built.
    pub(crate) fn run(self) -> Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build listener runtime")?;
        rt.block_on(self.listen());
        Ok(())
    }

    async fn listen(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    self.health.mark_connected();
                    for topic in &self.topics {
                        let subscribed =
                            self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce);
                        if let Err(e) = subscribed {
                            warn!(%topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.health.mark_traffic();
                    dispatch_inbound(&p.topic, &p.payload, &self.addresses, &self.queue);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) | Ok(Event::Incoming(Packet::PingResp)) => {
                    self.health.mark_traffic();
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("mqtt disconnected");
                    self.health.mark_disconnected();
                }
                Ok(other) => debug!(?other, "mqtt event"),
                Err(e) => {
                    warn!(error = %e, "mqtt error, reconnecting");
                    self.health.mark_disconnected();
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::config::test_config;

    // -- topics -------------------------------------------------------------

    #[test]
    fn publish_topic_format() {
        assert_eq!(
            publish_topic("FQX_SM_10006"),
            "smartmeter/FQX_SM_10006/pub/controlcomm/message"
        );
    }

    #[test]
    fn subscribe_topic_format() {
        assert_eq!(
            subscribe_topic("FQX_SM_10006", 13),
            "smartmeter/FQX_SM_10006-13/sub/controlcomm/message"
        );
    }

    #[test]
    fn subscribe_topics_one_per_address() {
        let cfg = test_config();
        assert_eq!(
            subscribe_topics(&cfg),
            vec![
                "smartmeter/FQX_SM_10006-12/sub/controlcomm/message".to_string(),
                "smartmeter/FQX_SM_10006-13/sub/controlcomm/message".to_string(),
            ]
        );
    }

    // -- payloads -----------------------------------------------------------

    #[test]
    fn telemetry_report_shape() {
        let v = serde_json::to_value(TelemetryReport::new(13, 500, 700)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "device_report",
                "device": 13,
                "cumulative_flow_L": 500,
                "target_flow": 700
            })
        );
    }

    #[test]
    fn status_report_shape() {
        let v = serde_json::to_value(StatusReport::new("FQX_SM_10006-13", StatusTag::LoadSuccess))
            .unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "device_report",
                "device": "FQX_SM_10006-13",
                "status": "load_success"
            })
        );
    }

    // -- health -------------------------------------------------------------

    #[test]
    fn health_starts_unhealthy() {
        let h = LinkHealth::new();
        assert!(!h.is_connected());
        assert!(!h.is_healthy(Duration::from_secs(60)));
    }

    #[test]
    fn health_connected_with_recent_traffic() {
        let h = LinkHealth::new();
        h.mark_connected();
        assert!(h.is_healthy(Duration::from_secs(60)));
    }

    #[test]
    fn health_stale_traffic_is_unhealthy() {
        let h = LinkHealth::new();
        h.mark_connected();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!h.is_healthy(Duration::from_millis(5)));
        h.mark_traffic();
        assert!(h.is_healthy(Duration::from_millis(500)));
    }

    #[test]
    fn health_disconnect_clears() {
        let h = LinkHealth::new();
        h.mark_connected();
        h.mark_disconnected();
        assert!(!h.is_healthy(Duration::from_secs(60)));
    }

    // -- adapter ------------------------------------------------------------

    #[test]
    fn client_options_carry_credentials_and_keep_alive() {
        let mut cfg = test_config();
        cfg.mqtt.username = Some("meter".into());
        cfg.mqtt.password = Some("secret".into());
        cfg.mqtt.keep_alive_secs = 45;
        let opts = client_options(&cfg);
        assert_eq!(opts.client_id(), "FQX_SM_10006");
        assert_eq!(opts.keep_alive(), Duration::from_secs(45));
        assert_eq!(
            opts.credentials(),
            Some(("meter".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn mqtt_link_queues_publish_without_connection() {
        let cfg = test_config();
        let (client, _eventloop) = AsyncClient::new(client_options(&cfg), 10);
        let link = MqttLink::new(client, Arc::new(LinkHealth::new()), Duration::from_secs(30));
        let report = TelemetryReport::new(12, 1, 2);
        assert!(publish_json(&link, &publish_topic(&cfg.device_id), &report).is_ok());
        assert!(!link.ping());
    }

    // -- dispatch -----------------------------------------------------------

    #[test]
    fn dispatch_queues_valid_command() {
        let q = CommandQueue::new();
        let ok = dispatch_inbound(
            "smartmeter/FQX_SM_10006-13/sub/controlcomm/message",
            br#"{"message":"valve_close","litres":null,"deviceID":"FQX_SM_10006-13"}"#,
            &[12, 13],
            &q,
        );
        assert!(ok);
        assert_eq!(q.pop().unwrap().kind, CommandKind::ValveClose);
    }

    #[test]
    fn dispatch_drops_malformed() {
        let q = CommandQueue::new();
        assert!(!dispatch_inbound("t", b"{oops", &[12], &q));
        assert!(q.is_empty());
    }
}
