//! MQTT client for IoT Hub
//!
//! ## Overview
//!
//! IoT Hub speaks MQTT 3.1.1 over TLS on port 8883 with a fixed topic layout:
//!
//! | Direction       | Topic                                         | QoS |
//! |-----------------|-----------------------------------------------|-----|
//! | Telemetry       | `devices/<id>/messages/events/`               | 1   |
//! | Cloud-to-device | `devices/<id>/messages/devicebound/<props>`   | 1   |
//!
//! The client id is the device id and the username is
//! `<hub>/<id>/?api-version=...`; the password is a SAS token, or empty when
//! a client certificate authenticates the device.
//!
//! ## Pumping
//!
//! The `rumqttc` event loop runs on its own task and forwards every event
//! into a bounded channel. `do_work` drains that channel without blocking,
//! so the lesson loop keeps its own cadence:
//!
//! ```text
//! ┌──────────────┐  events   ┌───────────────┐  do_work()  ┌─────────────┐
//! │ EventLoop    │──────────▶│ mpsc channel  │────────────▶│ HubEvents   │
//! │ (tokio task) │           └───────────────┘             └─────────────┘
//! └──────────────┘
//! ```
//!
//! ## Confirmations
//!
//! `publish` does not return a packet id, so ids are matched by order: every
//! handed-over message waits in a FIFO until the event loop reports the
//! outgoing PUBLISH, which binds it to that packet id. The matching PUBACK
//! confirms it.
//!
//! After a connection error the event loop reconnects by itself and resends
//! unacknowledged PUBLISHes under their original packet ids, so bindings
//! survive the error. The password is fixed per event loop, though: once the
//! SAS token it carries is due for renewal, the next error tears the link
//! down and the following call reconnects with a fresh token. Messages still
//! queued in the old loop are failed at that point.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use edison_core::ConnectionString;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::auth::{TokenProvider, DEFAULT_TOKEN_TTL};
use crate::{CloudMessage, Confirmation, ConnectionStats, Disposition, HubClient, HubError, HubEvent, HubOption, MessageId};

/// IoT Hub MQTT port
pub const MQTT_PORT: u16 = 8883;

/// API version advertised in the username
pub const API_VERSION: &str = "2021-04-12";

/// Request and event channel depth
const CHANNEL_CAPACITY: usize = 64;

/// Pause before the event loop retries a failed connection
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Grace period for a clean disconnect on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Smallest keep-alive the broker accepts
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// MQTT connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Hub name used in the username
    pub hub_host: String,
    /// Host actually connected to (hub or gateway)
    pub endpoint: String,
    /// Broker port
    pub port: u16,
    /// Device id, also the MQTT client id
    pub device_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Lifetime of SAS tokens presented as password
    pub token_ttl: Duration,
}

impl MqttConfig {
    /// Settings for the device in a connection string
    pub fn new(conn: &ConnectionString) -> Self {
        Self {
            hub_host: conn.host_name.clone(),
            endpoint: conn.endpoint_host().to_string(),
            port: MQTT_PORT,
            device_id: conn.device_id.clone(),
            keep_alive: Duration::from_secs(60),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Override the broker port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the keep-alive interval
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// MQTT username IoT Hub expects
    pub fn username(&self) -> String {
        format!("{}/{}/?api-version={}", self.hub_host, self.device_id, API_VERSION)
    }

    /// Topic telemetry is published to
    pub fn telemetry_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    /// Filter for cloud-to-device messages
    pub fn cloud_to_device_filter(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.device_id)
    }
}

/// Split the property bag off a cloud-to-device topic.
///
/// `devices/d/messages/devicebound/%24.mid=1&source=portal` yields
/// `[("$.mid", "1"), ("source", "portal")]`.
pub fn topic_properties(topic: &str) -> Vec<(String, String)> {
    const MARKER: &str = "/messages/devicebound/";

    let Some(start) = topic.find(MARKER) else {
        return Vec::new();
    };

    topic[start + MARKER.len()..]
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect()
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

enum LinkEvent {
    Event(Event),
    Error(String),
}

struct Link {
    client: AsyncClient,
    events: mpsc::Receiver<LinkEvent>,
    task: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_event_loop(mut eventloop: EventLoop, events: mpsc::Sender<LinkEvent>) {
    loop {
        let (item, failed, disconnected) = match eventloop.poll().await {
            Ok(event) => {
                let disconnected = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                (LinkEvent::Event(event), false, disconnected)
            }
            Err(e) => (LinkEvent::Error(e.to_string()), true, false),
        };

        if events.send(item).await.is_err() || disconnected {
            break;
        }
        if failed {
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

/// IoT Hub client over MQTT
pub struct MqttHubClient {
    config: MqttConfig,
    tokens: TokenProvider,
    trusted_certs: Option<Vec<u8>>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    link: Option<Link>,
    /// SAS token the current link logged in with
    password: Option<String>,
    next_id: MessageId,
    unbound: VecDeque<MessageId>,
    in_flight: HashMap<u16, MessageId>,
    connected: bool,
    stats: ConnectionStats,
}

impl MqttHubClient {
    /// Create a client; nothing connects until the first send or `do_work`
    pub fn new(conn: &ConnectionString, config: MqttConfig) -> Result<Self, HubError> {
        let tokens = TokenProvider::new(conn)?.with_ttl(config.token_ttl);

        Ok(Self {
            config,
            tokens,
            trusted_certs: None,
            client_certificate: None,
            client_key: None,
            link: None,
            password: None,
            next_id: 1,
            unbound: VecDeque::new(),
            in_flight: HashMap::new(),
            connected: false,
            stats: ConnectionStats::default(),
        })
    }

    /// The broker has acknowledged the connection
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Messages handed over but not yet settled
    pub fn outstanding(&self) -> usize {
        self.unbound.len() + self.in_flight.len()
    }

    fn options(&mut self, now: i64) -> Result<MqttOptions, HubError> {
        let mut options = MqttOptions::new(&self.config.device_id, &self.config.endpoint, self.config.port);
        options.set_keep_alive(self.config.keep_alive);

        let password = self.tokens.token(now)?;
        options.set_credentials(self.config.username(), password.clone().unwrap_or_default());

        let ca = self
            .trusted_certs
            .clone()
            .ok_or_else(|| HubError::Config("TrustedCerts must be set before connecting".into()))?;

        let client_auth = match (&self.client_certificate, &self.client_key) {
            (Some(cert), Some(key)) => Some((cert.clone().into_bytes(), key.clone().into_bytes())),
            (None, None) => None,
            _ => {
                return Err(HubError::Config(
                    "X.509 needs both a certificate and a private key".into(),
                ))
            }
        };
        if self.tokens.is_x509() && client_auth.is_none() {
            return Err(HubError::Auth("x509=true but no client certificate was set".into()));
        }

        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
        self.password = password;
        Ok(options)
    }

    /// The provider would now hand out a different token than the link uses
    fn credentials_stale(&mut self, now: i64) -> Result<bool, HubError> {
        let Some(in_use) = self.password.clone() else {
            return Ok(false);
        };
        Ok(self.tokens.token(now)?.is_some_and(|fresh| fresh != in_use))
    }

    /// Drop the link so the next call reconnects with freshly built options.
    /// Publishes still queued in the old event loop go down with it.
    fn reset_session(&mut self, reason: &str, out: &mut Vec<HubEvent>) {
        self.link = None;
        self.password = None;
        self.connected = false;

        let mut lost: Vec<MessageId> = self
            .unbound
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, id)| id))
            .collect();
        lost.sort_unstable();
        for id in lost {
            self.stats.messages_failed += 1;
            out.push(HubEvent::SendConfirmed {
                id,
                result: Confirmation::Error(reason.to_string()),
            });
        }
    }

    /// Reconnect with a new SAS token if the one in use is due for renewal
    fn renew_credentials(&mut self, now: i64, out: &mut Vec<HubEvent>) -> Result<bool, HubError> {
        if !self.credentials_stale(now)? {
            return Ok(false);
        }
        log::info!("SAS token is due for renewal, reconnecting");
        self.reset_session("connection dropped for SAS token renewal", out);
        Ok(true)
    }

    async fn link(&mut self) -> Result<&mut Link, HubError> {
        if self.link.is_none() {
            let options = self.options(chrono::Utc::now().timestamp())?;
            let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let task = tokio::spawn(run_event_loop(eventloop, tx));

            client
                .subscribe(self.config.cloud_to_device_filter(), QoS::AtLeastOnce)
                .await
                .map_err(|e| HubError::Connection(e.to_string()))?;

            log::info!(
                "Connecting to {}:{} as {}",
                self.config.endpoint,
                self.config.port,
                self.config.device_id
            );
            self.link = Some(Link {
                client,
                events: rx,
                task,
            });
        }

        self.link.as_mut().ok_or(HubError::NotConnected)
    }

    fn handle(&mut self, item: LinkEvent, out: &mut Vec<HubEvent>) {
        match item {
            LinkEvent::Event(Event::Incoming(Packet::ConnAck(ack))) => {
                log::info!("Connected to IoT Hub ({:?})", ack.code);
                self.connected = true;
            }
            LinkEvent::Event(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if self.in_flight.contains_key(&pkid) {
                    log::debug!("Resent packet {pkid}");
                } else if let Some(id) = self.unbound.pop_front() {
                    self.in_flight.insert(pkid, id);
                }
            }
            LinkEvent::Event(Event::Incoming(Packet::PubAck(ack))) => match self.in_flight.remove(&ack.pkid) {
                Some(id) => {
                    self.stats.messages_sent += 1;
                    out.push(HubEvent::SendConfirmed {
                        id,
                        result: Confirmation::Ok,
                    });
                }
                None => log::debug!("PUBACK for unknown packet {}", ack.pkid),
            },
            LinkEvent::Event(Event::Incoming(Packet::Publish(publish))) => {
                self.stats.messages_received += 1;
                out.push(HubEvent::Message(CloudMessage {
                    body: publish.payload.to_vec(),
                    properties: topic_properties(&publish.topic),
                    lock_token: None,
                    topic: Some(publish.topic),
                }));
            }
            LinkEvent::Event(event) => log::trace!("MQTT event {event:?}"),
            LinkEvent::Error(reason) => {
                log::warn!("MQTT connection error: {reason}");
                if self.connected {
                    self.stats.reconnections += 1;
                }
                self.connected = false;
                self.stats.last_error = Some(reason);
            }
        }
    }
}

#[async_trait::async_trait]
impl HubClient for MqttHubClient {
    async fn send_event(&mut self, payload: Vec<u8>) -> Result<MessageId, HubError> {
        let topic = self.config.telemetry_topic();
        let len = payload.len() as u64;

        let link = self.link().await?;
        link.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| HubError::Request(e.to_string()))?;

        let id = self.next_id;
        self.next_id += 1;
        self.unbound.push_back(id);
        self.stats.bytes_sent += len;
        Ok(id)
    }

    async fn do_work(&mut self) -> Result<Vec<HubEvent>, HubError> {
        let mut drained = Vec::new();
        let mut closed = false;
        {
            let link = self.link().await?;
            loop {
                match link.events.try_recv() {
                    Ok(item) => drained.push(item),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        let failed = drained.iter().any(|item| matches!(item, LinkEvent::Error(_)));
        let mut out = Vec::new();
        for item in drained {
            self.handle(item, &mut out);
        }

        if closed {
            log::warn!("MQTT event loop stopped");
            self.reset_session("MQTT event loop stopped", &mut out);
        } else if failed {
            self.renew_credentials(chrono::Utc::now().timestamp(), &mut out)?;
        }
        Ok(out)
    }

    async fn complete(&mut self, _message: &CloudMessage, disposition: Disposition) -> Result<(), HubError> {
        // Delivery is acknowledged with PUBACK on receipt; IoT Hub has no
        // MQTT verb for abandon or reject
        match disposition {
            Disposition::Accepted => Ok(()),
            Disposition::Abandoned => Err(HubError::UnsupportedOption {
                option: "abandon",
                transport: "MQTT",
            }),
            Disposition::Rejected => Err(HubError::UnsupportedOption {
                option: "reject",
                transport: "MQTT",
            }),
        }
    }

    fn set_option(&mut self, option: HubOption) -> Result<(), HubError> {
        if self.link.is_some() && !matches!(option, HubOption::MinPollingTime(_)) {
            return Err(HubError::Config(format!(
                "{} must be set before connecting",
                option.name()
            )));
        }

        match option {
            HubOption::TrustedCerts(pem) => self.trusted_certs = Some(pem),
            HubOption::X509Certificate(pem) => self.client_certificate = Some(pem),
            HubOption::X509PrivateKey(pem) => self.client_key = Some(pem),
            HubOption::KeepAlive(interval) => {
                if interval < MIN_KEEP_ALIVE {
                    return Err(HubError::Config(format!(
                        "keep-alive must be at least {}s",
                        MIN_KEEP_ALIVE.as_secs()
                    )));
                }
                self.config.keep_alive = interval;
            }
            HubOption::MinPollingTime(_) => {
                return Err(HubError::UnsupportedOption {
                    option: "MinimumPollingTime",
                    transport: "MQTT",
                })
            }
        }
        Ok(())
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    async fn close(&mut self) -> Result<(), HubError> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        if let Err(e) = link.client.disconnect().await {
            log::debug!("Disconnect request failed: {e}");
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut link.task).await.is_err() {
            log::debug!("Event loop did not stop within {CLOSE_TIMEOUT:?}");
        }

        self.connected = false;
        self.password = None;
        for id in self.unbound.drain(..).chain(self.in_flight.drain().map(|(_, id)| id)) {
            log::warn!("Message {id} was never confirmed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish};

    fn conn() -> ConnectionString {
        "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=a2V5"
            .parse()
            .unwrap()
    }

    fn client() -> MqttHubClient {
        let conn = conn();
        MqttHubClient::new(&conn, MqttConfig::new(&conn)).unwrap()
    }

    #[test]
    fn topics_and_username() {
        let config = MqttConfig::new(&conn());
        assert_eq!(config.username(), "hub.azure-devices.net/edison/?api-version=2021-04-12");
        assert_eq!(config.telemetry_topic(), "devices/edison/messages/events/");
        assert_eq!(config.cloud_to_device_filter(), "devices/edison/messages/devicebound/#");
        assert_eq!(config.port, 8883);
    }

    #[test]
    fn gateway_is_endpoint_but_not_username() {
        let conn: ConnectionString = "HostName=hub;DeviceId=d;SharedAccessKey=a2V5;GatewayHostName=edge"
            .parse()
            .unwrap();
        let config = MqttConfig::new(&conn);
        assert_eq!(config.endpoint, "edge");
        assert!(config.username().starts_with("hub/d/"));
    }

    #[test]
    fn parses_property_bag() {
        let props = topic_properties("devices/d/messages/devicebound/%24.mid=42&source=portal&flag");
        assert_eq!(
            props,
            vec![
                ("$.mid".to_string(), "42".to_string()),
                ("source".to_string(), "portal".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(topic_properties("devices/d/messages/devicebound/").is_empty());
        assert!(topic_properties("other/topic").is_empty());
    }

    #[test]
    fn acks_bind_in_order() {
        let mut client = client();
        client.unbound.extend([1, 2]);

        let mut out = Vec::new();
        client.handle(publish(7), &mut out);
        client.handle(publish(8), &mut out);
        client.handle(puback(8), &mut out);

        assert_eq!(
            out,
            vec![HubEvent::SendConfirmed {
                id: 2,
                result: Confirmation::Ok
            }]
        );
        assert_eq!(client.outstanding(), 1);
        assert_eq!(client.stats().messages_sent, 1);
    }

    fn connack() -> LinkEvent {
        LinkEvent::Event(Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false))))
    }

    fn publish(pkid: u16) -> LinkEvent {
        LinkEvent::Event(Event::Outgoing(Outgoing::Publish(pkid)))
    }

    fn puback(pkid: u16) -> LinkEvent {
        LinkEvent::Event(Event::Incoming(Packet::PubAck(PubAck::new(pkid))))
    }

    #[test]
    fn connection_error_keeps_bindings() {
        let mut client = client();
        client.unbound.extend([1, 2, 3]);

        let mut out = Vec::new();
        client.handle(connack(), &mut out);
        assert!(client.is_connected());

        client.handle(publish(1), &mut out);
        client.handle(publish(2), &mut out);
        client.handle(LinkEvent::Error("connection reset".into()), &mut out);

        // Nothing is failed: the event loop resends after reconnecting
        assert!(out.is_empty());
        assert_eq!(client.outstanding(), 3);
        assert!(!client.is_connected());
        assert_eq!(client.stats().reconnections, 1);
        assert_eq!(client.stats().messages_failed, 0);
        assert_eq!(client.stats().last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn resent_publish_keeps_its_message() {
        let mut client = client();
        client.unbound.push_back(1);

        let mut out = Vec::new();
        client.handle(publish(1), &mut out);
        client.handle(LinkEvent::Error("reset".into()), &mut out);
        client.unbound.push_back(2);

        // Packet 1 goes out again before the newer message
        client.handle(publish(1), &mut out);
        client.handle(publish(2), &mut out);
        client.handle(puback(1), &mut out);
        client.handle(puback(2), &mut out);

        assert_eq!(
            out,
            vec![
                HubEvent::SendConfirmed {
                    id: 1,
                    result: Confirmation::Ok
                },
                HubEvent::SendConfirmed {
                    id: 2,
                    result: Confirmation::Ok
                },
            ]
        );
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn expiring_token_is_replaced_after_connection_error() {
        let conn = conn();
        let mut config = MqttConfig::new(&conn);
        config.token_ttl = Duration::from_secs(600);
        let mut client = MqttHubClient::new(&conn, config).unwrap();
        client.set_option(HubOption::TrustedCerts(b"CA".to_vec())).unwrap();

        client.options(1_000).unwrap();
        let first = client.password.clone().unwrap();
        assert!(first.ends_with("&se=1600"));

        client.unbound.push_back(1);
        let mut out = Vec::new();
        client.handle(publish(1), &mut out);
        client.handle(LinkEvent::Error("connection reset".into()), &mut out);

        // Token still good: keep the link and its bindings
        assert!(!client.renew_credentials(1_010, &mut out).unwrap());
        assert!(out.is_empty());
        assert_eq!(client.outstanding(), 1);

        // Inside the refresh margin: drop the link
        assert!(client.renew_credentials(1_545, &mut out).unwrap());
        assert_eq!(
            out,
            vec![HubEvent::SendConfirmed {
                id: 1,
                result: Confirmation::Error("connection dropped for SAS token renewal".into())
            }]
        );
        assert_eq!(client.outstanding(), 0);
        assert!(client.password.is_none());

        // The reconnect logs in with a newly minted token
        client.options(1_545).unwrap();
        let second = client.password.clone().unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("&se=2145"));
    }

    #[test]
    fn x509_link_never_renews() {
        let conn: ConnectionString = "HostName=hub;DeviceId=d;x509=true".parse().unwrap();
        let mut client = MqttHubClient::new(&conn, MqttConfig::new(&conn)).unwrap();
        client.set_option(HubOption::TrustedCerts(b"CA".to_vec())).unwrap();
        client.set_option(HubOption::X509Certificate("CERT".into())).unwrap();
        client.set_option(HubOption::X509PrivateKey("KEY".into())).unwrap();

        client.options(1_000).unwrap();
        assert!(client.password.is_none());

        let mut out = Vec::new();
        assert!(!client.renew_credentials(1_000_000, &mut out).unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn inbound_publish_becomes_message() {
        let mut client = client();
        let publish = Publish::new(
            "devices/edison/messages/devicebound/source=portal",
            QoS::AtLeastOnce,
            br#"{"command":"blink"}"#.to_vec(),
        );

        let mut out = Vec::new();
        client.handle(LinkEvent::Event(Event::Incoming(Packet::Publish(publish))), &mut out);

        match out.as_slice() {
            [HubEvent::Message(msg)] => {
                assert_eq!(msg.body_text(), r#"{"command":"blink"}"#);
                assert_eq!(msg.property("source"), Some("portal"));
                assert!(msg.topic.is_some());
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_to_connect_without_trusted_certs() {
        let mut client = client();
        let err = client.do_work().await.unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[tokio::test]
    async fn x509_requires_certificate() {
        let conn: ConnectionString = "HostName=hub;DeviceId=d;x509=true".parse().unwrap();
        let mut client = MqttHubClient::new(&conn, MqttConfig::new(&conn)).unwrap();
        client.set_option(HubOption::TrustedCerts(b"CA".to_vec())).unwrap();
        client.set_option(HubOption::X509Certificate("CERT".into())).unwrap();

        // Key missing
        assert!(matches!(client.do_work().await.unwrap_err(), HubError::Config(_)));
    }

    #[test]
    fn option_validation() {
        let mut client = client();
        assert!(client.set_option(HubOption::KeepAlive(Duration::from_secs(1))).is_err());
        assert!(client.set_option(HubOption::KeepAlive(Duration::from_secs(30))).is_ok());
        assert!(matches!(
            client.set_option(HubOption::MinPollingTime(Duration::from_secs(1))),
            Err(HubError::UnsupportedOption { .. })
        ));
    }
}
