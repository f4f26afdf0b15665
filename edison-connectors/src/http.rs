//! HTTPS Client for IoT Hub - REST Device API
//!
//! ## Overview
//!
//! The HTTP transport needs no persistent connection, which suits networks
//! that only let HTTPS out. The price is polling: cloud-to-device messages
//! are only seen when the device asks for them.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | Send telemetry | `POST /devices/<id>/messages/events` |
//! | Receive        | `GET /devices/<id>/messages/deviceBound` (204 = nothing queued) |
//! | Complete       | `DELETE /devices/<id>/messages/deviceBound/<etag>` |
//! | Reject         | `DELETE /devices/<id>/messages/deviceBound/<etag>?reject` |
//! | Abandon        | `POST /devices/<id>/messages/deviceBound/<etag>/abandon` |
//!
//! Every request carries `api-version` and a SAS token in `Authorization`.
//!
//! ## Design Decisions
//!
//! - `ureq` is blocking, so every request runs on tokio's blocking pool
//! - 5xx, 429 and transport errors are retried with exponential backoff;
//!   other 4xx are final
//! - Telemetry results are queued and reported by the next `do_work`, the
//!   same way the MQTT transport reports PUBACKs
//! - Polls are throttled by `min_polling_time`
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use edison_connectors::http::{HttpConfig, HttpHubClient};
//! use edison_connectors::{HubClient, HubOption};
//! use edison_core::ConnectionString;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn: ConnectionString =
//!     "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=a2V5".parse()?;
//! let config = HttpConfig::new(&conn).timeout_secs(30).max_retries(2);
//!
//! let mut http = HttpHubClient::new(&conn, config)?;
//! http.set_option(HubOption::MinPollingTime(Duration::from_secs(1)))?;
//! let events = http.do_work().await?;
//! # Ok(())
//! # }
//! ```

use std::io::Read;
use std::time::Duration;

use edison_core::ConnectionString;
use tokio::time::Instant;

use crate::auth::{TokenProvider, DEFAULT_TOKEN_TTL};
use crate::{CloudMessage, Confirmation, ConnectionStats, Disposition, HubClient, HubError, HubEvent, HubOption, MessageId};

/// REST API version
pub const API_VERSION: &str = "2020-03-13";

/// Largest response body read into memory
const MAX_BODY_BYTES: u64 = 256 * 1024;

/// Prefix IoT Hub puts on application property headers
const APP_PROPERTY_PREFIX: &str = "iothub-app-";

/// Backoff stops doubling after this many retries (6.4 s)
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Pause before retry number `attempt`
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * (1u64 << attempt.min(MAX_BACKOFF_SHIFT)))
}

/// HTTP configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL, `https://<hub or gateway>`
    pub base_url: String,
    /// Device id used in request paths
    pub device_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Retry configuration
    pub max_retries: u32,
    /// User agent string
    pub user_agent: String,
    /// Minimum gap between receive polls
    pub min_polling_time: Duration,
    /// Lifetime of SAS tokens
    pub token_ttl: Duration,
}

impl HttpConfig {
    /// Configuration for the device in a connection string
    pub fn new(conn: &ConnectionString) -> Self {
        Self {
            base_url: format!("https://{}", conn.endpoint_host()),
            device_id: conn.device_id.clone(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            user_agent: format!("edison-lessons/{}", env!("CARGO_PKG_VERSION")),
            min_polling_time: Duration::from_secs(25 * 60),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Point at a different base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set request timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Set how often failed requests are retried
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the receive polling floor
    pub fn min_polling_time(mut self, interval: Duration) -> Self {
        self.min_polling_time = interval;
        self
    }

    fn device_url(&self, tail: &str) -> String {
        format!(
            "{}/devices/{}/messages/{tail}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.device_id)
        )
    }

    /// URL telemetry is posted to
    pub fn events_url(&self) -> String {
        format!("{}?api-version={API_VERSION}", self.device_url("events"))
    }

    /// URL polled for cloud-to-device messages
    pub fn receive_url(&self) -> String {
        format!("{}?api-version={API_VERSION}", self.device_url("deviceBound"))
    }

    /// URL that settles a received message
    pub fn settle_url(&self, lock_token: &str, disposition: Disposition) -> String {
        let message = self.device_url(&format!("deviceBound/{}", urlencoding::encode(lock_token)));
        match disposition {
            Disposition::Accepted => format!("{message}?api-version={API_VERSION}"),
            Disposition::Rejected => format!("{message}?api-version={API_VERSION}&reject"),
            Disposition::Abandoned => format!("{message}/abandon?api-version={API_VERSION}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Outgoing {
    method: &'static str,
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Reply {
    status: u16,
    etag: Option<String>,
    properties: Vec<(String, String)>,
    body: Vec<u8>,
}

enum Attempt {
    Retry(HubError),
    Fail(HubError),
}

fn perform(agent: &ureq::Agent, request: &Outgoing) -> Result<Reply, Attempt> {
    let mut call = agent.request(request.method, &request.url);
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let response = match &request.body {
        Some(body) => call.send_bytes(body),
        None => call.call(),
    };

    match response {
        Ok(resp) => read_reply(resp).map_err(Attempt::Retry),
        Err(ureq::Error::Status(code, resp)) => {
            let error = HubError::ServerError {
                status: code,
                message: resp.into_string().unwrap_or_default(),
            };
            // Server error or rate limit - retry; client error - don't
            if code >= 500 || code == 429 {
                Err(Attempt::Retry(error))
            } else {
                Err(Attempt::Fail(error))
            }
        }
        Err(ureq::Error::Transport(e)) => Err(Attempt::Retry(HubError::Request(e.to_string()))),
    }
}

fn read_reply(resp: ureq::Response) -> Result<Reply, HubError> {
    let status = resp.status();
    let etag = resp.header("etag").map(|tag| tag.trim_matches('"').to_string());
    let properties = resp
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let key = name.to_ascii_lowercase().strip_prefix(APP_PROPERTY_PREFIX)?.to_string();
            resp.header(&name).map(|value| (key, value.to_string()))
        })
        .collect();

    let mut body = Vec::new();
    resp.into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| HubError::Request(e.to_string()))?;

    Ok(Reply {
        status,
        etag,
        properties,
        body,
    })
}

/// IoT Hub client over HTTPS using a ureq agent
pub struct HttpHubClient {
    config: HttpConfig,
    agent: ureq::Agent,
    tokens: TokenProvider,
    next_id: MessageId,
    confirmations: Vec<(MessageId, Confirmation)>,
    last_poll: Option<Instant>,
    stats: ConnectionStats,
}

impl HttpHubClient {
    /// Create new HTTP client
    pub fn new(conn: &ConnectionString, config: HttpConfig) -> Result<Self, HubError> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(HubError::Config("Base URL must start with http:// or https://".into()));
        }
        if conn.x509 {
            return Err(HubError::Config(
                "X.509 authentication is not supported over HTTP".into(),
            ));
        }

        let tokens = TokenProvider::new(conn)?.with_ttl(config.token_ttl);
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build();

        Ok(Self {
            config,
            agent,
            tokens,
            next_id: 1,
            confirmations: Vec::new(),
            last_poll: None,
            stats: ConnectionStats::default(),
        })
    }

    fn request(&mut self, method: &'static str, url: String, body: Option<Vec<u8>>) -> Result<Outgoing, HubError> {
        let mut headers = Vec::new();
        if let Some(token) = self.tokens.current()? {
            headers.push(("Authorization", token));
        }
        if body.is_some() {
            headers.push(("Content-Type", "application/json".to_string()));
        }
        Ok(Outgoing {
            method,
            url,
            headers,
            body,
        })
    }

    /// Execute request with retry logic
    async fn execute(&mut self, request: Outgoing) -> Result<Reply, HubError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let agent = self.agent.clone();
            let outgoing = request.clone();
            let result = tokio::task::spawn_blocking(move || perform(&agent, &outgoing))
                .await
                .map_err(|e| HubError::Request(e.to_string()))?;

            match result {
                Ok(reply) => return Ok(reply),
                Err(Attempt::Retry(error)) => {
                    log::debug!("{} {} failed (attempt {}): {error}", request.method, request.url, attempt + 1);
                    last_error = Some(error);
                }
                Err(Attempt::Fail(error)) => return Err(error),
            }
        }

        // All retries exhausted
        Err(last_error.unwrap_or_else(|| HubError::Request("Unknown error".into())))
    }

    fn poll_due(&self) -> bool {
        match self.last_poll {
            Some(last) => last.elapsed() >= self.config.min_polling_time,
            None => true,
        }
    }

    async fn receive(&mut self) -> Result<Option<CloudMessage>, HubError> {
        let url = self.config.receive_url();
        let request = self.request("GET", url, None)?;
        let reply = self.execute(request).await?;

        if reply.status == 204 {
            return Ok(None);
        }

        self.stats.messages_received += 1;
        Ok(Some(CloudMessage {
            body: reply.body,
            properties: reply.properties,
            lock_token: reply.etag,
            topic: None,
        }))
    }
}

#[async_trait::async_trait]
impl HubClient for HttpHubClient {
    async fn send_event(&mut self, payload: Vec<u8>) -> Result<MessageId, HubError> {
        let len = payload.len() as u64;
        let url = self.config.events_url();
        let request = self.request("POST", url, Some(payload))?;

        let id = self.next_id;
        self.next_id += 1;

        let confirmation = match self.execute(request).await {
            Ok(_) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += len;
                Confirmation::Ok
            }
            Err(e) => {
                self.stats.messages_failed += 1;
                self.stats.last_error = Some(e.to_string());
                Confirmation::Error(e.to_string())
            }
        };
        self.confirmations.push((id, confirmation));
        Ok(id)
    }

    async fn do_work(&mut self) -> Result<Vec<HubEvent>, HubError> {
        let mut events: Vec<HubEvent> = self
            .confirmations
            .drain(..)
            .map(|(id, result)| HubEvent::SendConfirmed { id, result })
            .collect();

        if self.poll_due() {
            self.last_poll = Some(Instant::now());
            match self.receive().await {
                Ok(Some(message)) => events.push(HubEvent::Message(message)),
                Ok(None) => {}
                Err(e) => {
                    self.stats.last_error = Some(e.to_string());
                    if events.is_empty() {
                        return Err(e);
                    }
                    // Don't lose confirmations over a failed poll
                    log::warn!("Receive poll failed: {e}");
                }
            }
        }

        Ok(events)
    }

    async fn complete(&mut self, message: &CloudMessage, disposition: Disposition) -> Result<(), HubError> {
        let lock_token = message
            .lock_token
            .as_deref()
            .ok_or_else(|| HubError::Config("message has no lock token".into()))?;

        let url = self.config.settle_url(lock_token, disposition);
        let method = match disposition {
            Disposition::Accepted | Disposition::Rejected => "DELETE",
            Disposition::Abandoned => "POST",
        };

        let mut request = self.request(method, url, None)?;
        request.headers.push(("If-Match", format!("\"{lock_token}\"")));
        if disposition == Disposition::Abandoned {
            // Empty body, explicit length
            request.body = Some(Vec::new());
        }
        self.execute(request).await?;
        Ok(())
    }

    fn set_option(&mut self, option: HubOption) -> Result<(), HubError> {
        match option {
            HubOption::MinPollingTime(interval) => {
                self.config.min_polling_time = interval;
                Ok(())
            }
            other => Err(HubError::UnsupportedOption {
                option: other.name(),
                transport: "HTTP",
            }),
        }
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    async fn close(&mut self) -> Result<(), HubError> {
        // Stateless; only unreported confirmations could be lost
        if !self.confirmations.is_empty() {
            log::warn!("{} confirmations were never collected", self.confirmations.len());
            self.confirmations.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionString {
        "HostName=hub.azure-devices.net;DeviceId=edison one;SharedAccessKey=a2V5"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_config_builder() {
        let config = HttpConfig::new(&conn())
            .timeout_secs(60)
            .max_retries(1)
            .min_polling_time(Duration::from_secs(1));

        assert_eq!(config.base_url, "https://hub.azure-devices.net");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.min_polling_time, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_then_levels_off() {
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(6), Duration::from_millis(6_400));
        assert_eq!(backoff_delay(7), Duration::from_millis(6_400));
        assert_eq!(backoff_delay(64), Duration::from_millis(6_400));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(6_400));
    }

    #[test]
    fn urls_encode_device_id() {
        let config = HttpConfig::new(&conn());
        assert_eq!(
            config.events_url(),
            "https://hub.azure-devices.net/devices/edison%20one/messages/events?api-version=2020-03-13"
        );
        assert_eq!(
            config.receive_url(),
            "https://hub.azure-devices.net/devices/edison%20one/messages/deviceBound?api-version=2020-03-13"
        );
    }

    #[test]
    fn settle_urls() {
        let config = HttpConfig::new(&conn()).base_url("http://localhost:8080/");
        assert_eq!(
            config.settle_url("abc", Disposition::Accepted),
            "http://localhost:8080/devices/edison%20one/messages/deviceBound/abc?api-version=2020-03-13"
        );
        assert!(config.settle_url("abc", Disposition::Rejected).ends_with("&reject"));
        assert!(config
            .settle_url("abc", Disposition::Abandoned)
            .ends_with("/deviceBound/abc/abandon?api-version=2020-03-13"));
    }

    #[test]
    fn test_url_validation() {
        let conn = conn();
        let result = HttpHubClient::new(&conn, HttpConfig::new(&conn).base_url("not-a-url"));
        assert!(result.is_err());

        let result = HttpHubClient::new(&conn, HttpConfig::new(&conn));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_x509() {
        let conn: ConnectionString = "HostName=h;DeviceId=d;x509=true".parse().unwrap();
        assert!(HttpHubClient::new(&conn, HttpConfig::new(&conn)).is_err());
    }

    #[test]
    fn only_polling_option_supported() {
        let conn = conn();
        let mut client = HttpHubClient::new(&conn, HttpConfig::new(&conn)).unwrap();
        assert!(client.set_option(HubOption::MinPollingTime(Duration::from_secs(1))).is_ok());
        assert!(matches!(
            client.set_option(HubOption::TrustedCerts(Vec::new())),
            Err(HubError::UnsupportedOption { transport: "HTTP", .. })
        ));
    }

    #[tokio::test]
    async fn complete_needs_lock_token() {
        let conn = conn();
        let mut client = HttpHubClient::new(&conn, HttpConfig::new(&conn)).unwrap();
        let err = client
            .complete(&CloudMessage::new(b"{}".to_vec()), Disposition::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
