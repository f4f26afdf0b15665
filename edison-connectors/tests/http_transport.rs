//! HTTP Transport Integration Tests
//!
//! A plain `TcpListener` plays the hub: every connection gets one canned
//! response and `Connection: close`, and the request it carried is recorded
//! for inspection.

#![cfg(feature = "http")]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use edison_connectors::http::{HttpConfig, HttpHubClient, API_VERSION};
use edison_connectors::{Confirmation, Disposition, HubClient, HubEvent, HubOption};
use edison_core::ConnectionString;

const CONNECTION: &str = "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=c2VjcmV0";

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct FakeHub {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    worker: JoinHandle<()>,
}

impl FakeHub {
    /// Serve `responses` in order, one per connection
    fn start(responses: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        let worker = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let recorded = read_request(&mut BufReader::new(stream.try_clone().unwrap()));
                log.lock().unwrap().push(recorded);
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        Self {
            base_url,
            requests,
            worker,
        }
    }

    fn client(&self) -> HttpHubClient {
        let conn: ConnectionString = CONNECTION.parse().unwrap();
        let config = HttpConfig::new(&conn)
            .base_url(self.base_url.clone())
            .timeout_secs(5)
            .max_retries(1);
        HttpHubClient::new(&conn, config).unwrap()
    }

    fn finish(self) -> Vec<Recorded> {
        self.worker.join().unwrap();
        let requests = self.requests.lock().unwrap();
        requests.clone()
    }
}

fn read_request(reader: &mut impl BufRead) -> Recorded {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).unwrap();
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).unwrap();

    Recorded {
        method,
        path,
        headers,
        body,
    }
}

fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut text = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: {}\r\n", body.len());
    for (name, value) in headers {
        text.push_str(&format!("{name}: {value}\r\n"));
    }
    text.push_str("\r\n");
    text.push_str(body);
    text
}

fn no_content() -> String {
    response("204 No Content", &[], "")
}

#[tokio::test]
async fn telemetry_is_posted_and_confirmed_on_next_work() {
    let hub = FakeHub::start(vec![no_content(), no_content()]);
    let mut client = hub.client();

    let payload = br#"{"deviceId":"edison","messageId":1}"#.to_vec();
    let id = client.send_event(payload.clone()).await.unwrap();

    let events = client.do_work().await.unwrap();
    assert_eq!(
        events,
        vec![HubEvent::SendConfirmed {
            id,
            result: Confirmation::Ok
        }]
    );
    assert_eq!(client.stats().messages_sent, 1);

    let requests = hub.finish();
    assert_eq!(requests.len(), 2);

    let post = &requests[0];
    assert_eq!(post.method, "POST");
    assert_eq!(
        post.path,
        format!("/devices/edison/messages/events?api-version={API_VERSION}")
    );
    assert_eq!(post.body, payload);
    assert_eq!(post.header("content-type"), Some("application/json"));
    let auth = post.header("authorization").unwrap();
    assert!(auth.starts_with("SharedAccessSignature sr="));
    assert!(auth.contains("&sig=") && !auth.contains("&skn="));

    // The work pump polled for commands straight away
    assert_eq!(requests[1].method, "GET");
    assert!(requests[1].path.starts_with("/devices/edison/messages/deviceBound?"));
}

#[tokio::test]
async fn received_command_is_completed_with_its_etag() {
    let hub = FakeHub::start(vec![
        response(
            "200 OK",
            &[("ETag", "\"lock-1\""), ("iothub-app-source", "portal")],
            r#"{"command":"blink"}"#,
        ),
        no_content(),
    ]);
    let mut client = hub.client();

    let events = client.do_work().await.unwrap();
    let message = match events.as_slice() {
        [HubEvent::Message(message)] => message.clone(),
        other => panic!("expected one message, got {other:?}"),
    };
    assert_eq!(message.body_text(), r#"{"command":"blink"}"#);
    assert_eq!(message.lock_token.as_deref(), Some("lock-1"));
    assert_eq!(message.property("source"), Some("portal"));

    client.complete(&message, Disposition::Accepted).await.unwrap();
    assert_eq!(client.stats().messages_received, 1);

    let requests = hub.finish();
    let settle = &requests[1];
    assert_eq!(settle.method, "DELETE");
    assert_eq!(
        settle.path,
        format!("/devices/edison/messages/deviceBound/lock-1?api-version={API_VERSION}")
    );
    assert_eq!(settle.header("if-match"), Some("\"lock-1\""));
}

#[tokio::test]
async fn polls_respect_minimum_polling_time() {
    let hub = FakeHub::start(vec![no_content()]);
    let mut client = hub.client();
    client
        .set_option(HubOption::MinPollingTime(Duration::from_secs(3600)))
        .unwrap();

    assert!(client.do_work().await.unwrap().is_empty());
    // Second pump is inside the polling window, so no request goes out
    assert!(client.do_work().await.unwrap().is_empty());

    assert_eq!(hub.finish().len(), 1);
}

#[tokio::test]
async fn client_errors_are_final_and_reported_as_failed_confirmations() {
    let hub = FakeHub::start(vec![
        response("401 Unauthorized", &[], "bad token"),
        no_content(),
    ]);
    let mut client = hub.client();

    let id = client.send_event(b"{}".to_vec()).await.unwrap();
    let events = client.do_work().await.unwrap();

    match events.as_slice() {
        [HubEvent::SendConfirmed {
            id: confirmed,
            result: Confirmation::Error(reason),
        }] => {
            assert_eq!(*confirmed, id);
            assert!(reason.contains("401"));
        }
        other => panic!("expected a failed confirmation, got {other:?}"),
    }
    assert_eq!(client.stats().messages_failed, 1);

    // No retry: one POST and one poll
    assert_eq!(hub.finish().len(), 2);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let hub = FakeHub::start(vec![
        response("503 Service Unavailable", &[], ""),
        no_content(),
        no_content(),
    ]);
    let mut client = hub.client();

    client.send_event(b"{}".to_vec()).await.unwrap();
    let events = client.do_work().await.unwrap();

    assert!(matches!(
        events.as_slice(),
        [HubEvent::SendConfirmed {
            result: Confirmation::Ok,
            ..
        }]
    ));

    let requests = hub.finish();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[1].method, "POST");
}

#[test]
fn x509_devices_cannot_use_http() {
    let conn: ConnectionString = "HostName=hub.azure-devices.net;DeviceId=edison;x509=true"
        .parse()
        .unwrap();
    assert!(HttpHubClient::new(&conn, HttpConfig::new(&conn)).is_err());
}
