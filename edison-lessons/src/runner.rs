//! Lesson loops
//!
//! ## Overview
//!
//! Each lesson is one loop around a hub client's work pump:
//!
//! ```text
//! loop {
//!     maybe send          (telemetry lesson only)
//!     client.do_work()    (collect acks and inbound messages)
//!     react               (blink, stop)
//!     sleep(work_interval)
//! }
//! ```
//!
//! All waiting goes through `tokio::time`, so tests run the loops under
//! paused time and finish instantly.

use std::collections::HashMap;
use std::time::Duration;

use edison_connectors::{CloudMessage, Disposition, HubClient, HubEvent, MessageId};
use edison_core::{Command, LessonConfig, Led, OutputPin, SendScheduler, TelemetryMessage, TimeSource, Timestamp};
use tokio::time::{sleep, Instant};

use crate::error::LessonResult;

/// Milliseconds since construction on tokio's clock, so paused time applies
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: Instant,
}

impl TokioClock {
    /// Start counting from now
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioClock {
    fn now(&self) -> Timestamp {
        self.start.elapsed().as_millis() as Timestamp
    }
}

/// Light the LED for `duration`, then switch it off
pub async fn blink<P: OutputPin>(led: &mut Led<P>, duration: Duration) -> LessonResult<()> {
    led.on()?;
    sleep(duration).await;
    led.off()?;
    Ok(())
}

/// Lesson 1: blink the LED `max_blink_times` times
pub async fn run_blink<P: OutputPin>(led: &mut Led<P>, config: &LessonConfig) -> LessonResult<u32> {
    for number in 1..=config.max_blink_times {
        log::info!("#{number} Blink LED");
        blink(led, config.blink_on).await?;
        sleep(config.blink_off).await;
    }
    Ok(config.max_blink_times)
}

/// Outcome of the telemetry lesson
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySummary {
    /// Messages handed to the client
    pub sent: u32,
    /// Messages the hub acknowledged
    pub confirmed: u32,
    /// Messages refused, lost or never acknowledged
    pub failed: u32,
}

/// Lesson 3: send `max_blink_times` telemetry messages, one at a time,
/// flashing the LED for every acknowledgement
pub async fn run_telemetry<C, P>(
    client: &mut C,
    led: &mut Led<P>,
    device_id: &str,
    config: &LessonConfig,
) -> LessonResult<TelemetrySummary>
where
    C: HubClient + ?Sized,
    P: OutputPin,
{
    let clock = TokioClock::new();
    let mut scheduler =
        SendScheduler::new(config.max_blink_times, config.send_interval).with_ack_timeout(config.ack_timeout);
    let mut outstanding: HashMap<MessageId, u32> = HashMap::new();
    let mut sent = 0;

    while scheduler.is_running() {
        let now = clock.now();

        if scheduler.expire_pending(now) {
            log::error!("No confirmation from Azure IoT Hub within {:?}", config.ack_timeout);
            outstanding.clear();
        }

        if scheduler.should_send(now) {
            let message = TelemetryMessage::new(device_id, scheduler.next_message_id());
            let text = message.to_json()?;

            match client.send_event(text.clone().into_bytes()).await {
                Ok(handle) => {
                    let number = scheduler.mark_sent(now);
                    outstanding.insert(handle, number);
                    sent += 1;
                    log::info!("Sending message #{number}: {text}");
                }
                Err(e) => {
                    log::error!("Failed to hand over the message to the IoT Hub client: {e}");
                    scheduler.send_rejected();
                }
            }
        }

        match client.do_work().await {
            Ok(events) => {
                for event in events {
                    match event {
                        HubEvent::SendConfirmed { id, result } => {
                            let Some(number) = outstanding.remove(&id) else {
                                log::debug!("Ignoring late confirmation for {id}");
                                continue;
                            };
                            if result.is_ok() {
                                log::debug!("Message #{number} confirmed");
                                blink(led, config.ack_blink).await?;
                            } else {
                                log::error!("Failed to send message #{number} to Azure IoT Hub: {result:?}");
                            }
                            scheduler.confirm(result.is_ok());
                        }
                        HubEvent::Message(message) => {
                            log::info!("Received message: {}", message.body_text());
                            settle(client, &message).await;
                        }
                    }
                }
            }
            Err(e) => log::warn!("Work pump failed: {e}"),
        }

        sleep(config.work_interval).await;
    }

    client.close().await?;

    Ok(TelemetrySummary {
        sent,
        confirmed: scheduler.confirmed(),
        failed: scheduler.failed(),
    })
}

/// Outcome of the command lesson
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSummary {
    /// Cloud-to-device messages received
    pub received: u32,
    /// `blink` commands carried out
    pub blinks: u32,
    /// Messages without a usable command
    pub ignored: u32,
    /// A `stop` command ended the lesson
    pub stopped: bool,
}

/// Lesson 4: act on `blink` and `stop` commands until told to stop
pub async fn run_commands<C, P>(client: &mut C, led: &mut Led<P>, config: &LessonConfig) -> LessonResult<CommandSummary>
where
    C: HubClient + ?Sized,
    P: OutputPin,
{
    let mut summary = CommandSummary::default();

    while !summary.stopped {
        match client.do_work().await {
            Ok(events) => {
                for event in events {
                    if let HubEvent::Message(message) = event {
                        handle_command(client, led, config, &message, &mut summary).await?;
                    }
                }
            }
            Err(e) => log::warn!("Work pump failed: {e}"),
        }

        sleep(config.work_interval).await;
    }

    client.close().await?;
    Ok(summary)
}

async fn handle_command<C, P>(
    client: &mut C,
    led: &mut Led<P>,
    config: &LessonConfig,
    message: &CloudMessage,
    summary: &mut CommandSummary,
) -> LessonResult<()>
where
    C: HubClient + ?Sized,
    P: OutputPin,
{
    summary.received += 1;
    log::info!("Received message: {}", message.body_text());

    match Command::from_json(&message.body) {
        Ok(Some(Command::Blink)) => {
            blink(led, config.ack_blink).await?;
            summary.blinks += 1;
        }
        Ok(Some(Command::Stop)) => {
            log::info!("Stop command received");
            summary.stopped = true;
        }
        Ok(Some(Command::Unknown(name))) => {
            log::warn!("Unknown command '{name}'");
            summary.ignored += 1;
        }
        Ok(None) => {
            log::debug!("Message carries no command");
            summary.ignored += 1;
        }
        Err(e) => {
            log::warn!("Cannot decode message: {e}");
            summary.ignored += 1;
        }
    }

    // Everything is accepted, decodable or not, so nothing is redelivered
    settle(client, message).await;
    Ok(())
}

async fn settle<C: HubClient + ?Sized>(client: &mut C, message: &CloudMessage) {
    if let Err(e) = client.complete(message, Disposition::Accepted).await {
        log::warn!("Failed to complete message: {e}");
    }
}
