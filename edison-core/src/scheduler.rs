//! Telemetry send scheduling
//!
//! ## Overview
//!
//! The telemetry lesson sends a fixed number of messages, one at a time.
//! A message is only handed to the transport when:
//!
//! 1. the previous one has been confirmed (or failed), and
//! 2. at least `interval` has passed since the previous send.
//!
//! The loop keeps running until every message has been sent *and* the last
//! one has been settled.
//!
//! ```text
//!        should_send()            confirm()
//!  Idle ─────────────▶ Pending ─────────────▶ Idle ... ─▶ Done
//!   │  mark_sent()                                        ▲
//!   └── send_rejected() (id consumed, stays Idle) ────────┘
//! ```
//!
//! Time is passed in rather than read so the same state machine runs against
//! a real clock or a test clock.

use std::time::Duration;

use crate::time::Timestamp;

/// Decides when the next telemetry message may go out
#[derive(Debug, Clone)]
pub struct SendScheduler {
    max_messages: u32,
    interval_ms: u64,
    next_message_id: u32,
    last_sent_at: Option<Timestamp>,
    pending: bool,
    ack_timeout_ms: Option<u64>,
    confirmed: u32,
    failed: u32,
}

impl SendScheduler {
    /// Schedule `max_messages` sends at least `interval` apart
    pub fn new(max_messages: u32, interval: Duration) -> Self {
        Self {
            max_messages,
            interval_ms: interval.as_millis() as u64,
            next_message_id: 1,
            last_sent_at: None,
            pending: false,
            ack_timeout_ms: None,
            confirmed: 0,
            failed: 0,
        }
    }

    /// Give up on a pending message after `timeout`
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Fail the pending message if its ack is overdue at `now`.
    ///
    /// Returns true when a message was expired.
    pub fn expire_pending(&mut self, now: Timestamp) -> bool {
        let (Some(timeout), Some(sent)) = (self.ack_timeout_ms, self.last_sent_at) else {
            return false;
        };
        if self.pending && sent.saturating_add(timeout) <= now {
            self.pending = false;
            self.failed += 1;
            return true;
        }
        false
    }

    /// Whether a new message should be handed over at `now`
    pub fn should_send(&self, now: Timestamp) -> bool {
        if self.pending || self.next_message_id > self.max_messages {
            return false;
        }

        match self.last_sent_at {
            Some(last) => last.saturating_add(self.interval_ms) <= now,
            None => true,
        }
    }

    /// Record a successful hand-over, returning the message id used
    pub fn mark_sent(&mut self, now: Timestamp) -> u32 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.last_sent_at = Some(now);
        self.pending = true;
        id
    }

    /// Id the next message will carry
    pub fn next_message_id(&self) -> u32 {
        self.next_message_id
    }

    /// The transport refused the message; move on without waiting for an ack
    pub fn send_rejected(&mut self) {
        self.next_message_id += 1;
        self.failed += 1;
    }

    /// Settle the pending message
    pub fn confirm(&mut self, ok: bool) {
        if !self.pending {
            log::warn!("Confirmation received with no message pending");
        }
        self.pending = false;
        if ok {
            self.confirmed += 1;
        } else {
            self.failed += 1;
        }
    }

    /// A message is waiting for confirmation
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// The loop still has work: messages left to send or one awaiting an ack
    pub fn is_running(&self) -> bool {
        self.next_message_id <= self.max_messages || self.pending
    }

    /// Messages confirmed by the hub
    pub fn confirmed(&self) -> u32 {
        self.confirmed
    }

    /// Messages that failed, either at hand-over or confirmation
    pub fn failed(&self) -> u32 {
        self.failed
    }
}
