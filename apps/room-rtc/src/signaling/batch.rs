use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::SignalMessage;

#[derive(Debug, PartialEq)]
pub enum Submit {
    /// Write the message now, as a singleton frame.
    SendNow(SignalMessage),
    /// The message joined the queue; `schedule_drain` is set when no drain
    /// timer is pending yet and the caller must start one.
    Queued { schedule_drain: bool },
}

/// Throttle for flood-prone message types. Queued messages leave in
/// submission order, at most `cap` per flush interval.
#[derive(Debug)]
pub struct OutboundBatcher {
    interval: Duration,
    cap: usize,
    queue: VecDeque<SignalMessage>,
    last_flush: Option<Instant>,
    drain_pending: bool,
}

impl OutboundBatcher {
    pub fn new(interval: Duration, cap: usize) -> Self {
        Self {
            interval,
            cap: cap.max(1),
            queue: VecDeque::new(),
            last_flush: None,
            drain_pending: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain_pending(&self) -> bool {
        self.drain_pending
    }

    pub fn submit(&mut self, message: SignalMessage, now: Instant) -> Submit {
        let throttled = self
            .last_flush
            .is_some_and(|flushed| now.saturating_duration_since(flushed) < self.interval);
        // a queued type must not overtake earlier queued messages
        if message.is_must_queue() && (throttled || !self.queue.is_empty()) {
            self.queue.push_back(message);
            let schedule_drain = !self.drain_pending;
            self.drain_pending = true;
            return Submit::Queued { schedule_drain };
        }
        self.last_flush = Some(now);
        Submit::SendNow(message)
    }

    /// Instant at which the pending drain should fire.
    pub fn next_drain_at(&self, now: Instant) -> Instant {
        match self.last_flush {
            Some(flushed) => flushed + self.interval,
            None => now,
        }
    }

    /// Takes up to `cap` queued messages. The flag reports whether messages
    /// remain and another drain must follow after the interval.
    pub fn drain(&mut self, now: Instant) -> (Vec<SignalMessage>, bool) {
        let take = self.queue.len().min(self.cap);
        let batch: Vec<SignalMessage> = self.queue.drain(..take).collect();
        if !batch.is_empty() {
            self.last_flush = Some(now);
        }
        let more = !self.queue.is_empty();
        self.drain_pending = more;
        (batch, more)
    }

    /// Puts a batch that could not be written back at the head of the queue.
    pub fn requeue_front(&mut self, batch: Vec<SignalMessage>) {
        for message in batch.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// Marks the drain timer as stopped while messages stay queued, e.g. when
    /// the connection is down. The next connect restarts it.
    pub fn pause(&mut self) {
        self.drain_pending = false;
    }

    pub fn resume(&mut self) -> bool {
        if self.queue.is_empty() || self.drain_pending {
            return false;
        }
        self.drain_pending = true;
        true
    }
}
