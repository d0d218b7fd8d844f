//! # Outbox: Backfill then Live
//!
//! Delivers the global event log to one subscriber, in sequence order, with
//! no gaps and no duplicates across the switch from stored to live events.
//!
//! ## The Backfill + Live Pattern
//!
//! ```text
//!  attach: subscribe to live ring, THEN sample head H
//!
//!  cursor C                     H (head at attach)
//!     │                         │
//!     ▼                         ▼
//!  ───┼─────── Backfill ────────┼────────── Live ─────────────►
//!     │  pages read from        │  events from the broadcast
//!     │  storage, seq > C       │  ring, seq > last delivered
//! ```
//!
//! Because the receiver exists before `H` is sampled, every event after `H`
//! is in the ring. Events that arrive both ways are dropped by comparing
//! against the last delivered sequence number.
//!
//! ## Backpressure
//!
//! The ring is bounded. While a subscriber backfills or consumes slowly, live
//! events pile up in it. If it overflows the subscriber gets
//! [`Error::ConsumerTooSlow`] and the stream ends; the client reconnects with
//! its last cursor and backfills from storage.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::SequencedEvent;
use crate::sequencer::LiveTail;
use crate::types::Seq;

type ReadFuture = Pin<Box<dyn Future<Output = Result<Vec<SequencedEvent>>> + Send>>;
type ReadFn = Box<dyn Fn(Seq, usize) -> ReadFuture + Send + Sync>;

/// Phase of an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboxPhase {
    /// Reading stored events.
    Backfill,
    /// Receiving live events.
    Live,
    /// Cancelled, failed, or the log shut down.
    Ended,
}

/// One subscriber's view of the event log.
pub struct Outbox {
    phase: OutboxPhase,
    /// Highest sequence number handed to the subscriber (or its cursor).
    last_delivered: Seq,
    /// Head sampled at attach; backfill stops once it is reached.
    backfill_until: Seq,
    read_fn: ReadFn,
    receiver: broadcast::Receiver<Arc<SequencedEvent>>,
    page_size: usize,
    buffer: VecDeque<SequencedEvent>,
    cancel: CancellationToken,
}

impl Outbox {
    /// Attaches to `tail`.
    ///
    /// Every event after `cursor` is delivered: stored ones first, then live
    /// ones. `Seq::ZERO` replays the whole log.
    ///
    /// `read_fn(after, limit)` returns up to `limit` stored events with a
    /// sequence number greater than `after`, ascending.
    pub fn attach<F, Fut>(
        tail: &LiveTail,
        cursor: Seq,
        read_fn: F,
        page_size: usize,
        cancel: CancellationToken,
    ) -> Self
    where
        F: Fn(Seq, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<SequencedEvent>>> + Send + 'static,
    {
        let (receiver, head) = tail.subscribe();
        let head = head.unwrap_or(Seq::ZERO);

        let phase = if cursor < head {
            OutboxPhase::Backfill
        } else {
            OutboxPhase::Live
        };
        debug!(
            cursor = cursor.as_raw(),
            head = head.as_raw(),
            backfill = phase == OutboxPhase::Backfill,
            "outbox attached"
        );

        Self {
            phase,
            last_delivered: cursor,
            backfill_until: head,
            read_fn: Box::new(move |after, limit| -> ReadFuture { Box::pin(read_fn(after, limit)) }),
            receiver,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cancel,
        }
    }

    /// Returns the next event, `None` once the outbox has ended.
    ///
    /// After an error the outbox is ended.
    pub async fn next(&mut self) -> Option<Result<Arc<SequencedEvent>>> {
        loop {
            match self.phase {
                OutboxPhase::Backfill => {
                    if let Some(event) = self.buffer.pop_front() {
                        self.last_delivered = event.seq;
                        return Some(Ok(Arc::new(event)));
                    }
                    if self.last_delivered >= self.backfill_until {
                        self.phase = OutboxPhase::Live;
                        continue;
                    }

                    let read = (self.read_fn)(self.last_delivered, self.page_size);
                    let page = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.phase = OutboxPhase::Ended;
                            return None;
                        }
                        page = read => page,
                    };
                    match page {
                        Ok(events) if events.is_empty() => {
                            self.phase = OutboxPhase::Live;
                        }
                        Ok(events) => {
                            let last = self.last_delivered;
                            self.buffer.extend(events.into_iter().filter(|e| e.seq > last));
                        }
                        Err(e) => {
                            warn!(error = %e, after = self.last_delivered.as_raw(), "backfill read failed");
                            self.phase = OutboxPhase::Ended;
                            return Some(Err(e));
                        }
                    }
                }

                OutboxPhase::Live => {
                    let received = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.phase = OutboxPhase::Ended;
                            return None;
                        }
                        received = self.receiver.recv() => received,
                    };
                    match received {
                        Ok(event) => {
                            // Already delivered during backfill (or before attach).
                            if event.seq <= self.last_delivered {
                                continue;
                            }
                            self.last_delivered = event.seq;
                            return Some(Ok(event));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, last = self.last_delivered.as_raw(), "subscriber fell behind the live tail");
                            self.phase = OutboxPhase::Ended;
                            return Some(Err(Error::ConsumerTooSlow { skipped }));
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.phase = OutboxPhase::Ended;
                            return None;
                        }
                    }
                }

                OutboxPhase::Ended => return None,
            }
        }
    }

    /// Returns whether the outbox has reached the live phase.
    pub fn is_live(&self) -> bool {
        self.phase == OutboxPhase::Live
    }

    /// Sequence number of the last delivered event (or the starting cursor).
    pub fn last_delivered(&self) -> Seq {
        self.last_delivered
    }
}

// =============================================================================
// Tests
// =============================================================================
