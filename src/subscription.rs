//! # Firehose Subscriptions
//!
//! Turns an [`Outbox`] into a consumer-facing stream of frames.
//!
//! ## Producer / Consumer Split
//!
//! ```text
//!   subscribe_repos(cursor)
//!     │ cursor > current?  ──► FutureCursor (nothing is spawned)
//!     │ cursor older than backfill window? ──► move it, queue OutdatedCursor
//!     ▼
//!   producer task                     FirehoseSubscription
//!   ┌──────────────────┐   bounded    ┌──────────────────────┐
//!   │ outbox.next()    │──► mpsc ────►│ Stream<Item=Frame>   │
//!   │ select! cancel   │   (frames)   │ Drop ──► cancel      │
//!   └──────────────────┘              └──────────────────────┘
//! ```
//!
//! The bounded channel is the per-subscriber buffer. When it is full the
//! producer stops pulling from the outbox, live events accumulate in the
//! broadcast ring instead, and a subscriber that never catches up is cut off
//! with [`Error::ConsumerTooSlow`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::current_time_ms;
use crate::config::OutboxConfig;
use crate::error::{Error, Result};
use crate::events::SequencedEvent;
use crate::outbox::Outbox;
use crate::sequencer::Sequencer;
use crate::types::Seq;

/// Name of the info frame sent when a cursor predates the backfill window.
pub const OUTDATED_CURSOR: &str = "OutdatedCursor";

/// One message on the firehose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A sequenced event.
    Event(Arc<SequencedEvent>),
    /// An informational message; the stream continues after it.
    Info { name: String, message: String },
}

impl Frame {
    /// The event in this frame, if any.
    pub fn event(&self) -> Option<&SequencedEvent> {
        match self {
            Frame::Event(event) => Some(event),
            Frame::Info { .. } => None,
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Validates cursors and starts subscriptions.
#[derive(Clone)]
pub struct SubscriptionHandler {
    sequencer: Sequencer,
    config: OutboxConfig,
}

impl SubscriptionHandler {
    pub fn new(sequencer: Sequencer, config: OutboxConfig) -> Self {
        Self { sequencer, config }
    }

    /// Starts a subscription.
    ///
    /// Every event after `cursor` is delivered; without one the log is
    /// replayed from the start. A cursor beyond the current head fails with
    /// [`Error::FutureCursor`] before anything is started.
    ///
    /// With a backfill window configured, the start is moved up to the first
    /// event inside the window; an explicit cursor then gets an
    /// `OutdatedCursor` info frame first.
    ///
    /// The subscription also ends when `cancel` fires.
    pub async fn subscribe_repos(
        &self,
        cursor: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<FirehoseSubscription> {
        let current = self.sequencer.current();
        if let Some(requested) = cursor {
            let ahead = match current {
                Some(head) => requested > head.as_raw(),
                None => requested > 0,
            };
            if ahead {
                return Err(Error::FutureCursor {
                    cursor: requested,
                    current: current.map(|c| c.as_raw()),
                });
            }
        }

        let requested = cursor.map_or(Seq::ZERO, Seq::from_raw);
        let mut start = requested;
        let mut info = None;
        if let Some(window) = self.config.backfill_window {
            if let Some(moved) = self.clamp_to_window(requested, current, window).await? {
                debug!(
                    requested = requested.as_raw(),
                    moved = moved.as_raw(),
                    "cursor predates backfill window"
                );
                start = moved;
                if cursor.is_some() {
                    info = Some(Frame::Info {
                        name: OUTDATED_CURSOR.to_string(),
                        message: "Requested cursor exceeded limit. Possibly missing events".to_string(),
                    });
                }
            }
        }

        let reader = self.sequencer.clone();
        let outbox = Outbox::attach(
            self.sequencer.tail(),
            start,
            move |after, limit| {
                let reader = reader.clone();
                async move { reader.read_after(after, limit).await }
            },
            self.config.backfill_page_size,
            cancel.clone(),
        );

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        tokio::spawn(produce(outbox, info, tx, cancel.clone()));

        Ok(FirehoseSubscription { rx, cancel })
    }

    /// Returns the cursor to start from if `requested` is older than the
    /// first event inside the backfill window.
    async fn clamp_to_window(
        &self,
        requested: Seq,
        current: Option<Seq>,
        window: Duration,
    ) -> Result<Option<Seq>> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let since = current_time_ms().saturating_sub(window_ms);

        match self.sequencer.first_seq_since(since).await? {
            Some(first) if first.as_raw() > requested.as_raw() + 1 => {
                Ok(Some(Seq::from_raw(first.as_raw() - 1)))
            }
            Some(_) => Ok(None),
            // Nothing inside the window at all: skip to the head.
            None => match current {
                Some(head) if head > requested => Ok(Some(head)),
                _ => Ok(None),
            },
        }
    }
}

async fn produce(
    mut outbox: Outbox,
    info: Option<Frame>,
    tx: mpsc::Sender<Result<Frame>>,
    cancel: CancellationToken,
) {
    if let Some(frame) = info {
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }

    while let Some(item) = outbox.next().await {
        let failed = item.is_err();
        if let Err(e) = &item {
            debug!(error = %e, last = outbox.last_delivered().as_raw(), "subscription terminated");
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(item.map(Frame::Event)) => sent,
        };
        if sent.is_err() || failed {
            break;
        }
    }
    debug!(last = outbox.last_delivered().as_raw(), "subscription producer stopped");
}

// =============================================================================
// Consumer Side
// =============================================================================

/// A live firehose subscription.
///
/// # Rust Pattern: Drop Cancels
///
/// Dropping the subscription fires its cancellation token, so the producer
/// task stops at its next await point and releases its outbox even if the
/// consumer simply walks away.
#[derive(Debug)]
pub struct FirehoseSubscription {
    rx: mpsc::Receiver<Result<Frame>>,
    cancel: CancellationToken,
}

impl FirehoseSubscription {
    /// Receives the next frame; `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    /// Stops the subscription. Frames already buffered are discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for FirehoseSubscription {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for FirehoseSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
