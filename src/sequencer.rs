//! # Sequencer
//!
//! Assigns every event a position in the global log and fans committed events
//! out to live subscribers.
//!
//! ## Architecture
//!
//! ```text
//!   sequence_commit ──┐
//!   sequence_account ─┼──► WriterHandle ──► writer thread ──► repo_seq
//!   sequence_labels ──┘                          │
//!                                                │ after COMMIT
//!                                                ▼
//!                                          LiveTail.publish
//!                                     ┌──────────┴──────────┐
//!                                 head (atomic)        broadcast ring
//!                                     │                     │
//!                                 current()            subscribers
//! ```
//!
//! Numbers are assigned by the writer thread; the sequencer is the async
//! surface in front of it plus the read side of the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::commit::CommitData;
use crate::error::Result;
use crate::events::{AccountEvent, EventBody, IdentityEvent, LabelsEvent, SequencedEvent};
use crate::reader::ReaderHandle;
use crate::types::{Did, Seq};
use crate::writer::WriterHandle;

// =============================================================================
// Live Tail
// =============================================================================

/// The in-memory tail of the log: the highest committed sequence number and
/// the broadcast channel live events travel on.
///
/// # Ordering Contract
///
/// `publish` is called only after the events are durable. It moves `head`
/// before broadcasting, and [`subscribe`](LiveTail::subscribe) registers the
/// receiver before reading `head`. Together this means a subscriber either
/// receives an event live, or sees a head at or past it and finds it in
/// storage during backfill, and possibly both. It never misses it.
pub struct LiveTail {
    /// Highest committed sequence number; 0 while the log is empty.
    head: AtomicU64,
    tx: broadcast::Sender<Arc<SequencedEvent>>,
}

impl LiveTail {
    /// Creates a tail whose broadcast ring holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            head: AtomicU64::new(0),
            tx,
        }
    }

    /// Highest sequence number ever committed, if any.
    pub fn current(&self) -> Option<Seq> {
        match self.head.load(Ordering::SeqCst) {
            0 => None,
            n => Some(Seq::from_raw(n)),
        }
    }

    /// Registers a live receiver, then samples the head.
    pub fn subscribe(&self) -> (broadcast::Receiver<Arc<SequencedEvent>>, Option<Seq>) {
        let rx = self.tx.subscribe();
        (rx, self.current())
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn advance_to(&self, seq: Seq) {
        self.head.fetch_max(seq.as_raw(), Ordering::SeqCst);
    }

    /// Publishes durable events in sequence order.
    pub(crate) fn publish(&self, events: Vec<Arc<SequencedEvent>>) {
        let Some(last) = events.last() else {
            return;
        };
        self.advance_to(last.seq);
        for event in events {
            // No receivers is fine.
            let _ = self.tx.send(event);
        }
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Async front of the global event log.
#[derive(Clone)]
pub struct Sequencer {
    writer: WriterHandle,
    reader: ReaderHandle,
    tail: Arc<LiveTail>,
}

impl Sequencer {
    pub fn new(writer: WriterHandle, reader: ReaderHandle, tail: Arc<LiveTail>) -> Self {
        Self {
            writer,
            reader,
            tail,
        }
    }

    /// Persists a commit and sequences its event atomically.
    ///
    /// Fails with `BadCommitSwap` if the head moved since the commit was built.
    pub(crate) async fn sequence_commit(&self, commit: CommitData) -> Result<Seq> {
        self.writer.commit(commit).await
    }

    pub async fn sequence_account(&self, event: AccountEvent) -> Result<Seq> {
        self.writer.append_event(EventBody::Account(event)).await
    }

    pub async fn sequence_identity(&self, event: IdentityEvent) -> Result<Seq> {
        self.writer.append_event(EventBody::Identity(event)).await
    }

    pub async fn sequence_labels(&self, event: LabelsEvent) -> Result<Seq> {
        self.writer.append_event(EventBody::Labels(event)).await
    }

    /// Highest sequence number assigned so far, recovered from disk on start.
    pub fn current(&self) -> Option<Seq> {
        self.tail.current()
    }

    /// Removes every event of `did` from the log.
    ///
    /// Live subscribers are not notified and freed numbers are never reused.
    pub async fn delete_all_for_repo(&self, did: &Did) -> Result<u64> {
        self.writer.delete_repo_events(did.clone()).await
    }

    /// Reads committed events after `after`.
    pub async fn read_after(&self, after: Seq, limit: usize) -> Result<Vec<SequencedEvent>> {
        self.reader.read_log(after, limit).await
    }

    /// First sequence number stored at or after `time_ms`.
    pub async fn first_seq_since(&self, time_ms: u64) -> Result<Option<Seq>> {
        self.reader.first_seq_since(time_ms).await
    }

    pub fn tail(&self) -> &Arc<LiveTail> {
        &self.tail
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IdentityEvent;

    fn event(seq: u64) -> Arc<SequencedEvent> {
        Arc::new(SequencedEvent {
            seq: Seq::from_raw(seq),
            time_ms: seq,
            body: EventBody::Identity(IdentityEvent {
                did: Did::parse("did:example:alice").unwrap(),
                handle: None,
            }),
        })
    }

    #[test]
    fn test_empty_tail() {
        let tail = LiveTail::new(8);
        assert_eq!(tail.current(), None);
        tail.publish(Vec::new());
        assert_eq!(tail.current(), None);
    }

    #[test]
    fn test_head_never_moves_backwards() {
        let tail = LiveTail::new(8);
        tail.advance_to(Seq::from_raw(10));
        tail.advance_to(Seq::from_raw(4));
        assert_eq!(tail.current(), Some(Seq::from_raw(10)));
    }

    #[tokio::test]
    async fn test_subscriber_sees_published_events() {
        let tail = LiveTail::new(8);
        let (mut rx, head) = tail.subscribe();
        assert_eq!(head, None);
        assert_eq!(tail.receiver_count(), 1);

        tail.publish(vec![event(1), event(2)]);
        assert_eq!(tail.current(), Some(Seq::from_raw(2)));
        assert_eq!(rx.recv().await.unwrap().seq, Seq::from_raw(1));
        assert_eq!(rx.recv().await.unwrap().seq, Seq::from_raw(2));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_head() {
        let tail = LiveTail::new(8);
        tail.publish(vec![event(1)]);
        let (mut rx, head) = tail.subscribe();
        assert_eq!(head, Some(Seq::FIRST));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ring_overflow_lags() {
        let tail = LiveTail::new(2);
        let (mut rx, _) = tail.subscribe();
        tail.publish((1..=5).map(event).collect());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }
}
