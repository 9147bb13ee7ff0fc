//! In-process partitioned log.
//!
//! Backs standalone mode and the test suites. Messages are kept for the life
//! of the process; consumer groups track committed offsets exactly like the
//! external log does, so redelivery after a restart of a consumer (or after a
//! rewind) behaves the same way.
//!
//! Nothing is ever truncated, not even below every group's committed offset,
//! so memory grows with the number of appended events. Standalone deployments
//! that run for long periods should use the Kafka backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{LogConsumer, LogProducer, Position, QueueError, QueuedMessage};

/// Shared handle to an in-process log. Cheap to clone.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: Vec<Mutex<Vec<Vec<u8>>>>,
    next_partition: AtomicUsize,
    /// (group, partition) -> next offset to read after a restart.
    committed: DashMap<(String, i32), i64>,
    appended: watch::Sender<u64>,
}

impl MemoryLog {
    /// Creates a log with `partitions` partitions (at least one).
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let (appended, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
                next_partition: AtomicUsize::new(0),
                committed: DashMap::new(),
                appended,
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions.len()
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Consumer that owns every partition for `group`.
    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        self.consumer_for(group, 0, 1)
    }

    /// Consumer for member `member` of a group with `members` members.
    ///
    /// Partition `p` is assigned to member `p % members`.
    pub fn consumer_for(&self, group: &str, member: usize, members: usize) -> MemoryConsumer {
        let members = members.max(1);
        let mut cursors = BTreeMap::new();

        for p in 0..self.inner.partitions.len() {
            if p % members != member {
                continue;
            }
            let partition = p as i32;
            let resume = self
                .inner
                .committed
                .get(&(group.to_string(), partition))
                .map(|v| *v)
                .unwrap_or(0);
            cursors.insert(partition, resume);
        }

        MemoryConsumer {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            cursors,
            next_scan: 0,
            appended: self.inner.appended.subscribe(),
            closed: false,
        }
    }

    /// Total number of messages across all partitions.
    pub fn len(&self) -> usize {
        self.inner.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest offset committed by `group` on `partition`, if any.
    pub fn committed_offset(&self, group: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .get(&(group.to_string(), partition))
            .map(|next| *next - 1)
    }
}

/// Appending side of a [`MemoryLog`].
#[derive(Clone)]
pub struct MemoryProducer {
    inner: Arc<Inner>,
}

impl LogProducer for MemoryProducer {
    async fn append(&self, payload: Vec<u8>) -> Result<Position, QueueError> {
        let count = self.inner.partitions.len();
        let index = self.inner.next_partition.fetch_add(1, Ordering::Relaxed) % count;

        let offset = {
            let mut partition = self.inner.partitions[index].lock();
            partition.push(payload);
            (partition.len() - 1) as i64
        };

        self.inner.appended.send_modify(|seq| *seq = seq.wrapping_add(1));

        Ok(Position::new(index as i32, offset))
    }
}

/// Reading side of a [`MemoryLog`] for one group member.
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    /// partition -> next offset to fetch.
    cursors: BTreeMap<i32, i64>,
    next_scan: usize,
    appended: watch::Receiver<u64>,
    closed: bool,
}

impl MemoryConsumer {
    /// Partitions owned by this consumer.
    pub fn assignment(&self) -> Vec<i32> {
        self.cursors.keys().copied().collect()
    }

    fn try_take(&mut self) -> Option<QueuedMessage> {
        let assigned: Vec<i32> = self.cursors.keys().copied().collect();
        if assigned.is_empty() {
            return None;
        }

        for i in 0..assigned.len() {
            let slot = (self.next_scan + i) % assigned.len();
            let partition = assigned[slot];
            let cursor = self.cursors.get(&partition).copied().unwrap_or(0);

            let payload = {
                let messages = self.inner.partitions[partition as usize].lock();
                usize::try_from(cursor)
                    .ok()
                    .and_then(|idx| messages.get(idx).cloned())
            };

            if let Some(payload) = payload {
                self.cursors.insert(partition, cursor + 1);
                self.next_scan = slot + 1;
                return Some(QueuedMessage {
                    position: Position::new(partition, cursor),
                    payload,
                });
            }
        }

        None
    }

    fn check_assigned(&self, partition: i32) -> Result<(), QueueError> {
        if self.cursors.contains_key(&partition) {
            Ok(())
        } else {
            Err(QueueError::NotAssigned { partition })
        }
    }
}

impl LogConsumer for MemoryConsumer {
    async fn fetch(&mut self) -> Result<QueuedMessage, QueueError> {
        loop {
            if self.closed {
                return Err(QueueError::Closed);
            }

            // Mark the current append sequence as seen before scanning so an
            // append racing with the scan still wakes the wait below.
            let _ = self.appended.borrow_and_update();

            if let Some(msg) = self.try_take() {
                return Ok(msg);
            }

            self.appended
                .changed()
                .await
                .map_err(|_| QueueError::Closed)?;
        }
    }

    async fn rewind(&mut self, position: Position) -> Result<(), QueueError> {
        self.check_assigned(position.partition)?;
        self.cursors
            .insert(position.partition, position.offset.max(0));
        Ok(())
    }

    async fn commit(&mut self, position: Position) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        self.check_assigned(position.partition)?;

        let next = position.offset + 1;
        self.inner
            .committed
            .entry((self.group.clone(), position.partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);

        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn fill(log: &MemoryLog, n: usize) -> Vec<Position> {
        let producer = log.producer();
        let mut positions = Vec::with_capacity(n);
        for i in 0..n {
            positions.push(producer.append(format!("m{i}").into_bytes()).await.unwrap());
        }
        positions
    }

    #[tokio::test]
    async fn test_append_round_robins_partitions() {
        let log = MemoryLog::new(3);
        let positions = fill(&log, 4).await;

        assert_eq!(
            positions,
            vec![
                Position::new(0, 0),
                Position::new(1, 0),
                Position::new(2, 0),
                Position::new(0, 1),
            ]
        );
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_preserves_partition_order() {
        let log = MemoryLog::new(1);
        fill(&log, 3).await;

        let mut consumer = log.consumer("g");
        for i in 0..3 {
            let msg = consumer.fetch().await.unwrap();
            assert_eq!(msg.position, Position::new(0, i));
            assert_eq!(msg.payload, format!("m{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn test_new_consumer_resumes_after_commit() {
        let log = MemoryLog::new(1);
        fill(&log, 3).await;

        let mut first = log.consumer("g");
        let msg = first.fetch().await.unwrap();
        first.commit(msg.position).await.unwrap();
        first.close().await.unwrap();

        let mut second = log.consumer("g");
        assert_eq!(second.fetch().await.unwrap().position, Position::new(0, 1));
        assert_eq!(log.committed_offset("g", 0), Some(0));
    }

    #[tokio::test]
    async fn test_uncommitted_messages_are_redelivered_to_next_consumer() {
        let log = MemoryLog::new(1);
        fill(&log, 2).await;

        let mut first = log.consumer("g");
        first.fetch().await.unwrap();
        first.fetch().await.unwrap();
        first.close().await.unwrap();

        let mut second = log.consumer("g");
        assert_eq!(second.fetch().await.unwrap().position, Position::new(0, 0));
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let log = MemoryLog::new(1);
        fill(&log, 1).await;

        let mut a = log.consumer("a");
        let msg = a.fetch().await.unwrap();
        a.commit(msg.position).await.unwrap();

        let mut b = log.consumer("b");
        assert_eq!(b.fetch().await.unwrap().position, Position::new(0, 0));
        assert_eq!(log.committed_offset("b", 0), None);
    }

    #[tokio::test]
    async fn test_rewind_redelivers_position() {
        let log = MemoryLog::new(1);
        fill(&log, 2).await;

        let mut consumer = log.consumer("g");
        let first = consumer.fetch().await.unwrap();
        consumer.rewind(first.position).await.unwrap();

        let again = consumer.fetch().await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let log = MemoryLog::new(1);
        fill(&log, 3).await;

        let mut consumer = log.consumer("g");
        consumer.commit(Position::new(0, 2)).await.unwrap();
        consumer.commit(Position::new(0, 1)).await.unwrap();

        assert_eq!(log.committed_offset("g", 0), Some(2));
    }

    #[tokio::test]
    async fn test_static_assignment_is_disjoint() {
        let log = MemoryLog::new(5);
        let a = log.consumer_for("g", 0, 2);
        let b = log.consumer_for("g", 1, 2);

        assert_eq!(a.assignment(), vec![0, 2, 4]);
        assert_eq!(b.assignment(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_append() {
        let log = MemoryLog::new(2);
        let mut consumer = log.consumer("g");
        let producer = log.producer();

        let handle = tokio::spawn(async move { consumer.fetch().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.append(b"late".to_vec()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_loses_nothing() {
        let log = MemoryLog::new(1);
        let mut consumer = log.consumer("g");

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), consumer.fetch()).await;
        assert!(timed_out.is_err());

        fill(&log, 1).await;
        assert_eq!(consumer.fetch().await.unwrap().position, Position::new(0, 0));
    }

    #[tokio::test]
    async fn test_committed_messages_are_retained() {
        let log = MemoryLog::new(1);
        fill(&log, 2).await;

        let mut consumer = log.consumer("a");
        let msg = consumer.fetch().await.unwrap();
        consumer.commit(msg.position).await.unwrap();

        assert_eq!(log.len(), 2);
        let mut late = log.consumer("b");
        assert_eq!(late.fetch().await.unwrap().position, Position::new(0, 0));
    }

    // -- Error cases --

    #[tokio::test]
    async fn test_commit_unassigned_partition() {
        let log = MemoryLog::new(2);
        let mut consumer = log.consumer_for("g", 0, 2);

        let err = consumer.commit(Position::new(1, 0)).await.unwrap_err();
        assert!(matches!(err, QueueError::NotAssigned { partition: 1 }));
    }

    #[tokio::test]
    async fn test_fetch_after_close() {
        let log = MemoryLog::new(1);
        fill(&log, 1).await;

        let mut consumer = log.consumer("g");
        consumer.close().await.unwrap();
        assert!(matches!(consumer.fetch().await, Err(QueueError::Closed)));
    }
}
