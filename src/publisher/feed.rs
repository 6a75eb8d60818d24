//! Durable hand-off from the mutation path to the publisher.
//!
//! [`ChangeFeed::submit`] returns once the batch is logged and queued; a
//! worker thread publishes it and then commits the log entry. Batches still
//! in the log at startup are replayed before anything new.

use super::LiveQueryPublisher;
use crate::error::{LiveQueryError, Result};
use crate::wal::{ChangeBatch, WriteAheadLog};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

enum FeedItem {
    Batch { seq: Option<u64>, batch: ChangeBatch },
    Flush(Sender<()>),
}

pub struct ChangeFeed {
    sender: Option<Sender<FeedItem>>,
    wal: Option<Arc<WriteAheadLog>>,
    worker: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    /// Feed without a log. Batches queued at shutdown are still published;
    /// batches queued at a crash are lost.
    pub fn in_memory(publisher: Arc<LiveQueryPublisher>) -> Result<Self> {
        Self::start(publisher, None, Vec::new())
    }

    /// Feed backed by a write-ahead log at `path`.
    pub fn with_wal(publisher: Arc<LiveQueryPublisher>, path: impl AsRef<Path>) -> Result<Self> {
        let wal = Arc::new(WriteAheadLog::open(path)?);
        let pending = wal.pending()?;
        if !pending.is_empty() {
            info!(batches = pending.len(), "replaying uncommitted change batches");
        }
        Self::start(publisher, Some(wal), pending)
    }

    fn start(
        publisher: Arc<LiveQueryPublisher>,
        wal: Option<Arc<WriteAheadLog>>,
        replay: Vec<(u64, ChangeBatch)>,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded();
        for (seq, batch) in replay {
            let _ = sender.send(FeedItem::Batch {
                seq: Some(seq),
                batch,
            });
        }

        let worker_wal = wal.clone();
        let worker = thread::Builder::new()
            .name("livequery-feed".into())
            .spawn(move || run(publisher, worker_wal, receiver))?;

        Ok(Self {
            sender: Some(sender),
            wal,
            worker: Some(worker),
        })
    }

    /// Log and enqueue a batch. The mutation it describes is complete once
    /// this returns `Ok`.
    pub fn submit(&self, batch: ChangeBatch) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(LiveQueryError::ManagerClosed)?;
        if batch.changes.is_empty() {
            return Ok(());
        }

        let seq = match &self.wal {
            Some(wal) => Some(wal.log(&batch)?),
            None => None,
        };
        sender
            .send(FeedItem::Batch { seq, batch })
            .map_err(|_| LiveQueryError::ManagerClosed)
    }

    /// Wait until every batch submitted so far has been published.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        let (done_tx, done_rx) = bounded(1);
        if sender.send(FeedItem::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Whether the log still holds unpublished batches.
    pub fn has_pending(&self) -> bool {
        self.wal.as_ref().map(|w| w.has_pending()).unwrap_or(false)
    }

    /// Publish what is queued, then stop the worker.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("change feed worker panicked");
            }
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    publisher: Arc<LiveQueryPublisher>,
    wal: Option<Arc<WriteAheadLog>>,
    receiver: Receiver<FeedItem>,
) {
    for item in receiver {
        match item {
            FeedItem::Batch { seq, batch } => {
                match publisher.publish(&batch) {
                    Ok(report) => debug!(
                        entity = %batch.entity_key,
                        published = report.published,
                        failed = report.failed.len(),
                        "change batch processed"
                    ),
                    Err(e) => warn!(entity = %batch.entity_key, error = %e, "change batch not published"),
                }

                if let (Some(wal), Some(seq)) = (&wal, seq) {
                    if let Err(e) = wal.commit(seq) {
                        warn!(seq, error = %e, "failed to commit change batch");
                    }
                }
            }
            FeedItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("change feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::policy::AllowAll;
    use crate::publisher::{PublisherConfig, QueryEvaluator};
    use crate::registry::{InMemoryRegistrationStore, Registration, RegistrationStore};
    use crate::types::{ChangeEvent, Identity, QuerySpec, Record, SecurityContext};
    use crate::wire::DiffMessage;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixed(Vec<Record>);

    impl QueryEvaluator for Fixed {
        fn evaluate(&self, _: &str, _: &QuerySpec, _: &SecurityContext) -> Result<Vec<Record>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Counter(Mutex<Vec<DiffMessage>>);

    impl MessageBus for Counter {
        fn send_message(&self, _channel: &str, data: serde_json::Value) -> usize {
            let messages: Vec<DiffMessage> = serde_json::from_value(data).unwrap();
            self.0.lock().extend(messages);
            1
        }
    }

    fn setup() -> (Arc<LiveQueryPublisher>, Arc<Counter>) {
        let store = Arc::new(InMemoryRegistrationStore::new());
        store
            .add(
                Registration::new(
                    "tasks",
                    &QuerySpec::all(),
                    SecurityContext::anonymous(),
                    vec![Identity::Int(1)],
                )
                .unwrap(),
            )
            .unwrap();
        let bus = Arc::new(Counter::default());
        let publisher = LiveQueryPublisher::new(
            store,
            Arc::new(Fixed(vec![json!({"id": 1}), json!({"id": 2})])),
            bus.clone(),
            Arc::new(AllowAll),
            PublisherConfig::default(),
        );
        (Arc::new(publisher), bus)
    }

    fn insert_two() -> ChangeBatch {
        ChangeBatch::new(
            "tasks",
            vec![ChangeEvent::insert("tasks", 2.into(), json!({"id": 2}))],
        )
    }

    #[test]
    fn test_submit_then_flush() {
        let (publisher, bus) = setup();
        let feed = ChangeFeed::in_memory(publisher).unwrap();

        feed.submit(insert_two()).unwrap();
        assert!(feed.flush(Duration::from_secs(5)));

        assert_eq!(*bus.0.lock(), vec![DiffMessage::Add(json!({"id": 2}))]);
    }

    #[test]
    fn test_wal_committed_after_publish() {
        let dir = TempDir::new().unwrap();
        let (publisher, _bus) = setup();
        let feed = ChangeFeed::with_wal(publisher, dir.path().join("feed.wal")).unwrap();

        feed.submit(insert_two()).unwrap();
        assert!(feed.flush(Duration::from_secs(5)));
        assert!(!feed.has_pending());
    }

    #[test]
    fn test_replay_pending_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.wal");
        {
            let wal = WriteAheadLog::open(&path).unwrap();
            wal.log(&insert_two()).unwrap();
        }

        let (publisher, bus) = setup();
        let feed = ChangeFeed::with_wal(publisher, &path).unwrap();
        assert!(feed.flush(Duration::from_secs(5)));

        assert_eq!(bus.0.lock().len(), 1);
        assert!(!feed.has_pending());
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (publisher, _bus) = setup();
        let mut feed = ChangeFeed::in_memory(publisher).unwrap();
        feed.shutdown();
        assert!(matches!(
            feed.submit(insert_two()),
            Err(LiveQueryError::ManagerClosed)
        ));
        assert!(!feed.flush(Duration::from_millis(10)));
    }
}
