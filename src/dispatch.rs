//! Downstream dispatch
//!
//! Every normalized record is first upserted into the indexer on the
//! ingestion path (failures logged per message, never fatal), then handed to
//! the classifier on a detached task. Classification failures flow into a
//! supervised channel so they stay observable without coupling to the
//! ingestion critical path.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::normalize::MessageRecord;

/// Downstream document store. At-least-once, last-write-wins by id.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn upsert(&self, record: &MessageRecord) -> Result<()>;
    async fn update_category(&self, id: &str, category: &str) -> Result<()>;
}

/// Downstream category model.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, id: &str, text: &str) -> Result<String>;
}

/// A classification that never made it back into the index.
#[derive(Debug, Clone)]
pub struct ClassificationFailure {
    pub message_id: String,
    pub error: SyncError,
}

/// Fans one record out to the indexer and the classifier.
pub struct Dispatcher {
    indexer: Arc<dyn Indexer>,
    classifier: Arc<dyn Classifier>,
    failure_tx: flume::Sender<ClassificationFailure>,
}

impl Dispatcher {
    /// Returns the dispatcher and the failure channel to supervise.
    pub fn new(
        indexer: Arc<dyn Indexer>,
        classifier: Arc<dyn Classifier>,
    ) -> (Self, flume::Receiver<ClassificationFailure>) {
        let (failure_tx, failure_rx) = flume::unbounded();
        (
            Self {
                indexer,
                classifier,
                failure_tx,
            },
            failure_rx,
        )
    }

    /// Index the record, then request classification without waiting for it.
    pub async fn dispatch(&self, record: MessageRecord) {
        if let Err(e) = self.indexer.upsert(&record).await {
            warn!(id = %record.id, "indexing failed: {}", e);
        }

        let indexer = self.indexer.clone();
        let classifier = self.classifier.clone();
        let failures = self.failure_tx.clone();
        tokio::spawn(async move {
            let text = format!("{}\n{}", record.subject, record.body);
            let outcome = match classifier.classify(&record.id, &text).await {
                Ok(category) => {
                    debug!(id = %record.id, category = %category, "categorized message");
                    indexer.update_category(&record.id, &category).await
                }
                Err(e) => Err(e),
            };
            if let Err(error) = outcome {
                let _ = failures.send(ClassificationFailure {
                    message_id: record.id,
                    error,
                });
            }
        });
    }
}

/// Drain the failure channel, logging every classification that was lost.
pub fn spawn_failure_monitor(rx: flume::Receiver<ClassificationFailure>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(failure) = rx.recv_async().await {
            warn!(
                id = %failure.message_id,
                "classification failed: {}",
                failure.error
            );
        }
    })
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::{RecordingIndexer, StaticClassifier};
    use super::*;
    use crate::normalize::{from_parsed, DEFAULT_CATEGORY};
    use crate::parser::ParsedMessage;

    fn record(id_uid: u32, body: &str) -> MessageRecord {
        let parsed = ParsedMessage {
            subject: Some("subject".into()),
            text: Some(body.to_string()),
            ..Default::default()
        };
        from_parsed("acc1", "INBOX", id_uid, &parsed)
    }

    #[tokio::test]
    async fn dispatch_indexes_then_classifies_asynchronously() {
        let (indexer, upserts, categories) = RecordingIndexer::new();
        let (gate_tx, gate_rx) = flume::unbounded();
        let classifier = Arc::new(StaticClassifier {
            category: "Interested".into(),
            gate: Some(gate_rx),
        });
        let (dispatcher, _failures) = Dispatcher::new(indexer, classifier);

        // dispatch returns while the classifier is still held at the gate
        dispatcher.dispatch(record(1, "hello")).await;
        let upserted = upserts.recv_async().await.unwrap();
        assert_eq!(upserted.id, "uid-1");
        assert_eq!(upserted.category, DEFAULT_CATEGORY);
        assert!(categories.is_empty());

        gate_tx.send(()).unwrap();
        let (id, category) = categories.recv_async().await.unwrap();
        assert_eq!(id, "uid-1");
        assert_eq!(category, "Interested");
    }

    #[tokio::test]
    async fn classification_errors_reach_the_failure_channel() {
        struct FailingClassifier;

        #[async_trait]
        impl Classifier for FailingClassifier {
            async fn classify(&self, _id: &str, _text: &str) -> Result<String> {
                Err(SyncError::Classify("model offline".into()))
            }
        }

        let (indexer, _upserts, categories) = RecordingIndexer::new();
        let (dispatcher, failures) = Dispatcher::new(indexer, Arc::new(FailingClassifier));

        dispatcher.dispatch(record(2, "body")).await;
        let failure = failures.recv_async().await.unwrap();
        assert_eq!(failure.message_id, "uid-2");
        assert!(categories.is_empty());
    }
}
