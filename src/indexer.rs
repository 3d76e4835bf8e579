//! Document store client
//!
//! Elasticsearch-compatible indexer: documents are upserted by stable id so
//! re-delivery overwrites instead of duplicating, and classification results
//! land later as partial updates against the same id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::config::IndexerSettings;
use crate::dispatch::Indexer;
use crate::error::{Result, SyncError};
use crate::normalize::MessageRecord;

pub struct EsIndexer {
    client: Client,
    base: Url,
    index: String,
}

impl EsIndexer {
    pub fn new(settings: &IndexerSettings) -> Result<Self> {
        let base = Url::parse(&settings.url)
            .map_err(|e| SyncError::Config(format!("invalid indexer url: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| SyncError::Index(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            index: settings.index.clone(),
        })
    }

    /// Create the index with its mapping unless it already exists. Called
    /// once at startup; a failure here is process-fatal.
    pub async fn ensure_index(&self) -> Result<()> {
        let url = self.index_url(&[])?;
        let head = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("index check failed: {}", e)))?;
        if head.status().is_success() {
            debug!(index = %self.index, "index already exists");
            return Ok(());
        }

        let mapping = serde_json::json!({
            "mappings": {
                "properties": {
                    "account_id": { "type": "keyword" },
                    "folder": { "type": "keyword" },
                    "category": { "type": "keyword" },
                    "subject": { "type": "text" },
                    "body": { "type": "text" },
                    "from": { "type": "text" },
                    "to": { "type": "text" },
                    "date": { "type": "date" },
                    "indexed_at": { "type": "date" }
                }
            }
        });

        let resp = self
            .client
            .put(url)
            .json(&mapping)
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("index create failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(SyncError::Index(format!(
                "index create returned status {}",
                resp.status()
            )));
        }

        info!(index = %self.index, "created index");
        Ok(())
    }

    /// Build `{base}/{index}/{segments...}`, percent-encoding each segment
    /// so raw Message-ID values are safe in the path.
    fn index_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SyncError::Config("indexer url cannot be a base".into()))?;
            path.pop_if_empty().push(&self.index);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Indexer for EsIndexer {
    async fn upsert(&self, record: &MessageRecord) -> Result<()> {
        let url = self.index_url(&["_doc", &record.id])?;
        let resp = self
            .client
            .put(url)
            .json(record)
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("upsert request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(SyncError::Index(format!(
                "upsert returned status {}",
                resp.status()
            )));
        }
        debug!(id = %record.id, "indexed message");
        Ok(())
    }

    async fn update_category(&self, id: &str, category: &str) -> Result<()> {
        let url = self.index_url(&["_update", id])?;
        let body = serde_json::json!({ "doc": { "category": category } });
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("category update failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(SyncError::Index(format!(
                "category update returned status {}",
                resp.status()
            )));
        }
        debug!(id = %id, category = %category, "updated category");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer(url: &str) -> EsIndexer {
        EsIndexer::new(&IndexerSettings {
            url: url.into(),
            index: "emails".into(),
            timeout_seconds: 10,
        })
        .unwrap()
    }

    #[test]
    fn doc_urls_encode_message_ids() {
        let indexer = indexer("http://localhost:9200");
        let url = indexer.index_url(&["_doc", "<m1@x>"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/emails/_doc/%3Cm1@x%3E"
        );
    }

    #[test]
    fn base_url_with_path_keeps_its_prefix() {
        let indexer = indexer("http://search.internal:9200/es");
        let url = indexer.index_url(&["_update", "uid-9"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://search.internal:9200/es/emails/_update/uid-9"
        );
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let result = EsIndexer::new(&IndexerSettings {
            url: "not a url".into(),
            index: "emails".into(),
            timeout_seconds: 10,
        });
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
