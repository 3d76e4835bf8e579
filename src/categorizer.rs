//! LLM-based message categorization
//!
//! Sends each message to a local Ollama instance and maps the reply onto the
//! fixed category set. Unrecognized replies and a disabled classifier both
//! degrade to the default category instead of failing the message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ClassifierSettings;
use crate::dispatch::Classifier;
use crate::error::{Result, SyncError};
use crate::normalize::DEFAULT_CATEGORY;

/// The category set; every indexed document carries exactly one of these or
/// the default.
pub const CATEGORIES: [&str; 5] = [
    "Interested",
    "Meeting Booked",
    "Not Interested",
    "Spam",
    "Out of Office",
];

const CLASSIFICATION_PROMPT: &str = r#"Classify this email into exactly one category.

Categories:
- Interested: The sender shows genuine interest in the product or proposal
- Meeting Booked: A meeting or call has been scheduled or confirmed
- Not Interested: The sender declines or shows no interest
- Spam: Unsolicited bulk or promotional email
- Out of Office: Automatic out-of-office or vacation reply

Email:
{text}

Respond with ONLY the category name. Nothing else."#;

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct ChatClassifier {
    client: Client,
    settings: ClassifierSettings,
}

impl ChatClassifier {
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| SyncError::Classify(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }

    async fn call_model(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/api/generate",
            self.settings.url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.settings.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": 20
            }
        });

        debug!(url = %url, model = %self.settings.model, "requesting classification");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Classify(format!("model request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(SyncError::Classify(format!(
                "model returned status {}",
                resp.status()
            )));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Classify(format!("failed to parse model response: {}", e)))?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(&self, id: &str, text: &str) -> Result<String> {
        if !self.settings.enabled {
            return Ok(DEFAULT_CATEGORY.to_string());
        }

        // Bound the prompt; long bodies add latency without accuracy
        let preview: String = text.chars().take(1000).collect();
        let prompt = CLASSIFICATION_PROMPT.replace("{text}", &preview);

        let reply = self.call_model(&prompt).await?;
        match pick_category(&reply) {
            Some(category) => Ok(category.to_string()),
            None => {
                warn!(id = %id, reply = %reply.trim(), "unrecognized classification");
                Ok(DEFAULT_CATEGORY.to_string())
            }
        }
    }
}

/// Map a free-form model reply onto the category set. Exact match first;
/// substring matching (the model may wrap the category in extra text) runs
/// longest-first so "Not Interested" never resolves as "Interested".
pub fn pick_category(reply: &str) -> Option<&'static str> {
    let cleaned = reply.trim().to_lowercase();
    if let Some(exact) = CATEGORIES
        .iter()
        .find(|category| cleaned == category.to_lowercase())
    {
        return Some(exact);
    }

    let mut by_length = CATEGORIES;
    by_length.sort_by_key(|category| std::cmp::Reverse(category.len()));
    by_length
        .into_iter()
        .find(|category| cleaned.contains(&category.to_lowercase()))
}
