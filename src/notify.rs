use crate::http::build_client;
use crate::models::Post;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

/// Best-effort summary delivery once posts are stored. Callers must treat
/// failures as log-only; a lost notification never fails a pipeline run.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: Client,
    webhook_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(String),
}

impl Notifier {
    pub fn from_env() -> Option<Self> {
        let webhook_url = std::env::var("NOTIFY_WEBHOOK_URL").ok()?;
        Some(Self {
            http: build_client(),
            webhook_url,
            api_key: std::env::var("NOTIFY_API_KEY").ok(),
        })
    }

    pub async fn notify(
        &self,
        to_email: &str,
        posts: &[Post],
        org_name: &str,
        date: NaiveDate,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "to": to_email,
            "subject": format!("{org_name}: {} new caption(s) ready for {date}", posts.len()),
            "org_name": org_name,
            "date": date,
            "posts": posts,
        });

        let mut request = self.http.post(&self.webhook_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
