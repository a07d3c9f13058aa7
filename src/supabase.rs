use crate::http::build_client;
use crate::models::{EmailMessage, Organization, Post};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use urlencoding::encode;

/// REST access to the message, post, and organization tables.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    /// Messages for one organization within `[start, end)`, oldest first,
    /// limited to those that actually carry images.
    pub async fn fetch_messages_with_images(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        org_id: &str,
    ) -> Result<Vec<EmailMessage>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/email_messages?org_id=eq.{}&received_at=gte.{}&received_at=lt.{}&select=*&order=received_at.asc",
            self.base_url,
            encode(org_id),
            encode(&start.to_rfc3339()),
            encode(&end.to_rfc3339()),
        );
        let messages: Vec<EmailMessage> = self.get_json(url).await?;
        Ok(messages
            .into_iter()
            .filter(|message| !message.image_urls.is_empty())
            .collect())
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>, SupabaseError> {
        let url = format!("{}/rest/v1/organizations?select=*&order=name.asc", self.base_url);
        self.get_json(url).await
    }

    /// Insert generated posts for an organization and return the stored rows.
    pub async fn persist_posts(
        &self,
        posts: &[Post],
        org_id: &str,
    ) -> Result<Vec<Post>, SupabaseError> {
        let rows: Vec<Value> = posts
            .iter()
            .map(|post| {
                let mut row = json!(post);
                row["org_id"] = json!(org_id);
                row
            })
            .collect();

        let url = format!("{}/rest/v1/posts", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, SupabaseError> {
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }
}
