use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// One ingested email, with text already extracted and image references
/// already resolved by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub text_content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Expand this message into one `ImageReference` per image, all carrying
    /// the same email context. Order follows `image_urls`.
    pub fn image_references(&self) -> Vec<ImageReference> {
        self.image_urls
            .iter()
            .map(|locator| ImageReference {
                locator: locator.clone(),
                email_id: self.id.clone(),
                subject: self.subject.clone(),
                sender: self.sender.clone(),
                text_snippet: self.text_content.clone(),
            })
            .collect()
    }
}

/// A single image plus the email context it arrived with. Read-only once
/// constructed; the pipeline never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReference {
    pub locator: String,
    pub email_id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub text_snippet: String,
}

/// A ready-to-persist caption candidate. Built only after validation and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub caption_text: String,
    pub email_id: String,
    pub source_image_url: String,
    pub source_image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub is_user_generated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub notify_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoCaptionRequest {
    pub org_id: String,
    /// If present, used directly; otherwise messages are fetched from the
    /// message repository for `[start_time, end_time)`.
    #[serde(default)]
    pub messages: Option<Vec<EmailMessage>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCaptionResponse {
    pub org_id: String,
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CombinedCaptionRequest {
    pub images: Vec<ImageReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedCaptionResponse {
    pub post: Post,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunAllRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Outcome of one organization's run inside a multi-org sweep.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct OrgRunReport {
    pub org_id: String,
    pub org_name: String,
    pub posts_created: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAllResponse {
    pub organizations: Vec<OrgRunReport>,
}
