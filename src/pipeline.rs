use crate::batching;
use crate::llm::{GenClient, GenConfig, GenError, Generate};
use crate::models::{
    AutoCaptionRequest, EmailMessage, ImageReference, OrgRunReport, Organization, Post,
};
use crate::notify::Notifier;
use crate::prompt::{self, CaptionMode};
use crate::resolver::ImageResolver;
use crate::supabase::SupabaseClient;
use crate::validate;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Stop planning further batches once this many posts are accumulated.
pub const EARLY_STOP_THRESHOLD: usize = 3;

/// Hard cap on posts returned by one auto-selection run.
pub const MAX_AUTO_POSTS: usize = 5;

/// Combined mode refuses larger curated sets before any network call.
pub const MAX_COMBINED_IMAGES: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_batch_bytes: usize,
    pub per_image_estimate_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: batching::MAX_BATCH_BYTES,
            per_image_estimate_bytes: batching::PER_IMAGE_ESTIMATE_BYTES,
        }
    }
}

/// One caption pipeline, scoped to a generation client and its collaborators.
/// Runs own no shared mutable state; each call owns its accumulator.
pub struct Pipeline<G = GenClient> {
    pub config: Arc<PipelineConfig>,
    llm: Arc<G>,
    resolver: Arc<ImageResolver>,
    supabase: Option<SupabaseClient>,
    notifier: Option<Notifier>,
}

impl<G> Clone for Pipeline<G> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            llm: self.llm.clone(),
            resolver: self.resolver.clone(),
            supabase: self.supabase.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl Pipeline<GenClient> {
    pub fn from_env() -> Self {
        Self::with_generator(GenClient::new(GenConfig::from_env()), PipelineConfig::default())
    }
}

impl<G: Generate> Pipeline<G> {
    pub fn with_generator(llm: G, config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            llm: Arc::new(llm),
            resolver: Arc::new(ImageResolver::new()),
            supabase: SupabaseClient::from_env(),
            notifier: Notifier::from_env(),
        }
    }

    /// Auto-selection mode: flatten the messages' images in arrival order,
    /// plan size-bounded batches, and process them strictly sequentially.
    /// Stops early once enough posts are accumulated; the result is capped
    /// at `MAX_AUTO_POSTS`. A fatal error in any batch aborts the whole run;
    /// posts accumulated from earlier batches are discarded with it.
    pub async fn run_auto_selection(
        &self,
        org_id: &str,
        messages: &[EmailMessage],
    ) -> Result<Vec<Post>, PipelineError> {
        let images: Vec<ImageReference> = messages
            .iter()
            .flat_map(|message| message.image_references())
            .collect();
        let batches = batching::plan(
            &images,
            self.config.max_batch_bytes,
            self.config.per_image_estimate_bytes,
        );
        info!(
            target = "calliope.pipeline",
            org_id = org_id,
            images = images.len(),
            batches = batches.len(),
            "auto-selection run planned"
        );

        let mut accumulated: Vec<Post> = Vec::new();
        for (index, batch) in batches.iter().enumerate() {
            let started = Instant::now();
            let request =
                prompt::build_request(&self.resolver, batch, CaptionMode::AutoSelect, Utc::now())
                    .await;
            let raw = self
                .llm
                .generate(&request)
                .await
                .map_err(|err| classify_gen_error("generate_batch", err))?;
            let posts = validate::parse_selections(&raw, batch, Utc::now())
                .map_err(|err| PipelineError::schema("validate_batch", err.to_string()))?;
            accumulated.extend(posts);
            crate::metrics::batch_elapsed(index, started.elapsed().as_millis());

            if accumulated.len() >= EARLY_STOP_THRESHOLD {
                info!(
                    target = "calliope.pipeline",
                    org_id = org_id,
                    batch_index = index,
                    accumulated = accumulated.len(),
                    "early stop, remaining batches skipped"
                );
                break;
            }
        }

        accumulated.truncate(MAX_AUTO_POSTS);
        Ok(accumulated)
    }

    /// Combined mode: one generation call over a user-curated set of at most
    /// `MAX_COMBINED_IMAGES` images, yielding exactly one post.
    pub async fn run_combined(&self, images: &[ImageReference]) -> Result<Post, PipelineError> {
        if images.is_empty() {
            return Err(PipelineError::invalid_input("combined", "no images provided"));
        }
        if images.len() > MAX_COMBINED_IMAGES {
            return Err(PipelineError::invalid_input("combined", "too_many_images"));
        }

        let request =
            prompt::build_request(&self.resolver, images, CaptionMode::Combined, Utc::now()).await;
        let raw = self
            .llm
            .generate(&request)
            .await
            .map_err(|err| classify_gen_error("generate_combined", err))?;
        validate::parse_combined(&raw, images, Utc::now())
            .map_err(|err| PipelineError::schema("validate_combined", err.to_string()))
    }

    /// Resolve an API request into messages (inline or fetched) and run
    /// auto-selection over them. Does not persist.
    pub async fn run_auto_request(
        &self,
        request: &AutoCaptionRequest,
    ) -> Result<Vec<Post>, PipelineError> {
        if let Some(messages) = &request.messages {
            return self.run_auto_selection(&request.org_id, messages).await;
        }

        let (Some(start), Some(end)) = (request.start_time, request.end_time) else {
            return Err(PipelineError::invalid_input(
                "fetch_messages",
                "provide either messages or start_time and end_time",
            ));
        };
        let supabase = self.supabase.as_ref().ok_or_else(|| {
            PipelineError::internal("fetch_messages", "message repository is not configured")
        })?;
        let messages = supabase
            .fetch_messages_with_images(start, end, &request.org_id)
            .await
            .map_err(|err| PipelineError::upstream("fetch_messages", err.to_string()))?;
        self.run_auto_selection(&request.org_id, &messages).await
    }

    /// Full run for one organization: fetch, generate, persist, then notify.
    /// Notification failures are logged and swallowed.
    pub async fn run_for_organization(
        &self,
        org: &Organization,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Post>, PipelineError> {
        let supabase = self.supabase.as_ref().ok_or_else(|| {
            PipelineError::internal("fetch_messages", "message repository is not configured")
        })?;

        let messages = supabase
            .fetch_messages_with_images(start, end, &org.id)
            .await
            .map_err(|err| PipelineError::upstream("fetch_messages", err.to_string()))?;
        let posts = self.run_auto_selection(&org.id, &messages).await?;
        if posts.is_empty() {
            info!(
                target = "calliope.pipeline",
                org_id = %org.id,
                "no posts generated, nothing to persist"
            );
            return Ok(posts);
        }

        let stored = supabase
            .persist_posts(&posts, &org.id)
            .await
            .map_err(|err| PipelineError::upstream("persist_posts", err.to_string()))?;

        if let (Some(notifier), Some(email)) = (&self.notifier, org.notify_email.as_deref()) {
            if let Err(err) = notifier
                .notify(email, &stored, &org.name, end.date_naive())
                .await
            {
                warn!(
                    target = "calliope.notify",
                    org_id = %org.id,
                    error = %err,
                    "summary notification failed"
                );
            }
        }

        Ok(stored)
    }

    /// Sweep every organization sequentially. One organization's fatal error
    /// is recorded in its report and never cancels the others.
    pub async fn run_all_organizations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrgRunReport>, PipelineError> {
        let supabase = self.supabase.as_ref().ok_or_else(|| {
            PipelineError::internal(
                "list_organizations",
                "organization directory is not configured",
            )
        })?;
        let organizations = supabase
            .list_organizations()
            .await
            .map_err(|err| PipelineError::upstream("list_organizations", err.to_string()))?;

        let mut reports = Vec::with_capacity(organizations.len());
        for org in organizations {
            match self.run_for_organization(&org, start, end).await {
                Ok(posts) => reports.push(OrgRunReport {
                    org_id: org.id,
                    org_name: org.name,
                    posts_created: posts.len(),
                    error: None,
                }),
                Err(err) => {
                    warn!(
                        target = "calliope.pipeline",
                        org_id = %org.id,
                        error = %err,
                        "organization run failed"
                    );
                    reports.push(OrgRunReport {
                        org_id: org.id,
                        org_name: org.name,
                        posts_created: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(reports)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Schema,
    Upstream,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn schema(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Schema,
        }
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Upstream,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

fn classify_gen_error(stage: &'static str, err: GenError) -> PipelineError {
    match err {
        GenError::NotConfigured => PipelineError::internal(stage, err.to_string()),
        GenError::Overloaded | GenError::Http(_) | GenError::InvalidResponse(_) => {
            PipelineError::upstream(stage, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationRequest;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, GenError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<String, GenError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    responses: Mutex::new(VecDeque::from(responses)),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl Generate for ScriptedGenerator {
        fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> impl Future<Output = Result<String, GenError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("generation called more often than scripted");
            async move { next }
        }
    }

    /// One batch per image, so tests control batch counts directly.
    fn singleton_batch_config() -> PipelineConfig {
        PipelineConfig {
            max_batch_bytes: 1,
            per_image_estimate_bytes: 1,
        }
    }

    fn message(image_count: usize) -> EmailMessage {
        EmailMessage {
            id: "email-1".into(),
            subject: Some("New arrivals".into()),
            sender: Some("news@brand.example".into()),
            text_content: "Fresh styles just landed.".into(),
            image_urls: (0..image_count)
                .map(|n| format!("image/png;base64,QUJDRA{n}"))
                .collect(),
            received_at: Utc::now(),
        }
    }

    fn images(count: usize) -> Vec<ImageReference> {
        message(count).image_references()
    }

    fn selections_json(count: usize) -> String {
        let entries: Vec<String> = (0..count)
            .map(|n| {
                format!(r#"{{"image_index":0,"caption":"caption {n}","reasoning":"strong"}}"#)
            })
            .collect();
        format!(r#"{{"selections":[{}]}}"#, entries.join(","))
    }

    #[tokio::test]
    async fn early_stop_skips_remaining_batches() {
        // Five singleton batches, but the third caption arrives in batch two.
        let (generator, calls) = ScriptedGenerator::new(vec![
            Ok(selections_json(2)),
            Ok(selections_json(1)),
        ]);
        let pipeline = Pipeline::with_generator(generator, singleton_batch_config());

        let posts = pipeline
            .run_auto_selection("org-1", &[message(5)])
            .await
            .expect("run should succeed");

        assert_eq!(posts.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn result_is_capped_at_five_posts() {
        let (generator, _calls) = ScriptedGenerator::new(vec![Ok(selections_json(7))]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let posts = pipeline
            .run_auto_selection("org-1", &[message(1)])
            .await
            .expect("run should succeed");

        assert_eq!(posts.len(), MAX_AUTO_POSTS);
    }

    #[tokio::test]
    async fn batch_failure_aborts_the_whole_run() {
        let (generator, calls) = ScriptedGenerator::new(vec![
            Ok(selections_json(1)),
            Err(GenError::Http("HTTP 500".into())),
        ]);
        let pipeline = Pipeline::with_generator(generator, singleton_batch_config());

        let err = pipeline
            .run_auto_selection("org-1", &[message(2)])
            .await
            .expect_err("run should fail");

        assert_eq!(err.kind(), PipelineErrorKind::Upstream);
        assert_eq!(err.stage(), "generate_batch");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unparsable_model_output_is_fatal_for_the_run() {
        let (generator, _calls) =
            ScriptedGenerator::new(vec![Ok("sorry, no JSON today".into())]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let err = pipeline
            .run_auto_selection("org-1", &[message(1)])
            .await
            .expect_err("run should fail");

        assert_eq!(err.kind(), PipelineErrorKind::Schema);
        assert_eq!(err.stage(), "validate_batch");
    }

    #[tokio::test]
    async fn no_images_yields_an_empty_run_without_calls() {
        let (generator, calls) = ScriptedGenerator::new(vec![]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let posts = pipeline
            .run_auto_selection("org-1", &[message(0)])
            .await
            .expect("run should succeed");

        assert!(posts.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn combined_mode_rejects_six_images_before_any_call() {
        let (generator, calls) = ScriptedGenerator::new(vec![]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let err = pipeline
            .run_combined(&images(6))
            .await
            .expect_err("should reject");

        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.detail(), "too_many_images");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn combined_mode_rejects_empty_input() {
        let (generator, calls) = ScriptedGenerator::new(vec![]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let err = pipeline
            .run_combined(&[])
            .await
            .expect_err("should reject");

        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn combined_mode_produces_one_user_generated_post() {
        let (generator, calls) = ScriptedGenerator::new(vec![Ok(
            r#"{"caption":"one story, three frames","reasoning":"cohesive set"}"#.into(),
        )]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let refs = images(3);
        let post = pipeline
            .run_combined(&refs)
            .await
            .expect("combined run should succeed");

        assert!(post.is_user_generated);
        assert_eq!(post.caption_text, "one story, three frames");
        assert_eq!(post.source_image_url, refs[0].locator);
        assert_eq!(post.source_image_urls.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_request_requires_messages_or_a_window() {
        let (generator, _calls) = ScriptedGenerator::new(vec![]);
        let pipeline = Pipeline::with_generator(generator, PipelineConfig::default());

        let err = pipeline
            .run_auto_request(&AutoCaptionRequest {
                org_id: "org-1".into(),
                messages: None,
                start_time: None,
                end_time: None,
            })
            .await
            .expect_err("should reject");

        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }
}
