use crate::llm::{ContentBlock, GenerationRequest};
use crate::models::ImageReference;
use crate::resolver::ImageResolver;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Decoded images above this size are not sent to the model.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const AUTO_SNIPPET_CHARS: usize = 500;
const COMBINED_SNIPPET_CHARS: usize = 200;

pub const PLACEHOLDER_UNLOADABLE: &str = "[Image could not be loaded]";
pub const PLACEHOLDER_TOO_LARGE: &str = "[Image too large to process]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionMode {
    /// Pick the strongest images from a batch, one caption each.
    AutoSelect,
    /// Synthesize a single caption across a user-curated set.
    Combined,
}

impl CaptionMode {
    fn snippet_limit(self) -> usize {
        match self {
            CaptionMode::AutoSelect => AUTO_SNIPPET_CHARS,
            CaptionMode::Combined => COMBINED_SNIPPET_CHARS,
        }
    }
}

/// Assemble the content blocks for one batch, in fixed order: instructions,
/// then per image its email context followed by the image itself, then a
/// closing schema reminder. An image that cannot be resolved, or that fails
/// the size admission check, is replaced by a placeholder text block; it
/// never aborts the batch.
pub async fn build_request(
    resolver: &ImageResolver,
    batch: &[ImageReference],
    mode: CaptionMode,
    run_date: DateTime<Utc>,
) -> GenerationRequest {
    let mut content = Vec::with_capacity(batch.len() * 2 + 2);
    content.push(ContentBlock::Text {
        text: leading_instructions(mode, run_date, batch.len()),
    });

    for (index, image) in batch.iter().enumerate() {
        content.push(ContentBlock::Text {
            text: image_context(index, image, mode.snippet_limit()),
        });
        match resolver.resolve(&image.locator).await {
            Ok(resolved) if resolved.decoded_len() > MAX_IMAGE_BYTES => {
                warn!(
                    target = "calliope.pipeline",
                    email_id = %image.email_id,
                    decoded_len = resolved.decoded_len(),
                    "image exceeds size limit, substituting placeholder"
                );
                content.push(ContentBlock::Text {
                    text: PLACEHOLDER_TOO_LARGE.into(),
                });
            }
            Ok(resolved) => content.push(ContentBlock::Image {
                media_type: resolved.media_type,
                data: resolved.base64_payload,
            }),
            Err(err) => {
                warn!(
                    target = "calliope.pipeline",
                    email_id = %image.email_id,
                    error = %err,
                    "image resolution failed, substituting placeholder"
                );
                content.push(ContentBlock::Text {
                    text: PLACEHOLDER_UNLOADABLE.into(),
                });
            }
        }
    }

    content.push(ContentBlock::Text {
        text: trailing_schema(mode),
    });
    GenerationRequest { content }
}

fn leading_instructions(mode: CaptionMode, run_date: DateTime<Utc>, image_count: usize) -> String {
    let date = run_date.format("%Y-%m-%d");
    match mode {
        CaptionMode::AutoSelect => format!(
            "Today is {date}. Below are {image_count} images extracted from recent marketing \
emails, each preceded by the email context it arrived with. Images are numbered starting at 0 \
in the order shown. Select the images most likely to perform well as social posts and write one \
ready-to-publish caption per selected image.\n\
Respond with JSON only, exactly in this shape:\n\
{{\"selections\":[{{\"image_index\":<number>,\"caption\":\"...\",\"reasoning\":\"...\"}}]}}"
        ),
        CaptionMode::Combined => format!(
            "Today is {date}. Below are {image_count} images a user curated for a single social \
post, each preceded by its email context. Write one caption that ties all of the images \
together.\n\
Respond with JSON only, exactly in this shape:\n\
{{\"caption\":\"...\",\"reasoning\":\"...\"}}"
        ),
    }
}

fn trailing_schema(mode: CaptionMode) -> String {
    match mode {
        CaptionMode::AutoSelect => "Remember: respond with JSON only, exactly \
{\"selections\":[{\"image_index\":<number>,\"caption\":\"...\",\"reasoning\":\"...\"}]}. \
No prose outside the JSON."
            .into(),
        CaptionMode::Combined => "Remember: respond with JSON only, exactly \
{\"caption\":\"...\",\"reasoning\":\"...\"}. No prose outside the JSON."
            .into(),
    }
}

fn image_context(index: usize, image: &ImageReference, snippet_limit: usize) -> String {
    let mut text = format!("Image {index}");
    if let Some(subject) = image.subject.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("\nSubject: {subject}"));
    }
    if let Some(sender) = image.sender.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("\nFrom: {sender}"));
    }
    if !image.text_snippet.trim().is_empty() {
        text.push_str(&format!(
            "\nContext: {}",
            truncate_chars(&image.text_snippet, snippet_limit)
        ));
    }
    text
}

fn truncate_chars(input: &str, limit: usize) -> String {
    if input.chars().count() <= limit {
        input.to_string()
    } else {
        input.chars().take(limit).collect()
    }
}
