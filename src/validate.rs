use crate::models::{ImageReference, Post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("response is not valid JSON: {0}")]
    Parse(String),
    #[error("response is missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct SelectionsPayload {
    #[serde(default)]
    selections: Vec<SelectionEntry>,
}

#[derive(Debug, Deserialize)]
struct SelectionEntry {
    image_index: i64,
    caption: String,
    #[allow(dead_code)]
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct CombinedPayload {
    #[serde(default)]
    caption: String,
    #[allow(dead_code)]
    #[serde(default)]
    reasoning: String,
}

/// Drop a surrounding markdown code fence, if any, so the remainder can be
/// treated as JSON.
pub fn strip_code_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Turn a selection-mode response into posts, re-linked to the batch images
/// by `image_index`. Out-of-range indices are dropped with a warning; an
/// empty or missing `selections` array yields zero posts, not an error.
pub fn parse_selections(
    raw: &str,
    batch: &[ImageReference],
    now: DateTime<Utc>,
) -> Result<Vec<Post>, ValidateError> {
    let cleaned = strip_code_fence(raw);
    let payload: SelectionsPayload =
        serde_json::from_str(&cleaned).map_err(|err| ValidateError::Parse(err.to_string()))?;

    let mut posts = Vec::with_capacity(payload.selections.len());
    for entry in payload.selections {
        let image = usize::try_from(entry.image_index)
            .ok()
            .and_then(|index| batch.get(index));
        let Some(image) = image else {
            warn!(
                target = "calliope.pipeline",
                image_index = entry.image_index,
                batch_len = batch.len(),
                "selection index out of range, dropping entry"
            );
            continue;
        };
        posts.push(Post {
            caption_text: entry.caption,
            email_id: image.email_id.clone(),
            source_image_url: image.locator.clone(),
            source_image_urls: vec![image.locator.clone()],
            created_at: now,
            is_user_generated: false,
        });
    }
    Ok(posts)
}

/// Turn a combined-mode response into the single post it describes. The
/// first image is the primary; the full ordered list rides along.
pub fn parse_combined(
    raw: &str,
    images: &[ImageReference],
    now: DateTime<Utc>,
) -> Result<Post, ValidateError> {
    let cleaned = strip_code_fence(raw);
    let payload: CombinedPayload =
        serde_json::from_str(&cleaned).map_err(|err| ValidateError::Parse(err.to_string()))?;

    if payload.caption.trim().is_empty() {
        return Err(ValidateError::MissingField("caption"));
    }
    let primary = images.first().ok_or(ValidateError::MissingField("images"))?;

    Ok(Post {
        caption_text: payload.caption,
        email_id: primary.email_id.clone(),
        source_image_url: primary.locator.clone(),
        source_image_urls: images.iter().map(|image| image.locator.clone()).collect(),
        created_at: now,
        is_user_generated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(count: usize) -> Vec<ImageReference> {
        (0..count)
            .map(|n| ImageReference {
                locator: format!("https://example.com/{n}.jpg"),
                email_id: format!("email-{n}"),
                subject: None,
                sender: None,
                text_snippet: String::new(),
            })
            .collect()
    }

    #[test]
    fn fenced_and_bare_json_parse_identically() {
        let bare = r#"{"caption":"x","reasoning":"r"}"#;
        let fenced = "```json\n{\"caption\":\"x\",\"reasoning\":\"r\"}\n```";
        let images = batch(1);
        let now = Utc::now();
        let a = parse_combined(bare, &images, now).expect("bare");
        let b = parse_combined(fenced, &images, now).expect("fenced");
        assert_eq!(a.caption_text, b.caption_text);
    }

    #[test]
    fn out_of_range_index_is_dropped_and_valid_entries_survive() {
        let raw = r#"{"selections":[
            {"image_index":1,"caption":"keep me","reasoning":"good light"},
            {"image_index":99,"caption":"drop me","reasoning":"no such image"},
            {"image_index":-1,"caption":"drop me too","reasoning":"negative"}
        ]}"#;
        let posts = parse_selections(raw, &batch(5), Utc::now()).expect("parse");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].caption_text, "keep me");
        assert_eq!(posts[0].email_id, "email-1");
        assert_eq!(posts[0].source_image_urls, vec!["https://example.com/1.jpg"]);
        assert!(!posts[0].is_user_generated);
    }

    #[test]
    fn empty_or_missing_selections_yield_zero_posts() {
        let empty = parse_selections(r#"{"selections":[]}"#, &batch(2), Utc::now());
        assert!(empty.expect("empty array").is_empty());
        let missing = parse_selections(r#"{}"#, &batch(2), Utc::now());
        assert!(missing.expect("missing field").is_empty());
    }

    #[test]
    fn unparsable_output_is_a_schema_error() {
        let err = parse_selections("the model got chatty", &batch(1), Utc::now())
            .expect_err("should fail");
        assert!(matches!(err, ValidateError::Parse(_)));
    }

    #[test]
    fn combined_post_uses_first_image_as_primary() {
        let images = batch(3);
        let post = parse_combined(
            r#"{"caption":"three looks, one story","reasoning":"cohesive"}"#,
            &images,
            Utc::now(),
        )
        .expect("parse");
        assert_eq!(post.source_image_url, "https://example.com/0.jpg");
        assert_eq!(post.source_image_urls.len(), 3);
        assert_eq!(post.email_id, "email-0");
        assert!(post.is_user_generated);
    }

    #[test]
    fn combined_without_caption_is_a_schema_error() {
        let err = parse_combined(r#"{"caption":"  "}"#, &batch(1), Utc::now())
            .expect_err("should fail");
        assert!(matches!(err, ValidateError::MissingField("caption")));
    }
}
