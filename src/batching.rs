use crate::models::ImageReference;

/// Conservative per-image weight used for planning. Actual byte size is
/// unknown until fetched, so the planner errs toward smaller batches.
pub const PER_IMAGE_ESTIMATE_BYTES: usize = 500 * 1024;

/// Ceiling on the estimated payload of one generation request.
pub const MAX_BATCH_BYTES: usize = 30 * 1024 * 1024;

/// Greedy single-pass partition of `images` into size-bounded batches.
///
/// An image whose estimate would overflow the ceiling closes the current
/// batch first, unless the batch is empty: a single over-estimate image is
/// always admitted alone rather than dropped. Relative order is preserved.
pub fn plan(
    images: &[ImageReference],
    max_batch_bytes: usize,
    per_item_estimate_bytes: usize,
) -> Vec<Vec<ImageReference>> {
    let mut batches = Vec::new();
    let mut current: Vec<ImageReference> = Vec::new();
    let mut running = 0usize;

    for image in images {
        if running + per_item_estimate_bytes > max_batch_bytes && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            running = 0;
        }
        current.push(image.clone());
        running += per_item_estimate_bytes;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(n: usize) -> ImageReference {
        ImageReference {
            locator: format!("https://example.com/{n}.jpg"),
            email_id: format!("email-{n}"),
            subject: None,
            sender: None,
            text_snippet: String::new(),
        }
    }

    fn images(count: usize) -> Vec<ImageReference> {
        (0..count).map(image).collect()
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(plan(&[], MAX_BATCH_BYTES, PER_IMAGE_ESTIMATE_BYTES).is_empty());
    }

    #[test]
    fn sixty_one_images_fill_the_first_batch_and_sixty_two_starts_a_second() {
        // 61 * 500KB = 30,500KB fits the 30,720KB ceiling exactly once.
        let batches = plan(&images(61), MAX_BATCH_BYTES, PER_IMAGE_ESTIMATE_BYTES);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 61);

        let batches = plan(&images(62), MAX_BATCH_BYTES, PER_IMAGE_ESTIMATE_BYTES);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 61);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn oversized_estimate_still_produces_singleton_batches() {
        let batches = plan(&images(3), 100, 1000);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch.len() == 1));
    }

    #[test]
    fn no_image_is_dropped_and_order_is_preserved() {
        let input = images(10);
        let batches = plan(&input, 3 * 1024, 1024);
        let flattened: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|img| img.locator.as_str())
            .collect();
        let expected: Vec<&str> = input.iter().map(|img| img.locator.as_str()).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn every_batch_minus_its_last_item_fits_the_ceiling() {
        let ceiling = 4 * 1024;
        let weight = 1500;
        for count in 0..20 {
            let batches = plan(&images(count), ceiling, weight);
            for batch in batches {
                assert!(!batch.is_empty());
                assert!((batch.len() - 1) * weight <= ceiling);
            }
        }
    }
}
