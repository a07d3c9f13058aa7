use tracing::trace;

// Lightweight metrics helpers that stay safe without a recorder installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "calliope.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn batch_elapsed(batch_index: usize, elapsed_ms: u128) {
    trace!(
        target = "calliope.metrics",
        batch_index = batch_index,
        elapsed_ms = elapsed_ms as u64,
        "batch_elapsed"
    );
}
