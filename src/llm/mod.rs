mod messages;
pub mod retry;

pub use messages::{ContentBlock, GenClient, GenConfig, GenError, GenMessage, GenerationRequest};

use std::future::Future;

/// Seam between the orchestrator and the hosted generation service. Tests
/// drive the pipeline with scripted implementations.
pub trait Generate: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<String, GenError>> + Send;
}
