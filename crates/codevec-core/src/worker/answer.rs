//! Answer-generation collaborator contract.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Lazy, finite, non-restartable sequence of answer fragments.
pub type FragmentStream = BoxStream<'static, anyhow::Result<String>>;

/// Produces the answer to a question about a session's indexed corpus.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    /// Start answering. Called once per task; fragments must be yielded in
    /// generation order.
    async fn answer(&self, session_id: &str, query: &str) -> anyhow::Result<FragmentStream>;
}
