use async_trait::async_trait;

use crate::turn::TurnSummary;

/// Optional collaborator producing summaries for freshly generated turns.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Option<TurnSummary>;
}
