use log::debug;
use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::Duration;

use crate::api::Transport;
use crate::error::Result;
use crate::models::chat::SearchResult;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);
pub const DEFAULT_MIN_CHARS: usize = 2;

/// Latest-query-wins search. Every call supersedes the ones before it.
pub struct SearchDebouncer {
    transport: Arc<dyn Transport>,
    delay: Duration,
    min_chars: usize,
    generation: AtomicU64,
}

impl SearchDebouncer {
    pub fn new(transport: Arc<dyn Transport>, delay: Duration, min_chars: usize) -> Self {
        Self {
            transport,
            delay,
            min_chars,
            generation: AtomicU64::new(0),
        }
    }

    /// `Ok(None)` means a newer query took over and this one was abandoned.
    /// Queries below the minimum length resolve to no results immediately.
    pub async fn search(&self, query: &str) -> Result<Option<Vec<SearchResult>>> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let query = query.trim();
        if query.chars().count() < self.min_chars {
            return Ok(Some(Vec::new()));
        }

        tokio::time::sleep(self.delay).await;
        if !self.is_latest(ticket) {
            debug!("Search '{}' superseded before sending", query);
            return Ok(None);
        }

        let results = self.transport.search(query).await?;
        if !self.is_latest(ticket) {
            debug!("Search '{}' superseded while in flight", query);
            return Ok(None);
        }
        Ok(Some(results))
    }

    fn is_latest(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ message, FakeTransport };

    fn debouncer(transport: Arc<FakeTransport>) -> SearchDebouncer {
        SearchDebouncer::new(transport, DEFAULT_DEBOUNCE, DEFAULT_MIN_CHARS)
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_last_query_is_sent() {
        let transport = Arc::new(FakeTransport::unreachable());
        let mut hit = message("m1", "c1");
        hit.original_text = "headache since monday".to_string();
        transport.set_history("c1", vec![hit]);
        let search = debouncer(transport.clone());

        let first = search.search("hea");
        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            search.search("  headache ").await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), None);
        let results = second.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id, "m1");
        assert_eq!(transport.searches(), vec!["headache".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn short_query_clears_without_request() {
        let transport = Arc::new(FakeTransport::unreachable());
        let search = debouncer(transport.clone());

        assert_eq!(search.search(" h ").await.unwrap(), Some(Vec::new()));
        assert!(transport.searches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn short_query_cancels_pending_one() {
        let transport = Arc::new(FakeTransport::unreachable());
        let search = debouncer(transport.clone());

        let pending = search.search("fever");
        let clear = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            search.search("").await
        };
        let (pending, clear) = tokio::join!(pending, clear);
        assert_eq!(pending.unwrap(), None);
        assert_eq!(clear.unwrap(), Some(Vec::new()));
        assert!(transport.searches().is_empty());
    }
}
