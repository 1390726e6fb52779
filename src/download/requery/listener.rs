use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::download::errors::DispatchError;
use crate::download::types::{QueryType, SearchQuery};

/// Download-side callbacks for requery progress.
///
/// Called without any supervisor lock held, so implementations may call back
/// into the supervisor.
pub trait RequeryListener: Send + Sync {
    /// Builds the broadcast requery; `None` when there is nothing new to search for.
    fn build_query(&self) -> Option<SearchQuery>;
    fn on_lookup_started(&self, kind: QueryType, expected_wait: Duration);
    fn on_lookup_pending(&self, kind: QueryType, retry_in: Duration);
    fn on_lookup_finished(&self, kind: QueryType);
}

/// Fire-and-forget network send of a broadcast requery. Must not block.
pub trait QueryDispatcher: Send + Sync {
    fn submit(&self, query: SearchQuery) -> Result<(), DispatchError>;
}

/// Hands queries to the network task over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelQueryDispatcher {
    tx: mpsc::Sender<SearchQuery>,
}

impl ChannelQueryDispatcher {
    pub fn new(tx: mpsc::Sender<SearchQuery>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SearchQuery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl QueryDispatcher for ChannelQueryDispatcher {
    fn submit(&self, query: SearchQuery) -> Result<(), DispatchError> {
        self.tx.try_send(query).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::QueueFull,
            TrySendError::Closed(_) => DispatchError::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::FileHash;

    fn query() -> SearchQuery {
        SearchQuery {
            file_hash: FileHash([7u8; 16]),
            file_name: "a.bin".to_string(),
            file_size: 10,
        }
    }

    #[tokio::test]
    async fn channel_dispatcher_delivers_and_reports_backpressure() {
        let (dispatcher, mut rx) = ChannelQueryDispatcher::channel(1);

        dispatcher.submit(query()).expect("first submit");
        assert!(matches!(
            dispatcher.submit(query()),
            Err(DispatchError::QueueFull)
        ));

        assert_eq!(rx.recv().await, Some(query()));
        drop(rx);
        assert!(matches!(
            dispatcher.submit(query()),
            Err(DispatchError::ChannelClosed)
        ));
    }
}
