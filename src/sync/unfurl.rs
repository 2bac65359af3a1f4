use tokio::sync::mpsc;

/// A newly stored item whose link an enrichment worker may want to visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfurlRequest {
    pub item_id: i64,
    pub feed_id: i64,
    pub url: String,
}

/// Sending half handed to the scheduler.
///
/// The scheduler never waits on the consumer. A full or closed channel
/// refuses the request; the scheduler reports refusals as `unfurl_dropped`
/// in the run summary.
#[derive(Debug, Clone)]
pub struct UnfurlSink {
    tx: mpsc::Sender<UnfurlRequest>,
}

impl UnfurlSink {
    /// Queue a request. Returns `false` if it was dropped.
    pub fn try_send(&self, request: UnfurlRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::debug!(item_id = req.item_id, "Unfurl queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                tracing::debug!(item_id = req.item_id, "Unfurl consumer gone, dropping request");
                false
            }
        }
    }
}

/// Create a bounded unfurl queue. Size it for the largest burst of new
/// items expected in one run.
pub fn unfurl_channel(capacity: usize) -> (UnfurlSink, mpsc::Receiver<UnfurlRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UnfurlSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(item_id: i64) -> UnfurlRequest {
        UnfurlRequest {
            item_id,
            feed_id: 1,
            url: format!("https://example.com/{}", item_id),
        }
    }

    #[tokio::test]
    async fn test_requests_delivered_in_order() {
        let (sink, mut rx) = unfurl_channel(4);
        assert!(sink.try_send(request(1)));
        assert!(sink.try_send(request(2)));

        assert_eq!(rx.recv().await, Some(request(1)));
        assert_eq!(rx.recv().await, Some(request(2)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sink, mut rx) = unfurl_channel(1);
        assert!(sink.try_send(request(1)));
        assert!(!sink.try_send(request(2)));

        assert_eq!(rx.recv().await, Some(request(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_consumer_drops() {
        let (sink, rx) = unfurl_channel(4);
        drop(rx);
        assert!(!sink.try_send(request(1)));
    }
}
