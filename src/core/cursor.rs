// Stream cursor that only advances on successful reads.
use crate::core::position::{StreamEntry, StreamPosition};
use crate::core::store::Store;

#[derive(Debug, PartialEq)]
pub enum PollResult {
    Entries(Vec<StreamEntry>),
    Empty,
    Failed,
}

#[derive(Debug)]
pub struct StreamCursor {
    position: StreamPosition,
}

impl StreamCursor {
    pub fn new(position: StreamPosition) -> Self {
        Self { position }
    }

    pub fn position(&self) -> &StreamPosition {
        &self.position
    }

    /// Read up to `count` entries after the cursor. Failures are logged and leave the
    /// cursor where it was so the same window is requested again.
    pub async fn poll(&mut self, store: &dyn Store, stream: &str, count: usize) -> PollResult {
        let entries = match store.stream_read(stream, &self.position, count).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(
                    stream,
                    position = %self.position,
                    error = %err,
                    "stream read failed; retrying from same position"
                );
                return PollResult::Failed;
            }
        };

        let Some(last) = entries.last() else {
            return PollResult::Empty;
        };
        if last.id > self.position {
            self.position = last.id.clone();
        } else {
            tracing::warn!(
                stream,
                position = %self.position,
                last = %last.id,
                "store returned entries at or before cursor; keeping cursor"
            );
        }
        PollResult::Entries(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::{PollResult, StreamCursor};
    use crate::core::memory::MemoryStore;
    use crate::core::position::StreamPosition;

    #[tokio::test]
    async fn failed_poll_keeps_position() {
        let store = MemoryStore::new();
        let first = store.stream_add_value("s", "1");
        let mut cursor = StreamCursor::new(StreamPosition::beginning());

        store.fail_next_stream_reads(1);
        assert_eq!(cursor.poll(&store, "s", 10).await, PollResult::Failed);
        assert_eq!(cursor.position(), &StreamPosition::beginning());

        match cursor.poll(&store, "s", 10).await {
            PollResult::Entries(entries) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert_eq!(cursor.position(), &first);
    }

    #[tokio::test]
    async fn empty_poll_keeps_position() {
        let store = MemoryStore::new();
        let only = store.stream_add_value("s", "1");
        let mut cursor = StreamCursor::new(only.clone());
        assert_eq!(cursor.poll(&store, "s", 10).await, PollResult::Empty);
        assert_eq!(cursor.position(), &only);
    }

    #[tokio::test]
    async fn positions_never_decrease_across_polls() {
        let store = MemoryStore::new();
        for n in 0..7 {
            store.stream_add_value("s", n.to_string());
        }
        let mut cursor = StreamCursor::new(StreamPosition::beginning());
        let mut previous = cursor.position().clone();
        for _ in 0..5 {
            cursor.poll(&store, "s", 3).await;
            assert!(cursor.position() >= &previous);
            previous = cursor.position().clone();
        }
    }
}
