//! Bounded, closable queue which hands chunks from the producer streams to the upload workers.
//!
//! This is a thin layer over a bounded [`tokio::sync::mpsc`] channel.  The extra bit is that the
//! queue can be closed from anywhere: once closed, producers blocked in [`QueueWriter::put`] fail
//! immediately instead of waiting forever for a worker that was cancelled, while anything already
//! in the queue can still be taken.
use crate::chunk::QueueItem;
use crate::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Create a queue that holds at most `capacity` items.
pub(crate) fn bounded(capacity: usize) -> (QueueWriter, QueueReader) {
    let (sender, receiver) = mpsc::channel(capacity);
    let closer = QueueCloser(CancellationToken::new());

    (
        QueueWriter {
            sender,
            closer: closer.clone(),
        },
        QueueReader { receiver, closer },
    )
}

/// Producer side of the queue.  There is one clone per producer stream.
#[derive(Clone, Debug)]
pub(crate) struct QueueWriter {
    sender: mpsc::Sender<QueueItem>,
    closer: QueueCloser,
}

impl QueueWriter {
    /// Put an item on the queue, waiting for space if the queue is full.
    ///
    /// Fails with [`crate::StreamUploadError::QueueClosed`] if the queue is closed, either before
    /// or while waiting.
    pub async fn put(&self, item: QueueItem) -> Result<()> {
        let closed = || crate::error::QueueClosedSnafu.build();

        if self.closer.is_closed() {
            return Err(closed());
        }

        tokio::select! {
            biased;

            _ = self.closer.0.cancelled() => Err(closed()),
            result = self.sender.send(item) => result.map_err(|_| closed()),
        }
    }
}

/// Consumer side of the queue.
#[derive(Debug)]
pub(crate) struct QueueReader {
    receiver: mpsc::Receiver<QueueItem>,
    closer: QueueCloser,
}

impl QueueReader {
    /// Wait for the next item.
    ///
    /// Returns `None` only once every [`QueueWriter`] has been dropped and the queue is empty.
    pub async fn take(&mut self) -> Option<QueueItem> {
        self.receiver.recv().await
    }

    pub fn closer(&self) -> QueueCloser {
        self.closer.clone()
    }
}

/// Handle which can close the queue without being either a producer or consumer.
#[derive(Clone, Debug)]
pub(crate) struct QueueCloser(CancellationToken);

impl QueueCloser {
    /// Close the queue.  Repeated calls have no effect.
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}
