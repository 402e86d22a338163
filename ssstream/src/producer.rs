//! Producer streams, which accept arbitrary writes and cut them into multipart chunks.
use crate::buffer::GrowableBuffer;
use crate::chunk::{self, Chunk, QueueItem, MIN_PART_SIZE};
use crate::handoff::QueueWriter;
use crate::{Result, StreamUploadError};
use snafu::prelude::*;
use std::io::Write;
use std::ops::Range;
use tracing::{debug, error, trace};

/// Extra room allocated in each buffer beyond what a chunk can grow to before it's split, so that
/// the write which triggers the split usually doesn't have to reallocate.
const BUFFER_EXTRA_ROOM: usize = 1024 * 1024;

/// One of the streams into which the caller writes the data to upload.
///
/// Each stream owns a range of part numbers reserved for it when the transfer began.  Data written
/// to the stream is accumulated in memory and, as soon as there is enough of it, split off into a
/// chunk which is put on the upload queue under the next part number in the range.  Data written
/// to a single stream always ends up in the uploaded object in the order it was written; the
/// order of data written to different streams follows the order of the streams, unless a stream
/// is closed with less than [`MIN_PART_SIZE`] bytes written to it in total.
///
/// The stream must be [`Self::close`]d when the caller is done writing to it.  A stream that is
/// dropped without being closed causes the whole transfer to fail.
///
/// Errors which only affect a single write, such as [`StreamUploadError::QueueClosed`], leave the
/// stream as it was.  Running out of part numbers is fatal to the whole transfer: the stream is
/// closed and the transfer is aborted, with [`crate::StreamTransfer::complete`] reporting the
/// error.
#[derive(Debug)]
pub struct ChunkProducerStream {
    part_numbers: Range<u32>,
    next_part_number: u32,
    part_size: usize,
    /// `None` once the stream is closed
    buffer: Option<GrowableBuffer>,
    /// Dropped when the stream is closed, so the workers can tell when every remaining stream
    /// was dropped without being closed
    queue: Option<QueueWriter>,
}

impl ChunkProducerStream {
    pub(crate) fn new(part_numbers: Range<u32>, part_size: usize, queue: QueueWriter) -> Result<Self> {
        chunk::validate_part_number_range(&part_numbers)?;
        ensure!(
            part_size >= MIN_PART_SIZE,
            crate::error::PartSizeTooSmallSnafu {
                part_size: part_size as u64,
                min: MIN_PART_SIZE as u64
            }
        );

        let mut me = Self {
            next_part_number: part_numbers.start,
            part_numbers,
            part_size,
            buffer: None,
            queue: Some(queue),
        };
        me.buffer = Some(me.new_buffer());

        Ok(me)
    }

    /// The part numbers reserved for this stream
    pub fn part_numbers(&self) -> Range<u32> {
        self.part_numbers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_none()
    }

    /// Write some data to the stream.
    ///
    /// If this write results in a complete chunk, the chunk is put on the upload queue, which
    /// waits for room if the queue is full.  If the transfer has failed or been aborted this fails
    /// with [`StreamUploadError::QueueClosed`]; the actual cause of the failure is reported by
    /// [`crate::StreamTransfer::complete`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let buffer = self
            .buffer
            .as_mut()
            .context(crate::error::WriteAfterCloseSnafu)?;

        buffer.append(data);

        self.check_size().await
    }

    /// Close the stream, putting whatever data remains on the upload queue as this stream's final
    /// chunk.
    ///
    /// The final chunk may be smaller than the minimum part size; such chunks are merged with
    /// other undersized chunks by the upload workers.  Closing an already-closed stream does
    /// nothing.
    pub async fn close(&mut self) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };

        debug!(
            part_numbers = ?self.part_numbers,
            final_size = buffer.size_bytes(),
            "Closing producer stream"
        );

        let result = self.put_chunk(buffer).await;
        let queue = self.queue.take();
        result?;

        match queue {
            Some(queue) => queue.put(QueueItem::EndOfStream).await,
            None => Ok(()),
        }
    }

    /// Wrap this stream in a [`std::io::Write`] implementation for producers that run on plain
    /// threads rather than async tasks.
    ///
    /// Must be called from within a tokio runtime.  The returned writer blocks on that runtime
    /// for each write, so it must only be used from a blocking context such as
    /// [`tokio::task::spawn_blocking`] or a thread not owned by the runtime; using it in an async
    /// task will panic.
    pub fn into_blocking_writer(self) -> BlockingStreamWriter {
        BlockingStreamWriter {
            stream: self,
            handle: tokio::runtime::Handle::current(),
        }
    }

    fn new_buffer(&self) -> GrowableBuffer {
        GrowableBuffer::with_capacity(self.buffer_capacity())
    }

    fn buffer_capacity(&self) -> usize {
        self.part_size + MIN_PART_SIZE + BUFFER_EXTRA_ROOM
    }

    /// If the buffer holds more than a chunk's worth of data, split off everything except the
    /// last [`MIN_PART_SIZE`] bytes and queue it.
    ///
    /// Keeping back the minimum part size guarantees whatever is left in the buffer will make a
    /// valid part on its own, so this stream only ever produces an undersized chunk if the total
    /// amount written to it is less than the minimum.
    async fn check_size(&mut self) -> Result<()> {
        let capacity = self.buffer_capacity();
        let size = match &self.buffer {
            Some(buffer) => buffer.size_bytes(),
            None => return Ok(()),
        };

        if size <= self.part_size + MIN_PART_SIZE {
            return Ok(());
        }

        self.ensure_part_number_available().await?;

        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(());
        };
        let remainder = buffer.split_suffix(size - MIN_PART_SIZE, capacity);
        let full = std::mem::replace(buffer, remainder);

        self.put_chunk(full).await
    }

    async fn put_chunk(&mut self, buffer: GrowableBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        self.ensure_part_number_available().await?;

        let chunk = Chunk::new(self.next_part_number, buffer);
        self.next_part_number += 1;

        trace!(
            part_number = chunk.part_number,
            size = chunk.size(),
            "Queueing chunk"
        );

        let queue = self
            .queue
            .as_ref()
            .context(crate::error::WriteAfterCloseSnafu)?;
        queue.put(QueueItem::Chunk(chunk)).await
    }

    /// Fail the whole transfer if this stream has used up its part numbers
    async fn ensure_part_number_available(&mut self) -> Result<()> {
        if self.next_part_number < self.part_numbers.end {
            return Ok(());
        }

        let (start, end) = (self.part_numbers.start, self.part_numbers.end);
        let exhausted = || crate::error::PartNumberRangeExhaustedSnafu { start, end }.build();

        error!(start, end, "Producer stream ran out of part numbers");

        self.buffer = None;
        if let Some(queue) = self.queue.take() {
            // If the queue is already closed the transfer failed some other way, and that's the
            // error `complete` will report
            let _ = queue.put(QueueItem::Failed(exhausted())).await;
        }

        Err(exhausted())
    }
}

/// Blocking [`std::io::Write`] adapter around a [`ChunkProducerStream`].
///
/// See [`ChunkProducerStream::into_blocking_writer`].
#[derive(Debug)]
pub struct BlockingStreamWriter {
    stream: ChunkProducerStream,
    handle: tokio::runtime::Handle,
}

impl BlockingStreamWriter {
    /// Close the underlying stream.
    ///
    /// Dropping the writer without calling this leaves the stream unclosed, which fails the
    /// transfer.
    pub fn finish(mut self) -> Result<()> {
        self.handle.block_on(self.stream.close())
    }
}

impl Write for BlockingStreamWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.handle
            .block_on(self.stream.write(buf))
            .map_err(|e| {
                let kind = match e {
                    StreamUploadError::QueueClosed => std::io::ErrorKind::BrokenPipe,
                    _ => std::io::ErrorKind::Other,
                };

                std::io::Error::new(kind, e)
            })?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Nothing can be uploaded before a whole chunk is ready
        Ok(())
    }
}
