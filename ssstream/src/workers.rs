//! The pool of upload workers which take chunks off the handoff queue and upload them.
use crate::backend::{CompletionToken, MultipartBackend};
use crate::chunk::{Chunk, QueueItem};
use crate::handoff::QueueReader;
use crate::task_results::TaskResults;
use crate::{integrity, Result, UploadSession};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Instrument};

/// A part which was successfully uploaded
#[derive(Clone, Debug)]
pub(crate) struct UploadedPart {
    pub token: CompletionToken,
    pub size: usize,

    /// MD5 of the part's contents, only computed when integrity checking is enabled
    pub digest: Option<[u8; 16]>,
}

/// Uploads chunks as parts of a multipart upload and keeps track of what was uploaded.
///
/// Cloning is cheap; all clones share the same record of uploaded parts.
#[derive(Clone)]
pub(crate) struct PartUploader {
    inner: Arc<PartUploaderInner>,
}

struct PartUploaderInner {
    backend: Arc<dyn MultipartBackend>,
    session: UploadSession,
    check_integrity: bool,
    uploads_started: AtomicUsize,
    uploaded: Mutex<Vec<UploadedPart>>,
    progress: mpsc::UnboundedSender<u64>,
}

impl PartUploader {
    pub fn new(
        backend: Arc<dyn MultipartBackend>,
        session: UploadSession,
        check_integrity: bool,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(PartUploaderInner {
                backend,
                session,
                check_integrity,
                uploads_started: AtomicUsize::new(0),
                uploaded: Mutex::new(Vec::new()),
                progress,
            }),
        }
    }

    /// Upload `chunk` under its part number and record the resulting completion token
    #[instrument(skip(self, chunk), fields(part_number = chunk.part_number, size = chunk.size()))]
    pub async fn upload(&self, chunk: Chunk) -> Result<()> {
        let inner = &self.inner;
        let part_number = chunk.part_number;
        let size = chunk.size();
        let digest = inner.check_integrity.then(|| chunk.buffer.digest());

        inner.uploads_started.fetch_add(1, Ordering::SeqCst);

        debug!("Uploading multi-part chunk");

        let e_tag = inner
            .backend
            .upload_part(
                &inner.session.bucket,
                &inner.session.key,
                &inner.session.upload_id,
                part_number,
                chunk.buffer.into_bytes(),
                digest.as_ref().map(integrity::content_md5),
            )
            .await?;

        debug!(%e_tag, "Uploaded multi-part chunk");

        self.lock_uploaded().push(UploadedPart {
            token: CompletionToken { part_number, e_tag },
            size,
            digest,
        });

        // Nobody has to be listening for progress
        let _ = inner.progress.send(size as u64);

        Ok(())
    }

    /// How many uploads were attempted, successful or not
    pub fn uploads_started(&self) -> usize {
        self.inner.uploads_started.load(Ordering::SeqCst)
    }

    /// Everything uploaded so far, in the order the uploads finished
    pub fn uploaded_parts(&self) -> Vec<UploadedPart> {
        self.lock_uploaded().clone()
    }

    fn lock_uploaded(&self) -> std::sync::MutexGuard<'_, Vec<UploadedPart>> {
        self.inner
            .uploaded
            .lock()
            .expect("BUG: uploaded parts mutex poisoned")
    }
}

/// Fixed-size pool of tasks that drain the handoff queue.
///
/// Each worker takes the next item off the queue.  End-of-stream markers are counted, and once
/// every producer stream has been closed the workers exit.  Chunks big enough to be a part on
/// their own are uploaded immediately.  Undersized chunks, which are the final chunks of streams
/// that were closed with less than the minimum part size buffered, go to the leftover slot: if it's
/// empty the chunk waits there, otherwise the two are merged, and uploaded if the result is big
/// enough.  A leftover that's still undersized once all workers have exited is returned by
/// [`Self::finish`]; at that point it's the last part of the whole upload, which S3 accepts
/// regardless of size.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    tasks: TaskResults<()>,
}

struct PoolShared {
    uploader: PartUploader,
    total_producers: usize,

    /// The queue itself and the count of producers which have closed.  These are under one lock
    /// so that a worker can't start waiting on the queue after the last producer was counted.
    intake: tokio::sync::Mutex<Intake>,

    /// Never held across an `await`
    leftover: Mutex<Option<Chunk>>,
}

struct Intake {
    reader: QueueReader,
    finished_producers: usize,
}

impl WorkerPool {
    pub fn start(
        uploader: PartUploader,
        reader: QueueReader,
        total_producers: usize,
        num_workers: usize,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            uploader,
            total_producers,
            intake: tokio::sync::Mutex::new(Intake {
                reader,
                finished_producers: 0,
            }),
            leftover: Mutex::new(None),
        });

        let mut tasks = TaskResults::new();
        for worker in 0..num_workers {
            let shared = shared.clone();
            let span = tracing::debug_span!("upload worker", worker);

            tasks.submit(async move { shared.run_worker().await }.instrument(span));
        }

        debug!(num_workers, total_producers, "Started upload workers");

        Self { shared, tasks }
    }

    /// Cancelling this token stops all workers
    pub fn cancellation(&self) -> CancellationToken {
        self.tasks.cancellation()
    }

    /// Wait for every worker to exit, returning the leftover chunk which still has to be uploaded
    /// (if any).
    ///
    /// Fails with the first error any worker encounters, in which case the other workers are
    /// cancelled.
    pub async fn finish(self) -> Result<Option<Chunk>> {
        self.tasks.await_completion().await?;

        let leftover = self
            .shared
            .leftover
            .lock()
            .expect("BUG: leftover mutex poisoned")
            .take();

        Ok(leftover)
    }
}

impl PoolShared {
    async fn run_worker(&self) -> Result<()> {
        while let Some(chunk) = self.next_chunk().await? {
            let chunk = if chunk.is_undersized() {
                match self.merge_leftover(chunk) {
                    Some(chunk) => chunk,
                    None => continue,
                }
            } else {
                chunk
            };

            self.uploader.upload(chunk).await?;
        }

        debug!("All producer streams closed; worker exiting");

        Ok(())
    }

    /// The next chunk to upload, or `None` once every producer has been closed
    async fn next_chunk(&self) -> Result<Option<Chunk>> {
        let mut intake = self.intake.lock().await;

        loop {
            if intake.finished_producers >= self.total_producers {
                return Ok(None);
            }

            match intake.reader.take().await {
                Some(QueueItem::Chunk(chunk)) => return Ok(Some(chunk)),
                Some(QueueItem::EndOfStream) => {
                    intake.finished_producers += 1;
                    debug!(
                        finished_producers = intake.finished_producers,
                        total_producers = self.total_producers,
                        "Producer stream closed"
                    );
                }
                Some(QueueItem::Failed(e)) => return Err(e),
                None => {
                    return crate::error::ProducerStreamDroppedSnafu {
                        closed: intake.finished_producers,
                        total: self.total_producers,
                    }
                    .fail();
                }
            }
        }
    }

    /// Put an undersized chunk in the leftover slot, merging it with the chunk already there.
    ///
    /// Returns the merged chunk if it's now big enough to upload.
    fn merge_leftover(&self, chunk: Chunk) -> Option<Chunk> {
        let mut slot = self
            .leftover
            .lock()
            .expect("BUG: leftover mutex poisoned");

        match slot.take() {
            None => {
                debug!(
                    part_number = chunk.part_number,
                    size = chunk.size(),
                    "Holding undersized chunk as leftover"
                );
                *slot = Some(chunk);

                None
            }
            Some(existing) => {
                let merged = existing.merge(chunk);

                debug!(
                    part_number = merged.part_number,
                    size = merged.size(),
                    "Merged undersized chunk with leftover"
                );

                if merged.is_undersized() {
                    *slot = Some(merged);
                    None
                } else {
                    Some(merged)
                }
            }
        }
    }
}
