//! The orchestrator which owns a multipart upload session from creation to completion or abort.
use crate::backend::MultipartBackend;
use crate::chunk::{self, Chunk};
use crate::handoff::{self, QueueCloser};
use crate::producer::ChunkProducerStream;
use crate::workers::{PartUploader, UploadedPart, WorkerPool};
use crate::{integrity, Config, Result, StreamUploadError};
use snafu::prelude::*;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Where a [`StreamTransfer`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet started; no multipart upload exists
    New,

    /// The multipart upload was created and data is being written
    Open,

    /// `complete` was called and is waiting for the upload to finish
    Completing,

    /// The object was committed.  This is final.
    Committed,

    /// The upload is being aborted
    Aborting,

    /// The upload was aborted, or never created.  This is final, except that a commit which
    /// reached the server before the abort still moves the upload to `Committed`.
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Committed => "committed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        };

        f.write_str(name)
    }
}

/// A multipart upload which exists on the object storage server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Summary of a successfully completed upload
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,

    /// Number of parts the object was assembled from
    pub parts: usize,

    /// Size of the object
    pub total_bytes: u64,

    /// The ETag reported by the server for the new object, if any
    pub e_tag: Option<String>,
}

/// Streams data from one or more producer streams into a single object using a multipart upload.
///
/// Call [`Self::begin`] to create the upload and get the producer streams, write to each stream and
/// close it, then call [`Self::complete`] to commit the object.  The data written to the streams
/// is assembled in stream order: everything written to the first stream, then everything written
/// to the second, and so on.  Streams with less than [`crate::MIN_PART_SIZE`] bytes written in
/// total are merged with each other and may not end up in stream order, but the data of every
/// stream is contiguous.
///
/// If anything goes wrong the upload is aborted, so no orphaned parts are left on the server.
/// [`Self::abort`] can also be called at any time, from any task, to give up on the upload.
///
/// Cloning is cheap; all clones refer to the same upload.
#[derive(Clone)]
pub struct StreamTransfer {
    inner: Arc<StreamTransferInner>,
}

struct StreamTransferInner {
    config: Config,
    backend: Arc<dyn MultipartBackend>,
    bucket: String,
    key: String,
    state: Mutex<TransferState>,
    progress: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    progress_sender: mpsc::UnboundedSender<u64>,
}

struct TransferState {
    status: SessionState,
    session: Option<UploadSession>,
    running: Option<RunningUpload>,
}

/// Handles to the machinery started by `begin`
struct RunningUpload {
    uploader: PartUploader,
    queue_closer: QueueCloser,
    workers: CancellationToken,

    /// Taken by `complete`
    outcome: Option<oneshot::Receiver<Result<Option<Chunk>>>>,
}

impl StreamTransfer {
    /// Prepare an upload of a new object `key` in `bucket`.
    ///
    /// Nothing is sent to the backend until [`Self::begin`].
    pub fn new(
        backend: Arc<dyn MultipartBackend>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        config: Config,
    ) -> Self {
        let (progress_sender, progress) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(StreamTransferInner {
                config,
                backend,
                bucket: bucket.into(),
                key: key.into(),
                state: Mutex::new(TransferState {
                    status: SessionState::New,
                    session: None,
                    running: None,
                }),
                progress: Mutex::new(Some(progress)),
                progress_sender,
            }),
        }
    }

    /// Prepare an upload to an S3 URL like `s3://bucket/key`, using the S3 settings in `config`.
    pub async fn for_s3_url(url: &url::Url, config: Config) -> Result<Self> {
        let (bucket, key) = crate::backend::parse_s3_url(url)?;
        let backend = crate::backend::S3Backend::new(&config).await;

        Ok(Self::new(Arc::new(backend), bucket, key, config))
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().status
    }

    /// The multipart upload, once it's been created
    pub fn session(&self) -> Option<UploadSession> {
        self.lock_state().session.clone()
    }

    /// Receiver which gets the size in bytes of each part as soon as it's uploaded.
    ///
    /// There is only one receiver; this returns `None` if it was already taken.
    pub fn progress(&self) -> Option<mpsc::UnboundedReceiver<u64>> {
        self.inner
            .progress
            .lock()
            .expect("BUG: progress mutex poisoned")
            .take()
    }

    /// Create the multipart upload and start the upload workers.
    ///
    /// Returns `num_streams` producer streams, in the order their data will appear in the object.
    /// Every stream must be closed before [`Self::complete`] can finish.
    ///
    /// The configuration is validated before anything is sent to the backend.  Calling this more
    /// than once is an error, and aborts the upload if it was already started.
    #[instrument(skip(self), fields(bucket = %self.inner.bucket, key = %self.inner.key))]
    pub async fn begin(&self) -> Result<Vec<ChunkProducerStream>> {
        let config = &self.inner.config;
        config.validate()?;
        let ranges = chunk::part_number_ranges(config.num_streams)?;

        let prior = {
            let mut state = self.lock_state();
            let prior = state.status;
            if prior == SessionState::New {
                state.status = SessionState::Open;
            }

            prior
        };

        if prior != SessionState::New {
            let err = crate::error::InvalidStateSnafu {
                operation: "begin",
                state: prior,
            }
            .build();

            return if prior == SessionState::Open {
                Err(self.abort_with(err).await)
            } else {
                Err(err)
            };
        }

        let upload_id = match self
            .inner
            .backend
            .create_multipart_upload(&self.inner.bucket, &self.inner.key)
            .await
        {
            Ok(upload_id) => upload_id,
            Err(e) => {
                error!(err = ?e, "Failed to create multipart upload");
                self.lock_state().status = SessionState::Aborted;
                return Err(e);
            }
        };

        let session = UploadSession {
            bucket: self.inner.bucket.clone(),
            key: self.inner.key.clone(),
            upload_id,
        };

        info!(upload_id = %session.upload_id, "Created multipart upload");

        let (writer, reader) = handoff::bounded(config.queue_capacity);
        let queue_closer = reader.closer();

        let streams = ranges
            .into_iter()
            .map(|range| ChunkProducerStream::new(range, config.part_size_bytes(), writer.clone()))
            .collect::<Result<Vec<_>>>();
        // Only the streams hold the writer, so the workers can tell when they've all been dropped
        drop(writer);

        let uploader = PartUploader::new(
            self.inner.backend.clone(),
            session.clone(),
            config.check_integrity,
            self.inner.progress_sender.clone(),
        );
        let pool = WorkerPool::start(
            uploader.clone(),
            reader,
            config.num_streams,
            config.num_upload_workers,
        );
        let workers = pool.cancellation();
        let (outcome_sender, outcome) = oneshot::channel();

        let aborted_meanwhile = {
            let mut state = self.lock_state();
            state.session = Some(session);
            state.running = Some(RunningUpload {
                uploader,
                queue_closer,
                workers,
                outcome: Some(outcome),
            });

            let aborted_meanwhile = state.status != SessionState::Open;
            if aborted_meanwhile {
                // `abort` couldn't see the session while it was being created, so it's up to us
                state.status = SessionState::Open;
            }

            aborted_meanwhile
        };

        if aborted_meanwhile {
            return Err(self.abort_with(crate::error::AbortedSnafu.build()).await);
        }

        let streams = match streams {
            Ok(streams) => streams,
            Err(e) => return Err(self.abort_with(e).await),
        };

        // The supervisor drives the workers to completion, and aborts the whole upload as soon as
        // any of them fails, whether or not anyone is waiting in `complete` yet
        let me = self.clone();
        tokio::spawn(
            async move {
                let outcome = match pool.finish().await {
                    Ok(leftover) => Ok(leftover),
                    Err(e) => Err(me.abort_with(e).await),
                };

                // `complete` might never be called
                let _ = outcome_sender.send(outcome);
            }
            .instrument(tracing::debug_span!("upload supervisor")),
        );

        Ok(streams)
    }

    /// Wait for every producer stream to be closed and all parts to be uploaded, then commit the
    /// object.
    ///
    /// On failure the upload is aborted and the error that caused it is returned.  The one
    /// exception is a failed integrity check, which is only detected after the object is
    /// committed; see [`StreamUploadError::is_post_commit`].
    ///
    /// If the upload was already aborted, the first call returns the error that caused the abort
    /// ([`StreamUploadError::Aborted`] if it was [`Self::abort`]).
    #[instrument(skip(self), fields(transfer = %self))]
    pub async fn complete(&self) -> Result<CompletedUpload> {
        let (status, session, running) = {
            let mut state = self.lock_state();
            let status = state.status;
            let running = match status {
                SessionState::Open | SessionState::Aborting | SessionState::Aborted => {
                    state.running.as_mut().and_then(|running| {
                        let outcome = running.outcome.take()?;
                        Some((running.uploader.clone(), outcome))
                    })
                }
                _ => None,
            };
            if status == SessionState::Open && running.is_some() {
                state.status = SessionState::Completing;
            }

            (status, state.session.clone(), running)
        };

        let (session, uploader, outcome) = match (status, session, running) {
            (SessionState::Open, Some(session), Some((uploader, outcome))) => {
                (session, uploader, outcome)
            }
            (SessionState::Aborting | SessionState::Aborted, _, Some((_, outcome))) => {
                // Already aborted, most likely because of a failure in the workers; report it
                return match outcome.await {
                    Ok(Err(e)) => Err(e),
                    _ => crate::error::AbortedSnafu.fail(),
                };
            }
            _ => {
                return crate::error::InvalidStateSnafu {
                    operation: "complete",
                    state: status,
                }
                .fail();
            }
        };

        info!("Waiting for upload workers to finish");

        let leftover = match outcome.await {
            Ok(Ok(leftover)) => leftover,
            // The supervisor already aborted the upload
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(self
                    .abort_with(crate::error::UploadOutcomeLostSnafu.build())
                    .await)
            }
        };

        match self.commit(&session, &uploader, leftover).await {
            Ok(completed) => Ok(completed),
            Err(e) if e.is_post_commit() => Err(e),
            Err(e) => Err(self.abort_with(e).await),
        }
    }

    /// Abort the upload, stopping the workers and discarding all uploaded parts.
    ///
    /// Producers blocked writing to their streams fail with [`StreamUploadError::QueueClosed`].
    /// Calling this on an upload which is already aborting or aborted has no effect.
    #[instrument(skip(self), fields(transfer = %self))]
    pub async fn abort(&self) -> Result<()> {
        self.abort_session().await
    }

    /// Abort the upload because of `cause`, and return `cause`.
    ///
    /// A failure to abort is logged rather than returned, since `cause` is the more useful error.
    pub async fn abort_with(&self, cause: StreamUploadError) -> StreamUploadError {
        error!(err = ?cause, transfer = %self, "Aborting multipart upload due to an error");

        if let Err(abort_err) = self.abort_session().await {
            error!(err = ?abort_err, "Failed to abort the multipart upload.  Uploaded parts will remain on the server until they're aborted or expire under the bucket's lifecycle policy");
        }

        cause
    }

    async fn abort_session(&self) -> Result<()> {
        let session = {
            let mut state = self.lock_state();

            match state.status {
                SessionState::Aborting | SessionState::Aborted => {
                    debug!(state = %state.status, "Upload is already aborting");
                    return Ok(());
                }
                SessionState::Committed => {
                    return crate::error::InvalidStateSnafu {
                        operation: "abort",
                        state: state.status,
                    }
                    .fail();
                }
                SessionState::New => {
                    state.status = SessionState::Aborted;
                    return Ok(());
                }
                SessionState::Open | SessionState::Completing => {}
            }

            let Some(session) = state.session.clone() else {
                // `begin` is still creating the upload, and will abort it when it sees this
                state.status = SessionState::Aborting;
                return Ok(());
            };

            state.status = SessionState::Aborting;

            if let Some(running) = &state.running {
                running.workers.cancel();
                running.queue_closer.close();
            }

            session
        };

        let result = self
            .inner
            .backend
            .abort_multipart_upload(&session.bucket, &session.key, &session.upload_id)
            .await;

        {
            let mut state = self.lock_state();
            match state.status {
                SessionState::Committed => {
                    // A commit already in flight won the race, so the object exists
                    warn!(err = ?result.as_ref().err(), "Upload was committed before it could be aborted");
                    return crate::error::InvalidStateSnafu {
                        operation: "abort",
                        state: SessionState::Committed,
                    }
                    .fail();
                }
                _ => state.status = SessionState::Aborted,
            }
        }

        if result.is_ok() {
            info!(upload_id = %session.upload_id, "Aborted multipart upload");
        }

        result
    }

    /// Upload the leftover chunk (if any) and commit the object
    async fn commit(
        &self,
        session: &UploadSession,
        uploader: &PartUploader,
        leftover: Option<Chunk>,
    ) -> Result<CompletedUpload> {
        if let Some(mut leftover) = leftover {
            // Only the last part may be undersized, and the leftover's own number may be lower
            // than parts uploaded by other streams
            let highest = uploader
                .uploaded_parts()
                .iter()
                .map(|part| part.token.part_number)
                .max();
            if let Some(highest) = highest.filter(|highest| *highest > leftover.part_number) {
                ensure!(
                    highest < chunk::MAX_PART_NUMBER,
                    crate::error::NoPartNumberForLeftoverSnafu { highest }
                );

                debug!(
                    from = leftover.part_number,
                    to = highest + 1,
                    "Renumbering leftover chunk so it's the last part"
                );
                leftover.part_number = highest + 1;
            }

            debug!(
                part_number = leftover.part_number,
                size = leftover.size(),
                "Uploading leftover chunk as the final part"
            );
            uploader.upload(leftover).await?;
        }

        if uploader.uploads_started() == 0 {
            // Nothing was written to any stream.  A multipart upload needs at least one part, and
            // the last part may be empty.
            debug!("No data was written; uploading an empty part");
            uploader.upload(Chunk::new(1, Default::default())).await?;
        }

        let parts = sorted_parts(uploader)?;
        let total_bytes = parts.iter().map(|part| part.size as u64).sum::<u64>();
        let tokens = parts.iter().map(|part| part.token.clone()).collect();

        debug!(parts = parts.len(), total_bytes, "Completing multipart upload");

        let e_tag = self
            .inner
            .backend
            .complete_multipart_upload(&session.bucket, &session.key, &session.upload_id, tokens)
            .await?;

        {
            let mut state = self.lock_state();
            if state.status != SessionState::Completing {
                // The server committed the object before the abort reached it, so the abort
                // can't have succeeded
                warn!(state = %state.status, "Upload was aborted while it was being committed, but the commit went through");
            }

            state.status = SessionState::Committed;
        }

        info!(parts = parts.len(), total_bytes, "Multipart upload completed");

        if self.inner.config.check_integrity {
            verify_e_tag(session, &parts, e_tag.as_deref())?;
        }

        Ok(CompletedUpload {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            upload_id: session.upload_id.clone(),
            parts: parts.len(),
            total_bytes,
            e_tag,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TransferState> {
        self.inner
            .state
            .lock()
            .expect("BUG: transfer state mutex poisoned")
    }
}

/// Every uploaded part in part number order, after checking that every upload which was started
/// produced exactly one completion token
fn sorted_parts(uploader: &PartUploader) -> Result<Vec<UploadedPart>> {
    let mut parts = uploader.uploaded_parts();
    let expected = uploader.uploads_started();

    ensure!(
        parts.len() == expected,
        crate::error::MissingCompletionTokensSnafu {
            expected,
            actual: parts.len()
        }
    );

    // Part numbers are assigned in stream order, so sorting puts the data in the right order
    parts.sort_unstable_by_key(|part| part.token.part_number);

    if let Some(pair) = parts
        .windows(2)
        .find(|pair| pair[0].token.part_number == pair[1].token.part_number)
    {
        return crate::error::DuplicateCompletionTokenSnafu {
            part_number: pair[0].token.part_number,
        }
        .fail();
    }

    Ok(parts)
}

fn verify_e_tag(session: &UploadSession, parts: &[UploadedPart], actual: Option<&str>) -> Result<()> {
    let expected = integrity::multipart_e_tag(parts.iter().filter_map(|part| part.digest.as_ref()));
    let actual = actual.map(integrity::normalize_e_tag).unwrap_or_default();

    ensure!(
        actual == expected,
        crate::error::IntegrityCheckSnafu {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            expected,
            actual,
        }
    );

    debug!(e_tag = %expected, "Object ETag matches the uploaded parts");

    Ok(())
}

/// Shorten `s` to about `max_len` characters by replacing the middle with `...`.
///
/// Strings which are less than 10% over `max_len` are returned unchanged, since shortening them
/// doesn't gain much.
fn skip_middle(s: &str, max_len: usize) -> std::borrow::Cow<'_, str> {
    let len = s.chars().count();
    if len * 10 < max_len * 11 {
        return s.into();
    }

    let side = max_len.saturating_sub(3) / 2;
    let head = s.chars().take(side);
    let tail = s.chars().skip(len - side);

    head.chain("...".chars()).chain(tail).collect::<String>().into()
}

impl fmt::Display for StreamTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upload_id = self
            .session()
            .map(|session| skip_middle(&session.upload_id, 21).into_owned())
            .unwrap_or_else(|| "<none>".to_string());

        write!(
            f,
            "[Streaming upload to {}/{} with id {}]",
            self.inner.bucket, self.inner.key, upload_id
        )
    }
}

impl fmt::Debug for StreamTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransfer")
            .field("bucket", &self.inner.bucket)
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("backend", &self.inner.backend)
            .finish()
    }
}
