use snafu::prelude::*;
use url::Url;

pub type Result<T, E = StreamUploadError> = std::result::Result<T, E>;

/// Opaque error type reported by a [`crate::MultipartBackend`] implementation.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamUploadError {
    #[snafu(display("There must be at least one producer stream and no more than {max}; got {count}"))]
    InvalidStreamCount { count: usize, max: usize },

    #[snafu(display("There must be at least one upload worker"))]
    InvalidWorkerCount,

    #[snafu(display("The queue capacity must be at least 1"))]
    InvalidQueueCapacity,

    #[snafu(display("The part size {part_size} is less than the minimum of {min} bytes"))]
    PartSizeTooSmall { part_size: u64, min: u64 },

    #[snafu(display("The part size {part_size} is greater than the maximum of {max} bytes"))]
    PartSizeTooLarge { part_size: u64, max: u64 },

    #[snafu(display(
        "Invalid part number range {start}..{end}; part numbers must be within 1..={max}"
    ))]
    InvalidPartNumberRange { start: u32, end: u32, max: u32 },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The URL '{url}' is not an S3 URL.  Supported URL schemes are: s3"))]
    UnsupportedUrl { url: Url },

    #[snafu(display("Error creating multipart upload for object '{key}' in S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: BackendError,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' in S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: u32,
        source: BackendError,
    },

    #[snafu(display(
        "Error completing multipart upload of object '{key}' in S3 bucket '{bucket}'"
    ))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: BackendError,
    },

    #[snafu(display("Error aborting multipart upload of object '{key}' in S3 bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: BackendError,
    },

    #[snafu(display("The backend did not return an ETag for {operation} of object '{key}'"))]
    MissingETag { operation: &'static str, key: String },

    #[snafu(display("Cannot write to a producer stream after it has been closed"))]
    WriteAfterClose,

    #[snafu(display("Cannot {operation} a transfer that is in the {state} state"))]
    InvalidState {
        operation: &'static str,
        state: crate::SessionState,
    },

    #[snafu(display(
        "The upload queue was closed because the transfer was aborted.  Call `complete` on the \
         transfer to get the underlying error"
    ))]
    QueueClosed,

    #[snafu(display("The transfer was aborted"))]
    Aborted,

    #[snafu(display(
        "BUG: producer stream exhausted its reserved part number range {start}..{end}"
    ))]
    PartNumberRangeExhausted { start: u32, end: u32 },

    #[snafu(display(
        "The final undersized part can't be numbered after part {highest}, which is the highest \
         part number S3 allows"
    ))]
    NoPartNumberForLeftover { highest: u32 },

    #[snafu(display(
        "BUG: expected {expected} completion tokens but only {actual} were recorded"
    ))]
    MissingCompletionTokens { expected: usize, actual: usize },

    #[snafu(display("BUG: part {part_number} was recorded as uploaded more than once"))]
    DuplicateCompletionToken { part_number: u32 },

    #[snafu(display(
        "All producer stream handles were dropped, but only {closed} of {total} were closed"
    ))]
    ProducerStreamDropped { closed: usize, total: usize },

    #[snafu(display("An upload worker task panicked or was cancelled"))]
    WorkerTaskFailed { source: tokio::task::JoinError },

    #[snafu(display("BUG: the upload worker pool exited without reporting an outcome"))]
    UploadOutcomeLost,

    #[snafu(display(
        "Object '{key}' in S3 bucket '{bucket}' was committed but its ETag '{actual}' does not \
         match the expected '{expected}'.  The object may be corrupt"
    ))]
    IntegrityCheck {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },
}

impl StreamUploadError {
    /// `true` if this error was detected after the object was already committed.
    ///
    /// Such errors never abort the upload; the object exists on the server and it's up to the
    /// caller to decide what to do with it.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, Self::IntegrityCheck { .. })
    }
}
