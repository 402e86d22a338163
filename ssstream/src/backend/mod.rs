use crate::Result;
use bytes::Bytes;

mod memory;
mod s3;

pub use memory::{BackendCall, MemoryBackend, MemoryBackendError, StoredObject};
pub use s3::{parse_s3_url, S3Backend};

/// Backend-issued tag identifying one uploaded part, which must be presented when the upload is
/// completed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompletionToken {
    pub part_number: u32,
    pub e_tag: String,
}

/// An object storage system that supports S3-style multipart uploads.
///
/// The streaming upload engine only ever talks to object storage through this trait, so that it
/// can be pointed at something other than S3 (like [`MemoryBackend`] in tests).
///
/// Implementations report failures with the matching [`crate::StreamUploadError`] variant
/// (`CreateMultipartUpload`, `UploadPart`, and so on).  They should not retry internally beyond
/// whatever their client library does on its own; the engine aborts the whole upload on the
/// first failure.
#[async_trait::async_trait]
pub trait MultipartBackend: std::fmt::Debug + Sync + Send + 'static {
    /// Start a new multipart upload, returning its upload ID
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    /// Upload a single part, returning its ETag.
    ///
    /// If `content_md5` is provided it's the base64 MD5 of `body`, which the backend must verify.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<String>,
    ) -> Result<String>;

    /// Assemble the uploaded parts into the final object.
    ///
    /// `parts` are sorted in ascending part number order.  Returns the ETag of the new object if
    /// the backend reports one.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletionToken>,
    ) -> Result<Option<String>>;

    /// Discard an in-progress multipart upload and all of its parts
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<()>;
}
