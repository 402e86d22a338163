//! In-memory [`MultipartBackend`] that keeps uploads and completed objects in process memory.
//!
//! It enforces the same rules S3 does on the calls it receives (part number range, minimum size
//! of every part but the last, `Content-MD5` verification, ETags presented at completion) and
//! records every call it receives, which makes it useful to verify how the engine talks to object
//! storage.  Failures can be injected to exercise error handling.
use super::{CompletionToken, MultipartBackend};
use crate::chunk::{MAX_PART_NUMBER, MIN_PART_SIZE};
use crate::{integrity, Result};
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error reported by [`MemoryBackend`], either because a request violated the multipart upload
/// rules or because a failure was injected.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct MemoryBackendError {
    message: String,
}

/// A call made to the backend, in the order received
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    CreateMultipartUpload {
        bucket: String,
        key: String,
    },
    UploadPart {
        upload_id: String,
        part_number: u32,
        size: usize,
    },
    CompleteMultipartUpload {
        upload_id: String,
        part_numbers: Vec<u32>,
    },
    AbortMultipartUpload {
        upload_id: String,
    },
}

/// An object assembled by a completed multipart upload
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub e_tag: String,
    pub part_sizes: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryBackendState>>,
}

#[derive(Debug, Default)]
struct MemoryBackendState {
    next_upload_id: u64,
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<(String, String), StoredObject>,
    calls: Vec<BackendCall>,
    upload_part_calls: usize,
    faults: Faults,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug)]
struct StoredPart {
    data: Bytes,
    digest: [u8; 16],
    e_tag: String,
}

#[derive(Debug, Default)]
struct Faults {
    fail_upload_part_call: Option<usize>,
    fail_complete: bool,
    fail_abort: bool,
    wrong_complete_e_tag: bool,
    upload_part_delay: Option<Duration>,
    complete_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`th `UploadPart` request (counting from 1) and every one after it
    pub fn fail_upload_part(self, call: usize) -> Self {
        self.lock().faults.fail_upload_part_call = Some(call);
        self
    }

    /// Fail every `CompleteMultipartUpload` request
    pub fn fail_complete(self) -> Self {
        self.lock().faults.fail_complete = true;
        self
    }

    /// Fail every `AbortMultipartUpload` request
    pub fn fail_abort(self) -> Self {
        self.lock().faults.fail_abort = true;
        self
    }

    /// Complete uploads normally, but report an ETag that doesn't match the parts
    pub fn wrong_complete_e_tag(self) -> Self {
        self.lock().faults.wrong_complete_e_tag = true;
        self
    }

    /// Make every `UploadPart` request take at least this long
    pub fn upload_part_delay(self, delay: Duration) -> Self {
        self.lock().faults.upload_part_delay = Some(delay);
        self
    }

    /// Make every `CompleteMultipartUpload` response arrive this long after the upload was
    /// completed (or rejected) on the server
    pub fn complete_delay(self, delay: Duration) -> Self {
        self.lock().faults.complete_delay = Some(delay);
        self
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// The part numbers of every `UploadPart` request received so far, in the order received
    pub fn uploaded_part_numbers(&self) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::UploadPart { part_number, .. } => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    /// How many `CompleteMultipartUpload` requests were received
    pub fn complete_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, BackendCall::CompleteMultipartUpload { .. }))
    }

    /// How many `AbortMultipartUpload` requests were received
    pub fn abort_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, BackendCall::AbortMultipartUpload { .. }))
    }

    /// The object stored at `key` in `bucket`, if a multipart upload for it was completed
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of multipart uploads that were neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBackendState> {
        // Nothing panics while holding this lock, so it's never poisoned
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete_locked(
        state: &mut MemoryBackendState,
        upload_id: &str,
        parts: Vec<CompletionToken>,
    ) -> std::result::Result<Option<String>, crate::error::BackendError> {
        state.calls.push(BackendCall::CompleteMultipartUpload {
            upload_id: upload_id.to_string(),
            part_numbers: parts.iter().map(|part| part.part_number).collect(),
        });

        if state.faults.fail_complete {
            return Err(backend_error("injected CompleteMultipartUpload failure"));
        }

        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| backend_error(format!("NoSuchUpload: {upload_id}")))?;

        match assemble_object(&upload, &parts) {
            Ok(mut object) => {
                if state.faults.wrong_complete_e_tag {
                    object.e_tag = format!("\"{}-{}\"", hex::encode([0u8; 16]), parts.len());
                }

                let e_tag = object.e_tag.clone();
                state
                    .objects
                    .insert((upload.bucket.clone(), upload.key.clone()), object);

                Ok(Some(e_tag))
            }
            Err(message) => {
                // S3 leaves the upload in place when a completion request is rejected
                state.uploads.insert(upload_id.to_string(), upload);

                Err(backend_error(message))
            }
        }
    }
}

fn backend_error(message: impl Into<String>) -> crate::error::BackendError {
    Box::new(MemoryBackendError {
        message: message.into(),
    })
}

fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

#[async_trait::async_trait]
impl MultipartBackend for MemoryBackend {
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let mut state = self.lock();

        state.calls.push(BackendCall::CreateMultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });

        state.next_upload_id += 1;
        let upload_id = format!("memory-upload-{:08}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<String>,
    ) -> Result<String> {
        let context = || crate::error::UploadPartSnafu {
            bucket: bucket.to_string(),
            key: key.to_string(),
            part_number,
        };

        let delay = {
            let mut state = self.lock();

            state.calls.push(BackendCall::UploadPart {
                upload_id: upload_id.to_string(),
                part_number,
                size: body.len(),
            });
            state.upload_part_calls += 1;

            if matches!(state.faults.fail_upload_part_call, Some(call) if state.upload_part_calls >= call)
            {
                return Err(backend_error("injected UploadPart failure")).context(context());
            }

            state.faults.upload_part_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(backend_error(format!("invalid part number {part_number}")))
                .context(context());
        }

        let digest = md5(&body);
        if let Some(content_md5) = content_md5 {
            if content_md5 != integrity::content_md5(&digest) {
                return Err(backend_error("BadDigest: Content-MD5 does not match body"))
                    .context(context());
            }
        }

        let e_tag = format!("\"{}\"", hex::encode(digest));

        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| backend_error(format!("NoSuchUpload: {upload_id}")))
            .context(context())?;

        upload.parts.insert(
            part_number,
            StoredPart {
                data: body,
                digest,
                e_tag: e_tag.clone(),
            },
        );

        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletionToken>,
    ) -> Result<Option<String>> {
        let context = || crate::error::CompleteMultipartUploadSnafu {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        let (result, delay) = {
            let mut state = self.lock();
            let delay = state.faults.complete_delay;

            (Self::complete_locked(&mut state, upload_id, parts), delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        result.context(context())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let mut state = self.lock();

        state.calls.push(BackendCall::AbortMultipartUpload {
            upload_id: upload_id.to_string(),
        });

        let context = || crate::error::AbortMultipartUploadSnafu {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        if state.faults.fail_abort {
            return Err(backend_error("injected AbortMultipartUpload failure")).context(context());
        }

        // Like S3, an upload which was already completed or aborted can't be aborted
        state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| backend_error(format!("NoSuchUpload: {upload_id}")))
            .context(context())?;

        Ok(())
    }
}

/// Validate a completion request against the uploaded parts the way S3 does, and build the
/// resulting object.
fn assemble_object(
    upload: &PendingUpload,
    parts: &[CompletionToken],
) -> std::result::Result<StoredObject, String> {
    if parts.is_empty() {
        return Err("MalformedXML: at least one part must be specified".to_string());
    }

    if parts
        .windows(2)
        .any(|pair| pair[0].part_number >= pair[1].part_number)
    {
        return Err("InvalidPartOrder: parts must be in ascending order".to_string());
    }

    let mut data = BytesMut::new();
    let mut digests = Vec::with_capacity(parts.len());
    let mut part_sizes = Vec::with_capacity(parts.len());

    for (index, token) in parts.iter().enumerate() {
        let part = upload
            .parts
            .get(&token.part_number)
            .filter(|part| part.e_tag == token.e_tag)
            .ok_or_else(|| format!("InvalidPart: part {} not found", token.part_number))?;

        if index + 1 < parts.len() && part.data.len() < MIN_PART_SIZE {
            return Err(format!(
                "EntityTooSmall: part {} is only {} bytes",
                token.part_number,
                part.data.len()
            ));
        }

        data.extend_from_slice(&part.data);
        digests.push(part.digest);
        part_sizes.push(part.data.len());
    }

    Ok(StoredObject {
        data: data.freeze(),
        e_tag: format!("\"{}\"", integrity::multipart_e_tag(digests.iter())),
        part_sizes,
    })
}
