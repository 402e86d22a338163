//! Growable in-memory byte buffer used to accumulate the contents of a single multipart chunk.
//!
//! The buffer supports the two operations the chunking algorithm is built on: splitting off the
//! tail end into a new buffer, and concatenating another buffer onto the end.  Both take the
//! affected buffers by value where a buffer is consumed, so a merged-away buffer can't be used
//! again.
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};

#[derive(Default)]
pub(crate) struct GrowableBuffer {
    inner: BytesMut,
}

impl GrowableBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Read-only view of the buffered bytes, backed by the same storage.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner[..]
    }

    /// Convert into an immutable [`Bytes`] without copying, for handing off to the backend.
    pub fn into_bytes(self) -> Bytes {
        self.inner.freeze()
    }

    /// Truncate this buffer to its first `keep_count` bytes, returning the removed suffix as a
    /// new buffer with room for at least `new_capacity_hint` bytes.
    ///
    /// The suffix isn't copied; it shares storage with this buffer until it has to grow.
    ///
    /// Panics if `keep_count` exceeds the current size.
    pub fn split_suffix(&mut self, keep_count: usize, new_capacity_hint: usize) -> Self {
        assert!(
            keep_count <= self.inner.len(),
            "BUG: cannot keep {keep_count} bytes of a {} byte buffer",
            self.inner.len()
        );

        let mut suffix = self.inner.split_off(keep_count);
        suffix.reserve(new_capacity_hint.saturating_sub(suffix.len()));

        Self { inner: suffix }
    }

    /// Append the entire contents of `other` onto the end of this buffer, consuming `other`.
    pub fn append_buffer(&mut self, other: GrowableBuffer) {
        if self.inner.is_empty() {
            self.inner = other.inner;
        } else {
            self.inner.extend_from_slice(&other.inner);
        }
    }

    /// MD5 digest of the bytes currently held, as used by S3 for `Content-MD5` and ETags
    pub fn digest(&self) -> [u8; 16] {
        Md5::digest(self.as_slice()).into()
    }
}

impl std::fmt::Debug for GrowableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}
