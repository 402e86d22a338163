//! Checksums S3 uses to verify uploaded data.
//!
//! For a multipart upload, S3 computes the object's ETag as the MD5 of the concatenated binary
//! MD5 digests of every part, followed by `-` and the number of parts.  Computing the same thing
//! locally lets us detect an object that was assembled from the wrong data.  This doesn't hold
//! for objects encrypted with SSE-KMS or SSE-C, so integrity checking should only be enabled
//! where it's known to apply.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};

/// The ETag S3 should report for a multipart object made of parts with these MD5 digests, in
/// part number order.
pub(crate) fn multipart_e_tag<'a>(part_digests: impl IntoIterator<Item = &'a [u8; 16]>) -> String {
    let mut hasher = Md5::new();
    let mut count = 0usize;

    for digest in part_digests {
        hasher.update(digest);
        count += 1;
    }

    format!("{}-{}", hex::encode(hasher.finalize()), count)
}

/// Value of the `Content-MD5` header for a body with this digest
pub(crate) fn content_md5(digest: &[u8; 16]) -> String {
    STANDARD.encode(digest)
}

/// S3 returns ETags wrapped in double quotes
pub(crate) fn normalize_e_tag(e_tag: &str) -> &str {
    e_tag.trim_matches('"')
}
