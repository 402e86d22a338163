//! Generate test payloads and verify them after they've been uploaded
use bytes::Bytes;
use rand::prelude::*;
use sha2::Digest;

/// Random data to upload, along with its hash
#[derive(Clone)]
pub struct TestPayload {
    pub data: Bytes,
    pub hash: [u8; 32],
}

impl TestPayload {
    /// Make a payload of random data with the size specified as a string, so we can use
    /// human-friendly units like "10 KB" or "12 MiB"
    pub fn new(size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self::with_len(size.get_bytes() as usize)
    }

    pub fn with_len(len: usize) -> Self {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);

        Self::from_data(data)
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = sha256(&data);

        Self { data, hash }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split the payload into `count` contiguous pieces of random lengths, some of which may be
    /// empty.  Concatenating the pieces gives back the whole payload.
    pub fn random_pieces(&self, count: usize) -> Vec<Bytes> {
        assert!(count > 0);

        let mut rng = rand::thread_rng();
        let mut cuts = (0..count - 1)
            .map(|_| rng.gen_range(0..=self.data.len()))
            .collect::<Vec<_>>();
        cuts.sort_unstable();

        let mut start = 0;
        let mut pieces = Vec::with_capacity(count);
        for cut in cuts.into_iter().chain(std::iter::once(self.data.len())) {
            pieces.push(self.data.slice(start..cut));
            start = cut;
        }

        pieces
    }

    /// Assert that `actual` is exactly this payload.  Payloads are big, so on mismatch this
    /// reports the length and first differing offset rather than dumping the data.
    pub fn assert_matches(&self, actual: &[u8]) {
        if sha256(actual) == self.hash {
            return;
        }

        let first_difference = self
            .data
            .iter()
            .zip(actual.iter())
            .position(|(expected, actual)| expected != actual);

        panic!(
            "Data mismatch: expected {} bytes, got {}; first difference at offset {:?}",
            self.data.len(),
            actual.len(),
            first_difference
        );
    }
}

impl std::fmt::Debug for TestPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPayload")
            .field("len", &self.data.len())
            .field("hash", &format_args!("{:02x?}", self.hash))
            .finish()
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(data).into()
}

/// Split `data` into pieces of at most `max_len` bytes, the way a producer writing into a stream
/// from a fixed size buffer would
pub fn fixed_pieces(data: &Bytes, max_len: usize) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(max_len)
        .map(move |start| data.slice(start..(start + max_len).min(data.len())))
}
