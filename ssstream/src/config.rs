use crate::chunk::{self, MAX_PART_SIZE, MIN_PART_SIZE};
use crate::Result;
use snafu::prelude::*;
use url::Url;

/// The configuration settings that control the behavior of a streaming upload.
///
///
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.  If not specified, the region is taken from the environment.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub aws_region: Option<String>,

    /// The number of independent streams the data will be written into.
    ///
    /// Each stream gets an equal share of the 10,000 part numbers S3 allows in one upload.  Data
    /// is stored in stream order, except that streams with less than 5 MiB of data are combined
    /// with each other and may be moved to the end of the object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1", global = true))]
    pub num_streams: usize,

    /// The number of upload workers which upload parts in parallel.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1", global = true))]
    pub num_upload_workers: usize,

    /// The maximum number of completed parts waiting to be uploaded.
    ///
    /// When the queue is full, writes block until a worker takes a part off the queue.  Each
    /// queued part holds at least `part_size` bytes of memory, so a higher capacity smooths out
    /// uneven upload speeds at the cost of more RAM.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1", global = true))]
    pub queue_capacity: usize,

    /// The target size of each uploaded part.
    ///
    /// Can be specified as an integer, ie "6000000", or with a suffix ie "8MiB".  Must be at
    /// least 5MiB, which is the smallest part S3 accepts.  Parts will typically be somewhat
    /// larger than this.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5MiB", global = true))]
    pub part_size: byte_unit::Byte,

    /// Verify the MD5 of every part on upload, and the ETag of the object after it's completed.
    ///
    /// The object ETag can't be verified for objects encrypted with SSE-KMS or SSE-C, so don't
    /// enable this for buckets which use those.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub check_integrity: bool,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            aws_region: None,
            num_streams: 1,
            num_upload_workers: 1,
            queue_capacity: 1,
            part_size: byte_unit::Byte::from_bytes(MIN_PART_SIZE as u128),
            check_integrity: false,
        }
    }
}

impl Config {
    /// Check that the config describes a possible upload.
    ///
    /// This is done before any request is made to object storage.
    pub fn validate(&self) -> Result<()> {
        // Fails if there are too few or too many streams
        chunk::part_number_ranges(self.num_streams)?;

        ensure!(
            self.num_upload_workers >= 1,
            crate::error::InvalidWorkerCountSnafu
        );
        ensure!(
            self.queue_capacity >= 1,
            crate::error::InvalidQueueCapacitySnafu
        );

        let part_size = self.part_size.get_bytes();
        ensure!(
            part_size >= MIN_PART_SIZE as u128,
            crate::error::PartSizeTooSmallSnafu {
                part_size: part_size as u64,
                min: MIN_PART_SIZE as u64
            }
        );
        ensure!(
            part_size <= MAX_PART_SIZE as u128,
            crate::error::PartSizeTooLargeSnafu {
                part_size: part_size.min(u64::MAX as u128) as u64,
                max: MAX_PART_SIZE
            }
        );

        Ok(())
    }

    /// The part size in bytes.  Only meaningful once [`Self::validate`] has passed.
    pub(crate) fn part_size_bytes(&self) -> usize {
        self.part_size.get_bytes() as usize
    }
}
