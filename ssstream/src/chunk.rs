//! Units of work passed from producer streams to upload workers, and the limits imposed on them
//! by the S3 multipart upload API.
use crate::buffer::GrowableBuffer;
use crate::{Result, StreamUploadError};
use snafu::prelude::*;
use std::ops::Range;

/// Every part except the last one in a multipart upload must be at least this big
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// No single part may be bigger than this
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Part numbers are `1..=MAX_PART_NUMBER`
pub const MAX_PART_NUMBER: u32 = 10_000;

/// A contiguous piece of the object being uploaded, with the part number it will be uploaded as.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub part_number: u32,
    pub buffer: GrowableBuffer,
}

impl Chunk {
    pub fn new(part_number: u32, buffer: GrowableBuffer) -> Self {
        Self {
            part_number,
            buffer,
        }
    }

    pub fn size(&self) -> usize {
        self.buffer.size_bytes()
    }

    /// `true` if this chunk can't be uploaded on its own unless it's the final part of the object
    pub fn is_undersized(&self) -> bool {
        self.size() < MIN_PART_SIZE
    }

    /// Merge two undersized chunks.
    ///
    /// The upload order of chunks is unrelated to their logical order, so the data of the chunk
    /// with the higher part number is always appended to the one with the lower number, and the
    /// merged chunk keeps the lower part number.
    pub fn merge(self, other: Chunk) -> Chunk {
        let (mut lower, higher) = if self.part_number < other.part_number {
            (self, other)
        } else {
            (other, self)
        };

        lower.buffer.append_buffer(higher.buffer);

        lower
    }
}

/// What producer streams put on the handoff queue
#[derive(Debug)]
pub(crate) enum QueueItem {
    Chunk(Chunk),

    /// A producer stream was closed and will never put anything else on the queue
    EndOfStream,

    /// A producer stream hit an error it can't recover from.  The worker which takes this fails
    /// with the error, which aborts the transfer.
    Failed(crate::StreamUploadError),
}

/// Divide the part numbers `1..=MAX_PART_NUMBER` evenly into `num_streams` disjoint ranges.
///
/// The ranges are contiguous, in ascending order, and together cover every valid part number.
pub(crate) fn part_number_ranges(num_streams: usize) -> Result<Vec<Range<u32>>> {
    ensure!(
        (1..=MAX_PART_NUMBER as usize).contains(&num_streams),
        crate::error::InvalidStreamCountSnafu {
            count: num_streams,
            max: MAX_PART_NUMBER as usize
        }
    );

    let num_streams = num_streams as u64;
    let mut start = 1u32;

    Ok((0..num_streams)
        .map(|i| {
            let end = ((i + 1) * MAX_PART_NUMBER as u64 / num_streams) as u32 + 1;
            let range = start..end;
            start = end;

            range
        })
        .collect())
}

/// Validate a part number range assigned to a single producer stream
pub(crate) fn validate_part_number_range(range: &Range<u32>) -> Result<()> {
    if range.start < 1 || range.end <= range.start || range.end > MAX_PART_NUMBER + 1 {
        return Err(StreamUploadError::InvalidPartNumberRange {
            start: range.start,
            end: range.end,
            max: MAX_PART_NUMBER,
        });
    }

    Ok(())
}
