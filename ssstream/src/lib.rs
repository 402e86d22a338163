#![doc = include_str!("../README.md")]

mod backend;
mod buffer;
mod chunk;
mod config;
mod error;
mod handoff;
mod integrity;
mod producer;
mod task_results;
mod transfer;
mod workers;

pub use backend::{
    parse_s3_url, BackendCall, CompletionToken, MemoryBackend, MemoryBackendError,
    MultipartBackend, S3Backend, StoredObject,
};
pub use chunk::{MAX_PART_NUMBER, MAX_PART_SIZE, MIN_PART_SIZE};
pub use config::Config;
pub use error::{BackendError, Result, StreamUploadError};
pub use producer::{BlockingStreamWriter, ChunkProducerStream};
pub use transfer::{CompletedUpload, SessionState, StreamTransfer, UploadSession};
