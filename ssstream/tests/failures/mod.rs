//! Failures anywhere in an upload must abort the multipart upload exactly once and surface the
//! error that caused it.
use crate::{make_transfer, uploaded_parts, write_streams, Result, BUCKET, KEY, MIB};
use assert_matches::assert_matches;
use more_asserts::*;
use ssstream::{Config, MemoryBackend, SessionState, StreamUploadError};
use ssstream_testing::test_data::{fixed_pieces, TestPayload};
use std::time::Duration;

#[test]
fn upload_failure_aborts_once() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new()
            .fail_upload_part(2)
            .upload_part_delay(Duration::from_millis(20));
        let config = Config {
            num_upload_workers: 2,
            queue_capacity: 2,
            ..Default::default()
        };
        let num_workers = config.num_upload_workers;
        let transfer = make_transfer(&backend, config);
        let payload = TestPayload::new("60 MiB");

        let mut stream = transfer.begin().await?.remove(0);
        let writer = tokio::spawn(async move {
            for piece in payload.random_pieces(60) {
                stream.write(&piece).await?;
            }
            stream.close().await
        });

        assert_matches!(
            transfer.complete().await,
            Err(StreamUploadError::UploadPart { .. })
        );

        // The producer either got everything queued before the failure, or found the queue
        // closed
        assert_matches!(writer.await?, Ok(()) | Err(StreamUploadError::QueueClosed));

        assert_eq!(1, backend.abort_calls());
        assert_eq!(0, backend.complete_calls());
        assert_eq!(0, backend.pending_uploads());
        assert_eq!(SessionState::Aborted, transfer.state());

        // At most one upload per worker can be in flight when the failure is noticed
        assert_le!(uploaded_parts(&backend).len(), num_workers + 1);

        Ok(())
    })
}

#[test]
fn abort_unblocks_waiting_producer() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        // Uploads take so long that the producer is certain to fill the queue and block
        let backend = MemoryBackend::new().upload_part_delay(Duration::from_secs(60));
        let transfer = make_transfer(&backend, Config::default());
        let payload = TestPayload::new("40 MiB");

        let mut stream = transfer.begin().await?.remove(0);
        let writer = tokio::spawn(async move {
            for piece in fixed_pieces(&payload.data, MIB) {
                stream.write(&piece).await?;
            }
            stream.close().await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        transfer.abort().await?;
        assert_matches!(
            tokio::time::timeout(Duration::from_secs(5), writer).await??,
            Err(StreamUploadError::QueueClosed)
        );

        // Aborting again does nothing
        transfer.abort().await?;
        assert_eq!(1, backend.abort_calls());
        assert_eq!(0, backend.pending_uploads());

        assert_matches!(transfer.complete().await, Err(StreamUploadError::Aborted));

        Ok(())
    })
}

#[test]
fn commit_failure_aborts() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new().fail_complete();
        let transfer = make_transfer(&backend, Config::default());

        write_streams(transfer.begin().await?, &[TestPayload::new("7 MiB")]).await?;

        assert_matches!(
            transfer.complete().await,
            Err(StreamUploadError::CompleteMultipartUpload { .. })
        );
        assert_eq!(1, backend.complete_calls());
        assert_eq!(1, backend.abort_calls());
        assert_eq!(SessionState::Aborted, transfer.state());

        Ok(())
    })
}

/// A failed abort is logged, but the caller gets the error that caused the abort
#[test]
fn abort_failure_reports_original_error() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new().fail_upload_part(1).fail_abort();
        let transfer = make_transfer(&backend, Config::default());

        let result = write_streams(transfer.begin().await?, &[TestPayload::new("6 MiB")]).await;
        // The failure may be noticed while the stream is still being closed
        if let Err(e) = result {
            assert_matches!(
                e.downcast_ref::<StreamUploadError>(),
                Some(StreamUploadError::QueueClosed)
            );
        }

        assert_matches!(
            transfer.complete().await,
            Err(StreamUploadError::UploadPart { part_number: 1, .. })
        );
        assert_eq!(1, backend.abort_calls());
        assert_eq!(1, backend.pending_uploads());
        assert_eq!(SessionState::Aborted, transfer.state());

        Ok(())
    })
}

/// The object is already committed when the ETag is checked, so a mismatch mustn't abort
#[test]
fn integrity_failure_is_post_commit() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new().wrong_complete_e_tag();
        let transfer = make_transfer(
            &backend,
            Config {
                check_integrity: true,
                ..Default::default()
            },
        );

        write_streams(transfer.begin().await?, &[TestPayload::new("11 MiB")]).await?;

        let err = transfer.complete().await.unwrap_err();
        assert_matches!(&err, StreamUploadError::IntegrityCheck { .. });
        assert!(err.is_post_commit());

        assert_eq!(0, backend.abort_calls());
        assert_eq!(SessionState::Committed, transfer.state());
        assert!(backend.object(BUCKET, KEY).is_some());

        Ok(())
    })
}

#[test]
fn dropped_producer_aborts() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 2,
                ..Default::default()
            },
        );

        let mut streams = transfer.begin().await?;
        let mut abandoned = streams.pop().unwrap();
        abandoned.write(&[0u8; 1024]).await?;
        drop(abandoned);

        let mut closed = streams.pop().unwrap();
        closed.write(&[1u8; 1024]).await?;
        closed.close().await?;
        drop(closed);

        assert_matches!(
            tokio::time::timeout(Duration::from_secs(10), transfer.complete()).await?,
            Err(StreamUploadError::ProducerStreamDropped {
                closed: 1,
                total: 2
            })
        );
        assert_eq!(1, backend.abort_calls());
        assert_eq!(0, backend.complete_calls());

        Ok(())
    })
}

/// Running out of part numbers in one stream is fatal to the whole upload, not just to the write
#[test]
fn exhausted_part_numbers_abort_the_upload() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 10_000,
                num_upload_workers: 2,
                ..Default::default()
            },
        );

        let mut streams = transfer.begin().await?;
        for stream in &mut streams[1..] {
            stream.close().await?;
        }

        // Stream 0 has a single part number, which the first write uses up
        let stream = &mut streams[0];
        assert_eq!(1..2, stream.part_numbers());
        stream.write(&vec![0u8; 11 * MIB]).await?;
        assert_matches!(
            stream.write(&vec![0u8; 6 * MIB]).await,
            Err(StreamUploadError::PartNumberRangeExhausted { start: 1, end: 2 })
        );
        assert!(stream.is_closed());
        stream.close().await?;

        assert_matches!(
            tokio::time::timeout(Duration::from_secs(10), transfer.complete()).await?,
            Err(StreamUploadError::PartNumberRangeExhausted { start: 1, end: 2 })
        );
        assert_eq!(1, backend.abort_calls());
        assert_eq!(0, backend.complete_calls());
        assert_eq!(0, backend.pending_uploads());
        assert_eq!(SessionState::Aborted, transfer.state());

        Ok(())
    })
}

/// Streams that were closed but not dropped don't hide a stream that was dropped without closing
#[test]
fn dropped_producer_detected_while_closed_streams_are_held() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 2,
                ..Default::default()
            },
        );

        let mut streams = transfer.begin().await?;
        drop(streams.pop());

        streams[0].write(&[1u8; 1024]).await?;
        streams[0].close().await?;

        assert_matches!(
            tokio::time::timeout(Duration::from_secs(10), transfer.complete()).await?,
            Err(StreamUploadError::ProducerStreamDropped {
                closed: 1,
                total: 2
            })
        );
        assert_eq!(1, backend.abort_calls());
        assert!(streams[0].is_closed());

        Ok(())
    })
}

/// An abort which arrives after the server already committed the object can't undo it, and the
/// committed object is what gets reported
#[test]
fn abort_racing_commit_reports_committed_object() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new().complete_delay(Duration::from_millis(500));
        let transfer = make_transfer(&backend, Config::default());

        write_streams(transfer.begin().await?, &[TestPayload::new("7 MiB")]).await?;

        let completing = tokio::spawn({
            let transfer = transfer.clone();
            async move { transfer.complete().await }
        });

        tokio::time::timeout(Duration::from_secs(10), async {
            while backend.object(BUCKET, KEY).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        assert_matches!(
            transfer.abort().await,
            Err(StreamUploadError::AbortMultipartUpload { .. } | StreamUploadError::InvalidState { .. })
        );

        let completed = completing.await??;
        assert_eq!(7 * MIB as u64, completed.total_bytes);
        assert_eq!(SessionState::Committed, transfer.state());
        assert!(backend.object(BUCKET, KEY).is_some());

        Ok(())
    })
}

#[test]
fn complete_only_once() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(&backend, Config::default());

        let mut stream = transfer.begin().await?.remove(0);

        let first = tokio::spawn({
            let transfer = transfer.clone();
            async move { transfer.complete().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The first call is still waiting for the stream to be closed
        assert_matches!(
            transfer.complete().await,
            Err(StreamUploadError::InvalidState {
                state: SessionState::Completing,
                ..
            })
        );

        let data = vec![7u8; MIB];
        stream.write(&data).await?;
        stream.close().await?;
        first.await??;

        assert_matches!(
            transfer.complete().await,
            Err(StreamUploadError::InvalidState {
                state: SessionState::Committed,
                ..
            })
        );
        assert_matches!(
            transfer.abort().await,
            Err(StreamUploadError::InvalidState { .. })
        );
        assert_matches!(
            stream.write(b"more").await,
            Err(StreamUploadError::WriteAfterClose)
        );

        assert_eq!(1, backend.complete_calls());
        assert_eq!(0, backend.abort_calls());

        Ok(())
    })
}

#[test]
fn invalid_config_makes_no_requests() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();

        let transfer = make_transfer(
            &backend,
            Config {
                part_size: byte_unit::Byte::from_bytes(MIB as u128),
                ..Default::default()
            },
        );
        assert_matches!(
            transfer.begin().await,
            Err(StreamUploadError::PartSizeTooSmall { .. })
        );

        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 10_001,
                ..Default::default()
            },
        );
        assert_matches!(
            transfer.begin().await,
            Err(StreamUploadError::InvalidStreamCount { .. })
        );

        assert!(backend.calls().is_empty());

        Ok(())
    })
}
