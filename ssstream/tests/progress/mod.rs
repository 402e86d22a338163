//! Progress reporting, which callers use to show how much of the data has made it to the server.
use crate::{make_transfer, write_streams, Result, MIB};
use more_asserts::*;
use ssstream::{Config, MemoryBackend, MIN_PART_SIZE};
use ssstream_testing::test_data::{fixed_pieces, TestPayload};
use std::time::Duration;

#[test]
fn reports_every_uploaded_part() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 3,
                num_upload_workers: 2,
                ..Default::default()
            },
        );
        let mut progress = transfer.progress().unwrap();
        assert!(transfer.progress().is_none());

        let payloads = ["14 MiB", "2 MiB", "6 MiB"]
            .into_iter()
            .map(TestPayload::new)
            .collect::<Vec<_>>();
        write_streams(transfer.begin().await?, &payloads).await?;
        let completed = transfer.complete().await?;

        let mut updates = Vec::new();
        while let Ok(bytes) = progress.try_recv() {
            updates.push(bytes);
        }

        assert_eq!(completed.parts, updates.len());
        assert_eq!(completed.total_bytes, updates.iter().sum::<u64>());

        Ok(())
    })
}

/// Progress arrives while the upload is running, not all at the end
#[test]
fn progress_is_incremental() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new().upload_part_delay(Duration::from_millis(10));
        let transfer = make_transfer(&backend, Config::default());
        let mut progress = transfer.progress().unwrap();

        let payload = TestPayload::new("32 MiB");
        let mut stream = transfer.begin().await?.remove(0);
        for piece in fixed_pieces(&payload.data, MIB) {
            stream.write(&piece).await?;
        }

        // The stream isn't closed yet, but the earlier parts were already uploaded
        let first = tokio::time::timeout(Duration::from_secs(10), progress.recv())
            .await?
            .unwrap();
        assert_ge!(first, MIN_PART_SIZE as u64);

        stream.close().await?;
        let completed = transfer.complete().await?;
        assert_lt!(first, completed.total_bytes);

        Ok(())
    })
}
