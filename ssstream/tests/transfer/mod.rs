//! Uploads which are expected to succeed, verified against the object the in-memory backend
//! assembles.
use crate::{
    committed_part_numbers, make_transfer, uploaded_parts, write_streams, Result, BUCKET, KEY,
    MIB,
};
use more_asserts::*;
use ssstream::{Config, MemoryBackend, SessionState, MIN_PART_SIZE};
use ssstream_testing::test_data::{fixed_pieces, TestPayload};
use std::io::Write;

#[test]
fn large_write_keeps_minimum_part_in_buffer() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(&backend, Config::default());
        let payload = TestPayload::new("12 MiB");

        let mut stream = transfer.begin().await?.remove(0);
        stream.write(&payload.data).await?;
        stream.close().await?;

        let completed = transfer.complete().await?;

        // Everything past the last 5 MiB is split off as soon as the buffer exceeds 10 MiB
        assert_eq!(vec![(1, 7 * MIB), (2, 5 * MIB)], uploaded_parts(&backend));
        assert_eq!(vec![vec![1, 2]], committed_part_numbers(&backend));
        assert_eq!(2, completed.parts);
        assert_eq!(payload.len() as u64, completed.total_bytes);

        let object = backend.object(BUCKET, KEY).unwrap();
        payload.assert_matches(&object.data);
        assert_eq!(SessionState::Committed, transfer.state());

        Ok(())
    })
}

#[test]
fn small_stream_is_uploaded_as_leftover() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(&backend, Config::default());
        let payload = TestPayload::new("3 MiB");

        let mut stream = transfer.begin().await?.remove(0);
        stream.write(&payload.data).await?;
        stream.close().await?;

        let completed = transfer.complete().await?;

        assert_eq!(vec![(1, 3 * MIB)], uploaded_parts(&backend));
        assert_eq!(vec![vec![1]], committed_part_numbers(&backend));
        assert_eq!(1, completed.parts);

        payload.assert_matches(&backend.object(BUCKET, KEY).unwrap().data);

        Ok(())
    })
}

#[test]
fn small_streams_merge_under_lower_part_number() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 2,
                num_upload_workers: 2,
                ..Default::default()
            },
        );
        let payloads = [TestPayload::new("3 MiB"), TestPayload::new("3 MiB")];

        let streams = transfer.begin().await?;
        let second_range = streams[1].part_numbers();
        assert_eq!(1..5001, streams[0].part_numbers());
        assert_eq!(5001..10001, second_range);

        write_streams(streams, &payloads).await?;
        let completed = transfer.complete().await?;

        // However the chunks arrive, the second stream's data goes after the first's
        assert_eq!(vec![(1, 6 * MIB)], uploaded_parts(&backend));
        assert_eq!(vec![vec![1]], committed_part_numbers(&backend));
        assert_eq!(1, completed.parts);

        let expected = [payloads[0].data.clone(), payloads[1].data.clone()].concat();
        TestPayload::from_data(expected).assert_matches(&backend.object(BUCKET, KEY).unwrap().data);

        Ok(())
    })
}

#[test]
fn many_streams_round_trip() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let config = Config {
            num_streams: 4,
            num_upload_workers: 3,
            queue_capacity: 2,
            ..Default::default()
        };
        let transfer = make_transfer(&backend, config);

        // Every stream writes at least the minimum part size, so stream order is preserved
        let payloads = ["5 MiB", "17 MiB", "9 MiB", "23 MiB"]
            .into_iter()
            .map(TestPayload::new)
            .collect::<Vec<_>>();

        let streams = transfer.begin().await?;
        let ranges = streams
            .iter()
            .map(|stream| stream.part_numbers())
            .collect::<Vec<_>>();
        write_streams(streams, &payloads).await?;

        let completed = transfer.complete().await?;

        let expected = TestPayload::from_data(
            payloads
                .iter()
                .map(|payload| payload.data.to_vec())
                .collect::<Vec<_>>()
                .concat(),
        );
        let object = backend.object(BUCKET, KEY).unwrap();
        expected.assert_matches(&object.data);
        assert_eq!(expected.len() as u64, completed.total_bytes);

        // Each part number uploaded exactly once, presented in ascending order at commit
        let mut uploaded = uploaded_parts(&backend)
            .into_iter()
            .map(|(part_number, _)| part_number)
            .collect::<Vec<_>>();
        uploaded.sort_unstable();
        assert_eq!(vec![uploaded.clone()], committed_part_numbers(&backend));
        assert_eq!(uploaded.len(), completed.parts);

        // Every stream stays within its own part numbers, and starts at the beginning of them
        for range in &ranges {
            let in_range = uploaded
                .iter()
                .filter(|part_number| range.contains(part_number))
                .collect::<Vec<_>>();
            assert_eq!(Some(&&range.start), in_range.first());
        }

        for size in &object.part_sizes[..object.part_sizes.len() - 1] {
            assert_ge!(*size, MIN_PART_SIZE);
        }

        Ok(())
    })
}

/// An undersized leftover from an early stream can't stay under its own part number when a later
/// stream uploaded full parts, because only the last part may be smaller than the minimum
#[test]
fn leftover_is_moved_after_the_last_part() -> Result<()> {
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
        let payloads = [
            TestPayload::new("1 MiB"),
            TestPayload::new("8 MiB"),
            TestPayload::new("2 MiB"),
        ];

        let streams = transfer.begin().await?;
        let middle_start = streams[1].part_numbers().start;
        write_streams(streams, &payloads).await?;

        let completed = transfer.complete().await?;
        assert_eq!(2, completed.parts);
        assert_eq!(
            vec![vec![middle_start, middle_start + 1]],
            committed_part_numbers(&backend)
        );

        let object = backend.object(BUCKET, KEY).unwrap();
        assert_eq!(vec![8 * MIB, 3 * MIB], object.part_sizes);

        let expected = [
            payloads[1].data.clone(),
            payloads[0].data.clone(),
            payloads[2].data.clone(),
        ]
        .concat();
        TestPayload::from_data(expected).assert_matches(&object.data);

        Ok(())
    })
}

#[test]
fn integrity_check_passes() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 2,
                num_upload_workers: 2,
                check_integrity: true,
                ..Default::default()
            },
        );
        let payloads = [TestPayload::new("13 MiB"), TestPayload::new("2 MiB")];

        write_streams(transfer.begin().await?, &payloads).await?;
        let completed = transfer.complete().await?;

        let object = backend.object(BUCKET, KEY).unwrap();
        assert_eq!(Some(object.e_tag), completed.e_tag);
        assert!(completed
            .e_tag
            .unwrap()
            .ends_with(&format!("-{}\"", completed.parts)));

        Ok(())
    })
}

#[test]
fn nothing_written_makes_empty_object() -> Result<()> {
    ssstream_testing::logging::test_with_logging(async move {
        let backend = MemoryBackend::new();
        let transfer = make_transfer(
            &backend,
            Config {
                num_streams: 2,
                ..Default::default()
            },
        );

        for mut stream in transfer.begin().await? {
            stream.close().await?;
        }

        let completed = transfer.complete().await?;
        assert_eq!(0, completed.total_bytes);
        assert_eq!(vec![(1, 0)], uploaded_parts(&backend));
        assert!(backend.object(BUCKET, KEY).unwrap().data.is_empty());

        Ok(())
    })
}

/// Producers running on plain threads, like a synchronous encoder would
#[test]
fn blocking_writers() -> Result<()> {
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
        let payloads = [
            TestPayload::new("6 MiB"),
            TestPayload::new("11 MiB"),
            TestPayload::new("7 MiB"),
        ];

        let writers = transfer
            .begin()
            .await?
            .into_iter()
            .zip(payloads.iter().cloned())
            .map(|(stream, payload)| {
                let mut writer = stream.into_blocking_writer();

                tokio::task::spawn_blocking(move || -> Result<()> {
                    for piece in fixed_pieces(&payload.data, 64 * 1024) {
                        writer.write_all(&piece)?;
                    }
                    writer.flush()?;
                    writer.finish()?;

                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        for writer in writers {
            writer.await??;
        }

        transfer.complete().await?;

        let expected = payloads
            .iter()
            .map(|payload| payload.data.to_vec())
            .collect::<Vec<_>>()
            .concat();
        TestPayload::from_data(expected).assert_matches(&backend.object(BUCKET, KEY).unwrap().data);

        Ok(())
    })
}
