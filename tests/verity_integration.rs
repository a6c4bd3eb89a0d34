//! Verified Read Path Integration Tests
//!
//! Exercises the full request pipeline: admission checks, tree walks,
//! corruption modes and teardown.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use blockverity::domain::BlockKind;
use blockverity::pipeline::{BlockRequest, IoBuffer};
use blockverity::policy::VerityMode;
use blockverity::Error;

use common::{format_options, harness, payload, BLOCK};

// =============================================================================
// Clean Reads
// =============================================================================

mod clean_read_tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_every_block() {
        let h = harness(payload(16), format_options(None), |_| {});

        let data = h.target.read_blocks(0, 16).await.unwrap();
        assert_eq!(data, h.payload);
        assert_eq!(h.target.status(), 'V');
        assert_eq!(h.target.metrics().blocks_verified(), 16);
    }

    #[tokio::test]
    async fn test_segmented_buffer() {
        let h = harness(payload(16), format_options(None), |_| {});

        // Segments of 1000 bytes split every block across segments
        let request = BlockRequest::read(2 * 8, IoBuffer::segmented(2 * BLOCK, 1000));
        let buffer = h.target.map(request).await.unwrap();
        assert_eq!(buffer.segments().len(), 9);
        assert_eq!(buffer.to_vec(), h.expected(2, 2));
    }

    #[tokio::test]
    async fn test_version_0_tree() {
        let mut options = format_options(None);
        options.version = 0;
        let h = harness(payload(16), options, |_| {});

        assert_eq!(h.target.read_blocks(3, 5).await.unwrap(), h.expected(3, 5));
    }

    #[tokio::test]
    async fn test_two_level_tree() {
        let options = blockverity::FormatOptions {
            data_block_size: 512,
            hash_block_size: 512,
            ..format_options(None)
        };
        let data: Vec<u8> = (0..40 * 512).map(|i| (i % 253) as u8 | 1).collect();
        let h = harness(data.clone(), options, |_| {});
        assert_eq!(h.target.device().levels(), 2);

        let out = h.target.read_blocks(0, 40).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_data_start_offset() {
        let h = harness(payload(16), format_options(None), |config| config.data_start = 8);

        assert_eq!(h.target.read_blocks(0, 16).await.unwrap(), h.payload);
    }

    #[tokio::test]
    async fn test_reads_after_cache_eviction() {
        let h = harness(payload(16), format_options(None), |_| {});

        h.target.read_blocks(0, 16).await.unwrap();
        h.target.evict_hash_cache();
        assert_eq!(h.target.hash_cache_stats().resident, 0);

        assert_eq!(h.target.read_blocks(7, 1).await.unwrap(), h.expected(7, 1));
    }
}

// =============================================================================
// Request Admission
// =============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn test_misaligned_sector() {
        let h = harness(payload(16), format_options(None), |_| {});

        let result = h
            .target
            .map(BlockRequest::read(1, IoBuffer::contiguous(BLOCK)))
            .await;
        assert_matches!(
            result,
            Err(Error::MisalignedRequest { sector: 1, sectors: 8 })
        );
    }

    #[tokio::test]
    async fn test_partial_sector_length() {
        let h = harness(payload(16), format_options(None), |_| {});

        let result = h
            .target
            .map(BlockRequest::read(0, IoBuffer::contiguous(1000)))
            .await;
        assert_matches!(result, Err(Error::MisalignedRequest { .. }));
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let h = harness(payload(16), format_options(None), |_| {});

        let result = h
            .target
            .map(BlockRequest::read(15 * 8, IoBuffer::contiguous(2 * BLOCK)))
            .await;
        assert_matches!(
            result,
            Err(Error::OutOfRangeRequest {
                end_block: 17,
                data_blocks: 16
            })
        );
    }

    #[tokio::test]
    async fn test_write_rejected() {
        let h = harness(payload(16), format_options(None), |_| {});

        let result = h
            .target
            .map(BlockRequest::write(0, IoBuffer::contiguous(BLOCK)))
            .await;
        assert_matches!(result, Err(Error::WriteAttempted));
        assert_eq!(h.target.status(), 'V');
        assert!(h.notifier.is_empty());
    }

    #[tokio::test]
    async fn test_alignment_checked_before_write() {
        let h = harness(payload(16), format_options(None), |_| {});

        let result = h
            .target
            .map(BlockRequest::write(3, IoBuffer::contiguous(BLOCK)))
            .await;
        assert_matches!(result, Err(Error::MisalignedRequest { .. }));
    }
}

// =============================================================================
// Corruption Handling
// =============================================================================

mod corruption_tests {
    use super::*;

    #[tokio::test]
    async fn test_corrupted_block_fails_io() {
        let h = harness(payload(16), format_options(None), |_| {});
        h.corrupt_data(5, 10);

        assert_matches!(
            h.target.read_blocks(5, 1).await,
            Err(Error::DataCorruption { block: 5 })
        );
        assert_eq!(h.target.status(), 'C');

        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uevent_var(), "DM_VERITY_ERR_BLOCK_NR=0,5");
        assert_eq!(h.target.metrics().corruptions(BlockKind::Data), 1);

        // Neighbours are still readable
        assert_eq!(h.target.read_blocks(4, 1).await.unwrap(), h.expected(4, 1));
    }

    #[tokio::test]
    async fn test_corruption_inside_larger_request() {
        let h = harness(payload(16), format_options(None), |_| {});
        h.corrupt_data(3, 4000);

        let request = BlockRequest::read(0, IoBuffer::segmented(8 * BLOCK, 3000));
        assert_matches!(
            h.target.map(request).await,
            Err(Error::DataCorruption { block: 3 })
        );
    }

    #[tokio::test]
    async fn test_log_only_returns_data() {
        let h = harness(payload(16), format_options(None), |config| {
            config.mode = VerityMode::LogOnly
        });
        h.corrupt_data(5, 10);

        let data = h.target.read_blocks(5, 1).await.unwrap();
        assert_ne!(data[10], h.expected(5, 1)[10]);
        assert_eq!(&data[11..], &h.expected(5, 1)[11..]);

        let report = h.target.status_report();
        assert_eq!(report.status, 'C');
        assert_eq!(report.corrupted_errs, 1);
        assert_eq!(report.mode, VerityMode::LogOnly);
    }

    #[tokio::test]
    async fn test_restart_mode_invokes_handler() {
        let h = harness(payload(16), format_options(None), |config| {
            config.mode = VerityMode::Restart
        });
        h.corrupt_data(5, 10);

        assert!(h.target.read_blocks(5, 1).await.is_err());
        assert_eq!(h.restart.count(), 1);
        assert!(h.restart.last_reason().is_some());
    }

    #[tokio::test]
    async fn test_corrupted_hash_block() {
        let h = harness(payload(16), format_options(None), |_| {});
        // Slot of block 5 in the single hash block
        h.hash.corrupt(5 * 32 + 3, 0x01);

        assert_matches!(
            h.target.read_blocks(5, 1).await,
            Err(Error::MetadataCorruption { block: 0 })
        );
        let events = h.notifier.events();
        assert_eq!(events[0].kind, BlockKind::Metadata);
        assert_eq!(events[0].uevent_var(), "DM_VERITY_ERR_BLOCK_NR=1,0");
    }

    #[tokio::test]
    async fn test_unreadable_data_device() {
        let h = harness(payload(16), format_options(None), |_| {});
        h.data.fail_reads(Some(0..u64::MAX));

        assert_matches!(
            h.target.read_blocks(2, 1).await,
            Err(Error::CacheReadFailure { block: 2, .. })
        );
        // Read failures are not corruption
        assert_eq!(h.target.status(), 'V');
    }
}

// =============================================================================
// Zero Blocks
// =============================================================================

mod zero_block_tests {
    use super::*;

    fn with_zero_block() -> Vec<u8> {
        let mut data = payload(16);
        data[3 * BLOCK..4 * BLOCK].fill(0);
        data
    }

    #[tokio::test]
    async fn test_zero_block_skips_device_contents() {
        let h = harness(with_zero_block(), format_options(None), |config| {
            config.ignore_zero_blocks = true
        });
        h.overwrite_data(3, 0x77);

        let data = h.target.read_blocks(3, 1).await.unwrap();
        assert_eq!(data.len(), BLOCK);
        assert!(data.iter().all(|&b| b == 0));
        assert_eq!(h.target.metrics().zero_blocks(), 1);
        assert_eq!(h.target.status(), 'V');
    }

    #[tokio::test]
    async fn test_zero_block_verified_without_option() {
        let h = harness(with_zero_block(), format_options(None), |_| {});
        h.overwrite_data(3, 0x77);

        assert_matches!(
            h.target.read_blocks(3, 1).await,
            Err(Error::DataCorruption { block: 3 })
        );
    }
}

// =============================================================================
// Concurrency & Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads() {
        let h = Arc::new(harness(payload(16), format_options(None), |_| {}));

        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                let block = (i * 7) % 16;
                let data = h.target.read_blocks(block, 1).await.unwrap();
                assert_eq!(data, h.expected(block, 1));
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(h.target.status(), 'V');
    }

    #[tokio::test]
    async fn test_shutdown_refuses_requests() {
        let h = harness(payload(16), format_options(None), |_| {});
        h.target.read_blocks(0, 1).await.unwrap();

        h.target.shutdown().await;
        assert_matches!(h.target.read_blocks(0, 1).await, Err(Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_status_report_and_table() {
        let h = harness(payload(16), format_options(None), |config| {
            config.ignore_zero_blocks = true
        });

        let table = h.target.table_line();
        assert!(table.starts_with("1 data hash 4096 4096 16 0 sha256 "));
        assert!(table.ends_with(" 1 ignore_zero_blocks"));

        let json = serde_json::to_value(h.target.status_report()).unwrap();
        assert_eq!(json["status"], "V");
        assert_eq!(json["levels"], 1);
        assert_eq!(json["fec"], false);
    }

    #[test]
    fn test_hash_device_too_small() {
        use blockverity::adapters::MemoryDevice;
        use blockverity::pipeline::{TargetDevices, TargetOptions, VerityTarget};

        let image = blockverity::format_image(&payload(16), &format_options(None)).unwrap();
        let config = image.config("data", "hash");
        let devices = TargetDevices {
            data: Arc::new(MemoryDevice::new(payload(16))),
            hash: Arc::new(MemoryDevice::zeroed(100)),
            fec: None,
        };

        assert_matches!(
            VerityTarget::with_devices(&config, devices, TargetOptions::default()),
            Err(Error::InvalidParameter { .. })
        );
    }
}

// =============================================================================
// File-backed Devices
// =============================================================================

mod file_device_tests {
    use super::*;
    use blockverity::adapters::{InMemoryNotifier, RecordingRestart};
    use blockverity::cache::BufferedCacheConfig;
    use blockverity::config::VerityConfig;
    use blockverity::pipeline::{TargetOptions, VerityTarget};

    #[tokio::test]
    async fn test_open_from_table_line() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.img");
        let hash_path = dir.path().join("hash.img");

        let data = payload(16);
        let image = blockverity::format_image(&data, &format_options(None)).unwrap();
        std::fs::write(&data_path, &data).unwrap();
        std::fs::write(&hash_path, &image.hash_image).unwrap();

        let line = image
            .config(
                data_path.to_str().unwrap(),
                hash_path.to_str().unwrap(),
            )
            .to_table_line();
        let config = VerityConfig::from_table_line(&line).unwrap();

        let options = TargetOptions {
            notifier: Arc::new(InMemoryNotifier::new()),
            restart: Arc::new(RecordingRestart::new()),
            cache: BufferedCacheConfig { capacity_blocks: 4 },
        };
        let target = VerityTarget::open(&config, options).unwrap();

        assert_eq!(target.read_blocks(0, 16).await.unwrap(), data);
        assert_eq!(target.table_line(), line);
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.img");
        let hash_path = dir.path().join("hash.img");
        let config_path = dir.path().join("verity.yaml");

        let data = payload(4);
        let image = blockverity::format_image(&data, &format_options(None)).unwrap();
        std::fs::write(&data_path, &data).unwrap();
        std::fs::write(&hash_path, &image.hash_image).unwrap();

        let config = image.config(
            data_path.to_str().unwrap(),
            hash_path.to_str().unwrap(),
        );
        std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = VerityConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded, config);

        let options = TargetOptions {
            restart: Arc::new(RecordingRestart::new()),
            ..TargetOptions::default()
        };
        let target = VerityTarget::open(&loaded, options).unwrap();
        assert_eq!(target.read_blocks(1, 3).await.unwrap(), &data[BLOCK..]);
    }
}
