//! Property tests for byte accounting and the concurrency cap.

mod common;

use std::sync::Arc;

use chunkway_core::batch::BatchCoordinator;
use chunkway_core::channel::memory::MemoryTransport;
use chunkway_core::preflight::UploadSettings;
use chunkway_core::uploader::EntryUploader;
use proptest::prelude::*;

use common::Fixture;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunks_cover_file_exactly(size in 1usize..5_000, chunk_size in 1u64..1_500) {
        let (lengths, received, original, percents) = runtime().block_on(async {
            let fixture = Fixture::new("prop");
            let entry = fixture.ready_bytes("p.bin", size);
            let transport = MemoryTransport::new();
            let uploader = EntryUploader::new(entry.clone(), chunk_size, Arc::new(transport.clone()));

            let (tx, rx) = tokio::sync::oneshot::channel();
            uploader.upload(move || {
                let _ = tx.send(());
            });
            rx.await.unwrap();

            (
                transport.chunk_lengths(entry.entry_ref()),
                transport.received(entry.entry_ref()),
                entry.file().read_all().await.unwrap(),
                fixture.view.percents_for(entry.entry_ref()),
            )
        });

        prop_assert_eq!(received, original);
        prop_assert_eq!(lengths.iter().sum::<usize>(), size);
        let chunk = usize::try_from(chunk_size).unwrap();
        prop_assert!(lengths.iter().all(|&len| len > 0 && len <= chunk));
        prop_assert!(lengths[..lengths.len() - 1].iter().all(|&len| len == chunk));
        prop_assert!(percents.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(percents.last().copied(), Some(100));
    }

    #[test]
    fn in_flight_never_exceeds_cap(entries in 1usize..12, max in 1usize..5) {
        let (peak, done) = runtime().block_on(async {
            let fixture = Fixture::new("cap");
            let selected: Vec<_> = (0..entries)
                .map(|i| fixture.ready_bytes(&format!("e{i}.bin"), 3 + i))
                .collect();
            let transport = MemoryTransport::new();
            let settings = UploadSettings { chunk_size: 2, max_concurrency: max };

            let coordinator = BatchCoordinator::channel_uploader(
                selected.clone(),
                settings,
                Arc::new(transport),
                None,
            );
            coordinator.wait().await;

            (
                coordinator.peak_in_flight(),
                selected.iter().filter(|e| e.is_done()).count(),
            )
        });

        prop_assert!(peak <= max);
        prop_assert_eq!(done, entries);
    }
}
