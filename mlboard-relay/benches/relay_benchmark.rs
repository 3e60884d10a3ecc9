use criterion::{criterion_group, criterion_main, Criterion};
use mlboard_core::{CheckpointEntityKey, ChunkAssembler, ChunkMessage, Event, EventType};
use mlboard_relay::entity_cache::EntityCache;
use mlboard_relay::event_log::EventLog;
use mlboard_relay::protocol::ClientMessage;
use mlboard_relay::rooms::RoomDirectory;
use mlboard_relay::storage::{
    CheckpointStore, CheckpointStoreError, EventStorage, MemoryEventStorage, RocksEventStorage, StoreConfig,
};
use mlboard_core::ConnectionId;
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

/// Store that discards artifacts, so benchmarks measure reassembly only.
struct NullStore;

impl CheckpointStore for NullStore {
    fn persist(&self, _key: &CheckpointEntityKey, _bytes: &[u8]) -> Result<(), CheckpointStoreError> {
        Ok(())
    }

    fn delete(&self, _key: &CheckpointEntityKey) -> Result<bool, CheckpointStoreError> {
        Ok(false)
    }
}

fn metric(epoch: u64) -> Event {
    Event::new(
        EventType::EvaluationResult,
        json!({"grid_search_id": "gs1", "experiment_id": 7, "epoch": epoch, "metrics": {"loss": 0.25, "acc": 0.9}}),
    )
}

fn bench_event_encode(c: &mut Criterion) {
    let msg = ClientMessage::Event(metric(1));
    c.bench_function("event_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let encoded = ClientMessage::Event(metric(1)).encode().unwrap();
    c.bench_function("event_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_chunk_reassembly(c: &mut Criterion) {
    let key = CheckpointEntityKey::new("gs1", "0", "1", "model");
    let chunk = vec![0xABu8; 64 * 1024];

    c.bench_function("reassemble_64_chunks_reversed", |b| {
        b.iter(|| {
            let mut asm = ChunkAssembler::new(key.clone());
            for id in (0..64u32).rev() {
                asm.add_chunk(id, chunk.clone(), 64);
            }
            black_box(asm.assemble());
        })
    });
}

fn bench_entity_cache(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = EntityCache::new(Arc::new(NullStore));
    let key = CheckpointEntityKey::new("gs1", "0", "1", "model");

    c.bench_function("entity_cache_16_chunks", |b| {
        b.iter(|| {
            rt.block_on(async {
                for id in 0..16u32 {
                    let msg = ChunkMessage::chunk(key.clone(), id, vec![1u8; 4096], 16);
                    black_box(cache.handle(msg).await.unwrap());
                }
            })
        })
    });
}

fn bench_append_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = EventLog::open("gs1", Arc::new(MemoryEventStorage::new()), 256).unwrap();

    c.bench_function("append_memory", |b| {
        b.iter(|| rt.block_on(async { black_box(log.append(metric(1)).await.unwrap()) }))
    });
}

fn bench_append_rocks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let storage = RocksEventStorage::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let log = EventLog::open("gs1", Arc::new(storage), 256).unwrap();

    c.bench_function("append_rocks", |b| {
        b.iter(|| rt.block_on(async { black_box(log.append(metric(1)).await.unwrap()) }))
    });
}

fn bench_replay_rocks_10k(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let storage = RocksEventStorage::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    storage.open_room("gs1").unwrap();
    for epoch in 0..10_000 {
        storage.append("gs1", epoch, &metric(epoch)).unwrap();
    }
    let log = EventLog::open("gs1", Arc::new(storage), 256).unwrap();

    c.bench_function("replay_rocks_10k", |b| {
        b.iter(|| black_box(log.replay().filter_map(Result::ok).count()))
    });
}

fn bench_fan_out_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage: Arc<dyn EventStorage> = Arc::new(MemoryEventStorage::new());
    let directory = RoomDirectory::new(storage, 1024, 256);

    let (room, mut subs) = rt.block_on(async {
        let room = directory.get_or_create("gs1").await.unwrap();
        let mut subs = Vec::new();
        for _ in 0..100 {
            subs.push(directory.join(ConnectionId::new(), None, "gs1").await.unwrap().unwrap());
        }
        (room, subs)
    });

    c.bench_function("publish_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                room.publish(metric(1)).await.unwrap();
                for sub in subs.iter_mut() {
                    black_box(sub.recv().await.unwrap());
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_chunk_reassembly,
    bench_entity_cache,
    bench_append_memory,
    bench_append_rocks,
    bench_replay_rocks_10k,
    bench_fan_out_100_subscribers,
);
criterion_main!(benches);
