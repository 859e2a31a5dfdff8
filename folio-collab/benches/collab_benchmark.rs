use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use folio_collab::buffer::{BufferCache, MemoryEngine};
use folio_collab::document::DocumentRegistry;
use folio_collab::events::{DocumentEvent, PresenceEvent};
use folio_collab::outbox::{OfflineQueue, Outbox};
use folio_collab::presence::{
    color_for, CursorPosition, CursorRange, Identity, NoopDecorations, PresenceBridge,
    PresenceRecord,
};
use folio_collab::protocol::{ClientMessage, ServerMessage};
use std::hint::black_box;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let notebook_id = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical keystroke-sized update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = ClientMessage::DocumentUpdate {
                notebook_id: black_box(notebook_id),
                update: black_box(update.clone()),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = ServerMessage::Document(DocumentEvent::Update {
        notebook_id: Uuid::new_v4(),
        update: vec![0u8; 64],
    });
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let notebook_id = Uuid::new_v4();

    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for _ in 0..1000 {
                queue.enqueue(notebook_id, vec![0u8; 32]);
            }
            black_box(queue.drain());
        })
    });
}

fn bench_remote_update_apply(c: &mut Criterion) {
    let notebook_id = Uuid::new_v4();
    let block_id = Uuid::new_v4();
    let mut source = DocumentRegistry::new(Outbox::new(10_000));
    source.open(notebook_id).unwrap();
    source
        .set_block_content(notebook_id, block_id, &"x = 1\n".repeat(200))
        .unwrap();
    let update = source.get(notebook_id).unwrap().encode_state();

    c.bench_function("remote_update_apply_1KB", |b| {
        b.iter_batched(
            || {
                let mut registry = DocumentRegistry::new(Outbox::new(16));
                registry.open(notebook_id).unwrap();
                registry
            },
            |mut registry| {
                black_box(registry.apply_remote_update(notebook_id, &update).unwrap());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_local_edit(c: &mut Criterion) {
    let notebook_id = Uuid::new_v4();
    let block_id = Uuid::new_v4();
    let outbox = Outbox::new(16);
    let (link, mut wire) = tokio::sync::mpsc::unbounded_channel();
    outbox.attach(link);
    outbox.mark_joined().unwrap();
    let mut registry = DocumentRegistry::new(outbox);
    registry.open(notebook_id).unwrap();

    c.bench_function("local_insert_and_remove", |b| {
        b.iter(|| {
            registry.insert_text(notebook_id, block_id, 0, "a").unwrap();
            registry.remove_text(notebook_id, block_id, 0, 1).unwrap();
            while wire.try_recv().is_ok() {}
        })
    });
}

fn bench_sweep_60_buffers(c: &mut Criterion) {
    let blocks: Vec<Uuid> = (0..60).map(|_| Uuid::new_v4()).collect();

    c.bench_function("buffer_sweep_60_to_50", |b| {
        b.iter_batched(
            || {
                let mut cache = BufferCache::new(50);
                cache.attach_engine(Box::new(MemoryEngine::new()));
                for id in &blocks {
                    cache.get_or_create(*id, "print(1)", "python");
                }
                cache
            },
            |mut cache| {
                black_box(cache.sweep());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_color_for(c: &mut Criterion) {
    let user_id = Uuid::new_v4().to_string();

    c.bench_function("presence_color_for", |b| {
        b.iter(|| {
            black_box(color_for(black_box(&user_id)));
        })
    });
}

fn bench_presence_updates_100_peers(c: &mut Criterion) {
    let notebook_id = Uuid::new_v4();
    let block_id = Uuid::new_v4();
    let events: Vec<PresenceEvent> = (0..100)
        .map(|i| {
            let mut participant =
                PresenceRecord::new(&Identity::new(format!("user-{i}"), format!("User {i}")));
            participant.cursor = Some(CursorRange::caret(block_id, CursorPosition::new(i, 0)));
            PresenceEvent::Updated {
                notebook_id,
                participant,
            }
        })
        .collect();

    c.bench_function("presence_updates_100_peers", |b| {
        b.iter_batched(
            || PresenceBridge::new(Outbox::new(16), Box::new(NoopDecorations)),
            |mut bridge| {
                for event in &events {
                    bridge.handle_event(event);
                }
                black_box(bridge.participants(notebook_id));
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_offline_queue,
    bench_remote_update_apply,
    bench_local_edit,
    bench_sweep_60_buffers,
    bench_color_for,
    bench_presence_updates_100_peers,
);

criterion_main!(benches);
