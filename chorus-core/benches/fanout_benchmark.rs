use std::hint::black_box;
use std::sync::Arc;

use chorus_core::{
    ChatMessage, ClientFrame, ConnectionId, CountUpdate, LocalBroadcast, LocalFanout,
    MemoryBackbone, OutboundEvent, Relay, RelayConfig, CONNECTION_COUNT_KEY, NEW_MESSAGE_CHANNEL,
};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_message_encode(c: &mut Criterion) {
    c.bench_function("chat_message_stamp_encode", |b| {
        b.iter(|| {
            let event = OutboundEvent::NewMessage(ChatMessage::stamped(black_box("hello there"), 3001));
            black_box(event.encode().unwrap());
        })
    });
}

fn bench_client_frame_decode(c: &mut Criterion) {
    let frame = r#"{"event":"chat:new-message","data":{"message":"hello there"}}"#;

    c.bench_function("client_frame_decode", |b| {
        b.iter(|| {
            black_box(ClientFrame::decode(black_box(frame)).unwrap());
        })
    });
}

fn bench_count_payload_parse(c: &mut Criterion) {
    c.bench_function("count_payload_parse", |b| {
        b.iter(|| {
            black_box(CountUpdate::from_payload(black_box("123456")).unwrap());
        })
    });
}

fn bench_fanout_100_connections(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let group = LocalBroadcast::new(1024);
    let mut receivers: Vec<_> = (0..100)
        .map(|_| rt.block_on(group.add_connection(ConnectionId::new(), None)))
        .collect();
    let event = OutboundEvent::CountUpdated(CountUpdate { count: 100 });

    c.bench_function("fanout_count_100_connections", |b| {
        b.iter(|| {
            black_box(group.broadcast_to_all_local(black_box(&event)));
            for rx in receivers.iter_mut() {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_handle_delivery(c: &mut Criterion) {
    let backbone = MemoryBackbone::new();
    let group = Arc::new(LocalBroadcast::new(1024));
    let relay = Relay::new(
        RelayConfig::default(),
        Arc::new(backbone.counter(CONNECTION_COUNT_KEY)),
        Arc::new(backbone),
        group.clone(),
    );
    let mut rx = group.subscribe();

    c.bench_function("handle_delivery_message", |b| {
        b.iter(|| {
            black_box(relay.handle_delivery(NEW_MESSAGE_CHANNEL, black_box("hi")));
            let _ = rx.try_recv();
        })
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_client_frame_decode,
    bench_count_payload_parse,
    bench_fanout_100_connections,
    bench_handle_delivery,
);
criterion_main!(benches);
