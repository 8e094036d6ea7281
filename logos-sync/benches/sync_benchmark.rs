use criterion::{criterion_group, criterion_main, Criterion};
use logos_sync::awareness::{AwarenessMessage, AwarenessState, CursorColor, PresenceRegistry};
use logos_sync::broadcast::BroadcastGroup;
use logos_sync::crypto::{self, RoomKey};
use logos_sync::document::{merge_updates, SharedDoc};
use logos_sync::protocol::{Frame, MemberRole, Request, RoomMember, ServerEvent, UpdateId, UpdateRecord};
use std::hint::black_box;
use uuid::Uuid;
use yrs::{Text, Transact, WriteTxn};

fn bench_encrypt_update(c: &mut Criterion) {
    let key = RoomKey::generate();
    let update = vec![0u8; 256]; // Typical keystroke-batch delta

    c.bench_function("encrypt_256B", |b| {
        b.iter(|| black_box(crypto::encrypt(&key, black_box(&update)).unwrap()))
    });
}

fn bench_decrypt_update(c: &mut Criterion) {
    let key = RoomKey::generate();
    let sealed = crypto::encrypt(&key, &[0u8; 256]).unwrap();

    c.bench_function("decrypt_256B", |b| {
        b.iter(|| black_box(crypto::decrypt(&key, black_box(&sealed)).unwrap()))
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = Frame::Request {
        id: 42,
        call: Request::SendUpdate { data: vec![0u8; 280] },
    };

    c.bench_function("frame_encode_send_update", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = Frame::Event(ServerEvent::Update(UpdateRecord {
        id: UpdateId(7),
        data: vec![0u8; 280],
    }))
    .encode()
    .unwrap();

    c.bench_function("frame_decode_update_event", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_merge_updates(c: &mut Criterion) {
    let doc = SharedDoc::new();
    let mut updates = doc.subscribe().unwrap();
    let mut collected = Vec::new();
    for i in 0..100u32 {
        let mut txn = doc.doc().transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, i, "x");
        drop(txn);
        while let Some(update) = updates.try_recv() {
            collected.push(update.update);
        }
    }

    c.bench_function("merge_100_updates", |b| {
        b.iter(|| black_box(merge_updates(black_box(&collected)).unwrap()))
    });
}

fn bench_awareness_seal_open(c: &mut Criterion) {
    let key = RoomKey::generate();
    let peer = Uuid::new_v4();
    let msg = AwarenessMessage {
        peer_id: peer,
        clock: 1,
        state: Some(AwarenessState::new("Alice", CursorColor::from_peer(peer))),
    };

    c.bench_function("awareness_seal_open", |b| {
        b.iter(|| {
            let sealed = msg.seal(&key).unwrap();
            black_box(AwarenessMessage::open(&key, &sealed).unwrap());
        })
    });
}

fn bench_presence_apply_100_peers(c: &mut Criterion) {
    let messages: Vec<AwarenessMessage> = (0..100)
        .map(|i| {
            let peer = Uuid::new_v4();
            AwarenessMessage {
                peer_id: peer,
                clock: 1,
                state: Some(AwarenessState::new(format!("User {i}"), CursorColor::from_peer(peer))),
            }
        })
        .collect();

    c.bench_function("presence_apply_100_peers", |b| {
        b.iter(|| {
            let mut registry = PresenceRegistry::new(Uuid::new_v4());
            for msg in &messages {
                registry.apply(msg.clone());
            }
            black_box(registry.len());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let receivers: Vec<_> = rt.block_on(async {
        let mut rx = Vec::new();
        for i in 0..100 {
            rx.push(group.add_member(RoomMember::new(format!("Peer {i}"), MemberRole::Editor)).await);
        }
        rx
    });

    c.bench_function("broadcast_update_100_members", |b| {
        b.iter(|| {
            let event = ServerEvent::Update(UpdateRecord {
                id: UpdateId(1),
                data: vec![0u8; 64],
            });
            black_box(group.broadcast_event(None, event).unwrap());
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_encrypt_update,
    bench_decrypt_update,
    bench_frame_encode,
    bench_frame_decode,
    bench_merge_updates,
    bench_awareness_seal_open,
    bench_presence_apply_100_peers,
    bench_broadcast_fan_out,
);
criterion_main!(benches);
