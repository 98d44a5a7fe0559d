use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use syncpad_collab::edit::{diff, EditOperation};
use syncpad_collab::protocol::{ClientMessage, ParticipantInfo, RemoteEdit, ServerMessage};
use syncpad_collab::registry::{Participant, SessionRegistry};
use syncpad_collab::storage::MemoryStore;
use syncpad_collab::sync::{EditSink, SyncController};

/// A few paragraphs of mixed-width text.
fn sample_note() -> String {
    "The quick brown fox jumps over the lazy dog. Ünïcödé ✓ text.\n".repeat(200)
}

struct NullSink;

impl EditSink for NullSink {
    fn send_edit(&self, _op: &EditOperation) -> bool {
        true
    }

    fn send_cursor(&self, _position: usize, _selection_end: usize) -> bool {
        true
    }
}

fn bench_apply_insert(c: &mut Criterion) {
    let note = sample_note();
    let op = EditOperation::insert(6_000, "inserted");

    c.bench_function("apply_insert_12KB", |b| {
        b.iter(|| black_box(op.apply(black_box(&note))))
    });
}

fn bench_apply_out_of_range(c: &mut Criterion) {
    let note = sample_note();
    let op = EditOperation::replace(11_000, "tail", 5_000);

    c.bench_function("apply_clamped_replace_12KB", |b| {
        b.iter(|| black_box(op.apply(black_box(&note))))
    });
}

fn bench_diff_single_keystroke(c: &mut Criterion) {
    let old = sample_note();
    let mut new = old.clone();
    let at = old.char_indices().nth(6_000).map(|(i, _)| i).unwrap();
    new.insert(at, 'x');

    c.bench_function("diff_keystroke_12KB", |b| {
        b.iter(|| black_box(diff(black_box(&old), black_box(&new), Some(6_001))))
    });
}

fn bench_diff_repeated_run(c: &mut Criterion) {
    let old = "a".repeat(4_000);
    let new = "a".repeat(4_001);

    c.bench_function("diff_repeated_run_4K", |b| {
        b.iter(|| black_box(diff(black_box(&old), black_box(&new), Some(2_000))))
    });
}

fn bench_edit_encode(c: &mut Criterion) {
    let msg = ClientMessage::edit(&EditOperation::replace(120, "hello", 3));

    c.bench_function("client_edit_encode", |b| {
        b.iter(|| black_box(msg.to_json().unwrap()))
    });
}

fn bench_remote_edit_parse(c: &mut Criterion) {
    let author = ParticipantInfo::new("u-1", "Ann");
    let msg = ServerMessage::Edit(RemoteEdit::new(&EditOperation::insert(42, "word"), &author, 7));
    let encoded = msg.to_json().unwrap();

    c.bench_function("remote_edit_parse", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(&encoded)).unwrap()))
    });
}

fn bench_user_list_encode(c: &mut Criterion) {
    let users = (0..100)
        .map(|i| ParticipantInfo::new(format!("u-{i}"), format!("User {i}")))
        .collect();
    let msg = ServerMessage::UserList { users };

    c.bench_function("user_list_encode_100", |b| {
        b.iter(|| black_box(msg.to_json().unwrap()))
    });
}

fn bench_controller_typing(c: &mut Criterion) {
    let sink = NullSink;

    c.bench_function("controller_type_100_chars", |b| {
        b.iter(|| {
            let mut controller = SyncController::new("n", "u", true, true);
            controller.apply_snapshot(&sample_note(), None);
            let mut content = controller.content().to_string();
            for _ in 0..100 {
                content.push('z');
                let cursor = content.chars().count();
                black_box(controller.local_edit(&content, Some(cursor), &sink).unwrap());
            }
        })
    });
}

fn bench_session_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("apply_edit_100_participants", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), 1024, 200);

                // Add 100 participants
                let mut receivers = Vec::new();
                let mut session = None;
                for i in 0..100 {
                    let participant = Participant::new(format!("u-{i}"), format!("User {i}"));
                    let (joined, rx) = registry.join("bench", participant).await.unwrap();
                    receivers.push(rx);
                    session = Some(joined);
                }

                let session = session.unwrap();
                let author = Participant::new("u-0", "User 0");
                let applied = session
                    .apply_edit(&author, black_box(&EditOperation::insert(0, "x")))
                    .await
                    .unwrap();
                black_box(applied);
            });
        })
    });
}

fn bench_session_1000_edits(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("apply_1000_edits_10_participants", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), 2048, 20);

                let mut receivers = Vec::new();
                let author = Participant::new("u-0", "User 0");
                let (session, rx) = registry.join("bench", author.clone()).await.unwrap();
                receivers.push(rx);
                for i in 1..10 {
                    let participant = Participant::new(format!("u-{i}"), format!("User {i}"));
                    let (_, rx) = registry.join("bench", participant).await.unwrap();
                    receivers.push(rx);
                }

                // Apply 1000 edits
                for i in 0..1000usize {
                    let op = EditOperation::insert(i, "y");
                    session.apply_edit(&author, black_box(&op)).await.unwrap();
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_apply_insert,
    bench_apply_out_of_range,
    bench_diff_single_keystroke,
    bench_diff_repeated_run,
    bench_edit_encode,
    bench_remote_edit_parse,
    bench_user_list_encode,
    bench_controller_typing,
    bench_session_fanout,
    bench_session_1000_edits,
);

criterion_main!(benches);
