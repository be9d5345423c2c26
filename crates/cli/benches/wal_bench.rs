use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::tempdir;
use wal::{WalFrame, WalOp, WalReader, WalWriter};

const FRAMES: u64 = 2_000;
const VAL_SIZE: usize = 100;

fn put_frame(seq: u64, ops: usize) -> WalFrame {
    WalFrame {
        seq,
        ops: (0..ops)
            .map(|i| WalOp::Put {
                key: format!("k{seq}-{i}").into_bytes(),
                value: vec![b'x'; VAL_SIZE],
                user_meta: 0,
                expires_at: 0,
            })
            .collect(),
    }
}

fn wal_append_single_op(c: &mut Criterion) {
    for sync in [false, true] {
        let frames = if sync { 200 } else { FRAMES };
        c.bench_function(&format!("wal_append_1op_sync_{sync}"), |b| {
            b.iter_batched(
                || {
                    let dir = tempdir().unwrap();
                    let w = WalWriter::create(dir.path().join("wal.log"), sync).unwrap();
                    (dir, w)
                },
                |(_dir, mut w)| {
                    for seq in 1..=frames {
                        w.append(&put_frame(seq, 1)).unwrap();
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
}

fn wal_append_batched_deletes(c: &mut Criterion) {
    c.bench_function("wal_append_del_batch_16", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let w = WalWriter::create(dir.path().join("wal.log"), false).unwrap();
                (dir, w)
            },
            |(_dir, mut w)| {
                for seq in 1..=FRAMES {
                    let frame = WalFrame {
                        seq,
                        ops: (0..16)
                            .map(|i| WalOp::Del {
                                key: format!("k{seq}-{i}").into_bytes(),
                            })
                            .collect(),
                    };
                    w.append(&frame).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn wal_replay(c: &mut Criterion) {
    c.bench_function("wal_replay_2k_frames", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("wal.log");
                let mut w = WalWriter::create(&path, false).unwrap();
                for seq in 1..=FRAMES {
                    w.append(&put_frame(seq, 4)).unwrap();
                }
                w.sync().unwrap();
                (dir, path)
            },
            |(_dir, path)| {
                let mut ops = 0usize;
                let frames = WalReader::open(&path)
                    .unwrap()
                    .replay(|frame| ops += frame.ops.len())
                    .unwrap();
                assert_eq!(frames as u64, FRAMES);
                assert_eq!(ops as u64, FRAMES * 4);
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    wal_append_single_op,
    wal_append_batched_deletes,
    wal_replay,
);

criterion_main!(benches);
