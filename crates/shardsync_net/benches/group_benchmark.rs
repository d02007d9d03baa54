//! # Packet Group Benchmark
//!
//! Compares building one group and finalizing it once against
//! serializing and compressing the same packets per recipient.

#![allow(dead_code)]
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardsync_net::{write_packet, Compressor, GroupMode, Lz4Compressor, OutgoingPacket, PacketGroupPool, PacketWriter};

struct Move {
    serial: u32,
    x: u16,
    y: u16,
    z: i8,
    facing: u8,
}

impl OutgoingPacket for Move {
    fn id(&self) -> u8 {
        0x77
    }

    fn write_body(&self, writer: &mut PacketWriter<'_>) {
        writer.write_u32(self.serial);
        writer.write_u16(self.x);
        writer.write_u16(self.y);
        writer.write_i8(self.z);
        writer.write_u8(self.facing);
    }
}

fn moves(count: usize) -> Vec<Move> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|i| Move {
            serial: u32::try_from(i).unwrap_or(u32::MAX),
            x: rng.gen_range(0..6144),
            y: rng.gen_range(0..4096),
            z: rng.gen_range(-20..60),
            facing: rng.gen_range(0..8),
        })
        .collect()
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let pool = PacketGroupPool::default();
    let packets = moves(32);
    let lz4: &dyn Compressor = &Lz4Compressor;

    for recipients in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("packet_group", recipients), &recipients, |b, &n| {
            b.iter(|| {
                let pg = pool.acquire(GroupMode::SingleUse);
                for p in &packets {
                    let _ = pg.add_packet(p);
                }
                let mut tickets = Vec::with_capacity(n);
                for _ in 0..n {
                    if let Ok(ticket) = pg.begin_send() {
                        let _ = ticket.group().with_final_bytes(Some(lz4), |bytes| black_box(bytes.len()));
                        tickets.push(ticket);
                    }
                }
                drop(tickets);
            });
        });

        group.bench_with_input(BenchmarkId::new("per_recipient", recipients), &recipients, |b, &n| {
            let mut raw = Vec::with_capacity(1024);
            let mut out = Vec::with_capacity(2048);
            b.iter(|| {
                for _ in 0..n {
                    raw.clear();
                    out.clear();
                    for p in &packets {
                        write_packet(p, &mut raw).unwrap();
                    }
                    let _ = Lz4Compressor.compress(&raw, &mut out);
                    black_box(out.len());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out);
criterion_main!(benches);
