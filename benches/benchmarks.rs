//! Performance benchmarks for the wsd protocol engine.
//!
//! Run with: `cargo bench`

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use wsd::config::Limits;
use wsd::connection::Role;
use wsd::protocol::{
    Frame, FrameDecoder, HandshakeRequest, MessageAssembler, OpCode, apply_mask, apply_mask_fast,
    compute_accept_key, decode, encode, encode_with_mask,
};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

const SIZES: [(&str, usize); 3] = [("10b", 10), ("1kb", 1024), ("64kb", 64 * 1024)];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (name, size) in SIZES {
        let payload = vec![0xAB; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}_unmasked", name), |b| {
            b.iter(|| encode(black_box(&payload), OpCode::Binary, false, true))
        });
        group.bench_function(format!("{}_masked", name), |b| {
            b.iter(|| encode_with_mask(black_box(&payload), OpCode::Binary, Some(MASK), true))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let decoder = FrameDecoder::new(Role::Server, Limits::default(), false);

    for (name, size) in SIZES {
        let unmasked = encode(&vec![0xAB; size], OpCode::Binary, false, true);
        let masked = encode_with_mask(&vec![0xAB; size], OpCode::Binary, Some(MASK), true);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}_unmasked", name), |b| {
            b.iter(|| decode(black_box(&unmasked)))
        });
        group.bench_function(format!("{}_masked_validated", name), |b| {
            b.iter(|| decoder.decode(black_box(&masked)))
        });
    }

    // A short buffer should be rejected from the header alone.
    let partial = &encode(&vec![0u8; 64 * 1024], OpCode::Binary, true, true)[..100];
    group.bench_function("short_buffer", |b| {
        b.iter(|| decoder.decode(black_box(partial)))
    });

    group.finish();
}

fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("masking");

    for (name, size) in SIZES {
        let mut data = vec![0xAB; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}_bytewise", name), |b| {
            b.iter(|| apply_mask(black_box(&mut data), MASK))
        });
        group.bench_function(format!("{}_wordwise", name), |b| {
            b.iter(|| apply_mask_fast(black_box(&mut data), MASK))
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");

    group.bench_function("accept_key", |b| {
        b.iter(|| compute_accept_key(black_box("dGhlIHNhbXBsZSBub25jZQ==")))
    });

    let request = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\r\n";
    group.bench_function("parse_request", |b| {
        b.iter(|| HandshakeRequest::parse(black_box(request)))
    });

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let chunk = vec![b'a'; 1024];
    group.throughput(Throughput::Bytes(16 * 1024));

    group.bench_function("16_fragments_text", |b| {
        b.iter(|| {
            let mut assembler = MessageAssembler::new(Limits::default());
            for i in 0..16 {
                let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
                let frame = Frame::new(i == 15, opcode, chunk.clone());
                if let Some(message) = assembler.push(frame).unwrap() {
                    return message;
                }
            }
            unreachable!("last fragment completes the message")
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_masking,
    bench_handshake,
    bench_reassembly
);
criterion_main!(benches);
