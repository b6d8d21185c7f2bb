// Criterion benchmarks for the ajplb-common protocol layer
//
// Run benchmarks with:
//   cargo bench -p ajplb-common
//
// For detailed output with plots:
//   cargo bench -p ajplb-common -- --save-baseline main

use ajplb_common::protocol::codes::AJP13_SW_HEADER;
use ajplb_common::{ForwardRequest, MessageBuffer, ReplyPacket};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn sample_request(headers: usize) -> ForwardRequest {
    let mut request = ForwardRequest::new("GET", "/app/index.jsp;jsessionid=ABCDEF.node1?x=1")
        .with_header("Host", "example.com")
        .with_header("User-Agent", "bench/1.0")
        .with_header("Cookie", "JSESSIONID=ABCDEF.node1");
    for i in 0..headers {
        request = request.with_header(format!("X-Bench-{}", i), "value");
    }
    request.route = Some("node1".into());
    request
}

fn bench_append_fields(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_fields");

    group.bench_function("ints_and_strings", |b| {
        let mut msg = MessageBuffer::default();
        b.iter(|| {
            msg.reset();
            for i in 0..64u16 {
                msg.append_u16(black_box(i)).unwrap();
                msg.append_str(black_box("header-value")).unwrap();
            }
            msg.seal(0x1234);
        });
    });

    group.finish();
}

fn bench_forward_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_request_encode");

    for headers in [0usize, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(headers), headers, |b, &n| {
            let request = sample_request(n);
            let mut msg = MessageBuffer::default();
            b.iter(|| black_box(&request).encode(&mut msg).unwrap());
        });
    }

    group.finish();
}

fn bench_reply_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_decode");

    let headers = ReplyPacket::SendHeaders {
        status: 200,
        reason: "OK".into(),
        headers: (0..20)
            .map(|i| (format!("X-Reply-{}", i), "v".to_string()))
            .chain(std::iter::once(("Content-Type".to_string(), "text/html".to_string())))
            .collect(),
    };
    let mut encoded = MessageBuffer::default();
    headers.encode(&mut encoded).unwrap();

    group.bench_function("send_headers_20", |b| {
        let mut msg = MessageBuffer::default();
        b.iter(|| {
            encoded.copy_into(&mut msg).unwrap();
            msg.accept_header(AJP13_SW_HEADER).unwrap();
            black_box(ReplyPacket::decode(&mut msg).unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_append_fields,
    bench_forward_request_encode,
    bench_reply_decode
);
criterion_main!(benches);
